//! In-memory transport backend.
//!
//! Implements the full transport contract against an in-process topic
//! broker: segment wildcard matching, per-queue buffers, unacked
//! tracking, requeue, and dead-letter re-routing. Used by the test
//! suite and handy for local development without a broker. Fault
//! injection hooks simulate connection-level failures so the retry
//! policy can be exercised deterministically.

use crate::transport::{
    Channel, Delivery, QueueArguments, Session, Transport, TransportError,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

#[derive(Clone)]
struct QueuedMessage {
    routing_key: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<QueuedMessage>,
    arguments: QueueArguments,
}

struct Binding {
    queue: String,
    pattern: String,
}

struct Unacked {
    queue: String,
    message: QueuedMessage,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    next_delivery_tag: u64,
    fail_connects: u32,
    fail_publishes: u32,
    publish_attempts: Vec<Instant>,
    published: u64,
}

#[derive(Default)]
struct MemoryBroker {
    state: Mutex<BrokerState>,
}

/// Transport backed by an in-process topic broker.
///
/// Clones share the same broker, so a publisher and a consumer built
/// from clones of one `MemoryTransport` see the same queues.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` session opens with a connection error.
    pub fn fail_next_connects(&self, count: u32) {
        self.broker.state.lock().unwrap().fail_connects = count;
    }

    /// Fail the next `count` publishes with a connection error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.broker.state.lock().unwrap().fail_publishes = count;
    }

    /// Instants at which publishes were attempted, successful or not.
    pub fn publish_attempts(&self) -> Vec<Instant> {
        self.broker.state.lock().unwrap().publish_attempts.clone()
    }

    /// Number of successfully published messages.
    pub fn published_count(&self) -> u64 {
        self.broker.state.lock().unwrap().published
    }

    /// Pending (undelivered) messages on a queue.
    pub fn message_count(&self, queue: &str) -> usize {
        self.broker
            .state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Deliveries taken off a queue but not yet acked or rejected.
    pub fn unacked_count(&self) -> usize {
        self.broker.state.lock().unwrap().unacked.len()
    }

    /// Push a raw body straight onto a queue, bypassing the exchange.
    pub fn push_raw(&self, queue: &str, payload: &[u8]) {
        let mut state = self.broker.state.lock().unwrap();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .messages
            .push_back(QueuedMessage {
                routing_key: String::new(),
                payload: payload.to_vec(),
            });
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Session = MemorySession;
    type Channel = MemoryChannel;

    async fn open(&self, _url: &str) -> Result<MemorySession, TransportError> {
        let mut state = self.broker.state.lock().unwrap();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(TransportError::connection("simulated connect failure"));
        }
        Ok(MemorySession {
            broker: Arc::clone(&self.broker),
        })
    }
}

pub struct MemorySession {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl Session for MemorySession {
    type Channel = MemoryChannel;

    async fn create_channel(&self, _prefetch: Option<u16>) -> Result<MemoryChannel, TransportError> {
        Ok(MemoryChannel {
            broker: Arc::clone(&self.broker),
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryChannel {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, name: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().unwrap();
        state.exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        arguments: &QueueArguments,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().unwrap();
        let queue = state.queues.entry(name.to_string()).or_default();
        queue.arguments = arguments.clone();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().unwrap();
        state
            .exchanges
            .entry(exchange.to_string())
            .or_default()
            .push(Binding {
                queue: queue.to_string(),
                pattern: routing_key.to_string(),
            });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        _persistent: bool,
    ) -> Result<(), TransportError> {
        let mut guard = self.broker.state.lock().unwrap();
        let state = &mut *guard;
        state.publish_attempts.push(Instant::now());
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(TransportError::connection("simulated publish failure"));
        }
        deliver(state, exchange, routing_key, payload.to_vec());
        state.published += 1;
        Ok(())
    }

    async fn poll(&self, queue: &str) -> Result<Option<Delivery>, TransportError> {
        let mut guard = self.broker.state.lock().unwrap();
        let state = &mut *guard;
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::broker(format!("no such queue: {queue}")))?;
        let Some(message) = queue_state.messages.pop_front() else {
            return Ok(None);
        };
        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;
        state.unacked.insert(
            delivery_tag,
            Unacked {
                queue: queue.to_string(),
                message: message.clone(),
            },
        );
        Ok(Some(Delivery {
            delivery_tag,
            routing_key: message.routing_key,
            payload: message.payload,
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().unwrap();
        state
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| TransportError::broker(format!("unknown delivery tag: {delivery_tag}")))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let mut guard = self.broker.state.lock().unwrap();
        let state = &mut *guard;
        let unacked = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| TransportError::broker(format!("unknown delivery tag: {delivery_tag}")))?;
        if requeue {
            state
                .queues
                .entry(unacked.queue)
                .or_default()
                .messages
                .push_front(unacked.message);
            return Ok(());
        }
        let arguments = state
            .queues
            .get(&unacked.queue)
            .map(|q| q.arguments.clone())
            .unwrap_or_default();
        if let (Some(exchange), Some(key)) = (
            arguments.dead_letter_exchange,
            arguments.dead_letter_routing_key,
        ) {
            deliver(state, &exchange, &key, unacked.message.payload);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Fan a message out to every queue with a matching binding. A queue
/// with several matching bindings still receives one copy.
fn deliver(state: &mut BrokerState, exchange: &str, routing_key: &str, payload: Vec<u8>) {
    let targets: Vec<String> = match state.exchanges.get(exchange) {
        Some(bindings) => {
            let mut seen = HashSet::new();
            bindings
                .iter()
                .filter(|binding| topic_matches(&binding.pattern, routing_key))
                .filter(|binding| seen.insert(binding.queue.clone()))
                .map(|binding| binding.queue.clone())
                .collect()
        }
        None => Vec::new(),
    };
    for queue in targets {
        if let Some(queue_state) = state.queues.get_mut(&queue) {
            queue_state.messages.push_back(QueuedMessage {
                routing_key: routing_key.to_string(),
                payload: payload.clone(),
            });
        }
    }
}

/// Topic-exchange matching: `.` separates segments, `*` matches exactly
/// one segment, `#` matches zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((&segment, rest)) => key.first() == Some(&segment) && matches(rest, &key[1..]),
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_matching_literals_and_wildcards() {
        assert!(topic_matches("a.b.c", "a.b.c"));
        assert!(!topic_matches("a.b.c", "a.b"));
        assert!(topic_matches("a.*.c", "a.b.c"));
        assert!(!topic_matches("a.*", "a.b.c"));
        assert!(topic_matches("a.#", "a.b.c"));
        assert!(topic_matches("a.#", "a"));
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("#.c", "a.b.c"));
        assert!(!topic_matches("#.z", "a.b.c"));
    }

    #[test]
    fn topic_matching_on_compiled_keys() {
        assert!(topic_matches("#._.#._.#", "smile._.thing._.area51.rspec"));
        assert!(topic_matches(
            "smile._.thing._.area52.*",
            "smile._.thing._.area52.one"
        ));
        assert!(!topic_matches(
            "smile._.thing._.area52.*",
            "smile._.thing._.area52.one.two"
        ));
        assert!(topic_matches(
            "smile._.thing._.area53.#",
            "smile._.thing._.area53.one.two.three"
        ));
    }

    #[tokio::test]
    async fn publish_routes_to_matching_queues_once() {
        let transport = MemoryTransport::new();
        let session = transport.open("amqp://ignored").await.unwrap();
        let channel = session.create_channel(None).await.unwrap();

        channel.declare_exchange("river.test").await.unwrap();
        channel
            .declare_queue("sink", &QueueArguments::default())
            .await
            .unwrap();
        channel.bind_queue("sink", "river.test", "a.#").await.unwrap();
        channel.bind_queue("sink", "river.test", "a.b").await.unwrap();

        channel
            .publish("river.test", "a.b", b"{}", true)
            .await
            .unwrap();

        assert_eq!(transport.message_count("sink"), 1);
    }

    #[tokio::test]
    async fn reject_without_requeue_dead_letters_when_configured() {
        let transport = MemoryTransport::new();
        let session = transport.open("amqp://ignored").await.unwrap();
        let channel = session.create_channel(None).await.unwrap();

        channel.declare_exchange("river.test").await.unwrap();
        let arguments = QueueArguments {
            message_ttl: None,
            dead_letter_exchange: Some("river.test".to_string()),
            dead_letter_routing_key: Some("failures".to_string()),
        };
        channel.declare_queue("work", &arguments).await.unwrap();
        channel
            .declare_queue("graveyard", &QueueArguments::default())
            .await
            .unwrap();
        channel
            .bind_queue("graveyard", "river.test", "failures")
            .await
            .unwrap();
        channel.bind_queue("work", "river.test", "job").await.unwrap();

        channel.publish("river.test", "job", b"{}", true).await.unwrap();
        let delivery = channel.poll("work").await.unwrap().unwrap();
        channel.reject(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(transport.message_count("work"), 0);
        assert_eq!(transport.message_count("graveyard"), 1);
        assert_eq!(transport.unacked_count(), 0);
    }

    #[tokio::test]
    async fn reject_with_requeue_returns_the_message() {
        let transport = MemoryTransport::new();
        let session = transport.open("amqp://ignored").await.unwrap();
        let channel = session.create_channel(None).await.unwrap();

        channel
            .declare_queue("work", &QueueArguments::default())
            .await
            .unwrap();
        transport.push_raw("work", b"{}");

        let delivery = channel.poll("work").await.unwrap().unwrap();
        assert_eq!(transport.message_count("work"), 0);

        channel.reject(delivery.delivery_tag, true).await.unwrap();
        assert_eq!(transport.message_count("work"), 1);
    }
}
