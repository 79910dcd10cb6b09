//! Message envelope with exactly-once acknowledgment.

use crate::error::RiverError;
use crate::transport::{Channel, Delivery, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Acknowledgment surface of a channel, type-erased so `Message` and
/// `Handler` do not carry the transport type parameter.
#[async_trait]
pub(crate) trait Acker: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;
}

#[async_trait]
impl<C: Channel> Acker for C {
    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        Channel::ack(self, delivery_tag).await
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        Channel::reject(self, delivery_tag, requeue).await
    }
}

/// A delivery wrapped with its parsed payload and acknowledgment state.
///
/// The payload is parsed eagerly at construction; a body that is not
/// valid JSON yields [`RiverError::InvalidPayload`] and no message. At
/// most one `ack`/`nack` call has effect; later calls are no-ops.
pub struct Message {
    payload: Value,
    delivery_tag: u64,
    routing_key: String,
    requeue_on_nack: bool,
    replied: AtomicBool,
    acker: Arc<dyn Acker>,
}

impl Message {
    pub(crate) fn new(
        delivery: Delivery,
        acker: Arc<dyn Acker>,
        requeue_on_nack: bool,
    ) -> Result<Self, RiverError> {
        let payload = serde_json::from_slice(&delivery.payload)
            .map_err(|e| RiverError::invalid_payload(e.to_string(), &delivery.payload))?;
        Ok(Self {
            payload,
            delivery_tag: delivery.delivery_tag,
            routing_key: delivery.routing_key,
            requeue_on_nack,
            replied: AtomicBool::new(false),
            acker,
        })
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Whether the message has already been acknowledged or rejected.
    pub fn replied(&self) -> bool {
        self.replied.load(Ordering::SeqCst)
    }

    /// Acknowledge the delivery. A no-op after the first successful
    /// ack or nack.
    pub async fn ack(&self) -> Result<(), TransportError> {
        if self.replied() {
            return Ok(());
        }
        self.acker.ack(self.delivery_tag).await?;
        self.replied.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Reject the delivery. Requeues when the owning queue has no
    /// dead-letter routing key configured; otherwise leaves requeueing
    /// off so the broker's dead-letter policy takes over. A no-op after
    /// the first successful ack or nack.
    pub async fn nack(&self) -> Result<(), TransportError> {
        if self.replied() {
            return Ok(());
        }
        self.acker
            .reject(self.delivery_tag, self.requeue_on_nack)
            .await?;
        self.replied.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("payload", &self.payload)
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("replied", &self.replied())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct CountingAcker {
        acks: AtomicU32,
        rejects: AtomicU32,
        last_requeue: AtomicBool,
    }

    #[async_trait]
    impl Acker for CountingAcker {
        async fn ack(&self, _delivery_tag: u64) -> Result<(), TransportError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reject(&self, _delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
            self.rejects.fetch_add(1, Ordering::SeqCst);
            self.last_requeue.store(requeue, Ordering::SeqCst);
            Ok(())
        }
    }

    fn delivery(payload: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: 7,
            routing_key: "smile._.thing._.area51".to_string(),
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn parses_payload_eagerly() {
        let acker = Arc::new(CountingAcker::default());
        let message = Message::new(delivery(br#"{"answer":42}"#), acker, true).unwrap();
        assert_eq!(message.payload()["answer"], 42);
        assert_eq!(message.delivery_tag(), 7);
    }

    #[tokio::test]
    async fn construction_fails_on_malformed_payload() {
        let acker = Arc::new(CountingAcker::default());
        let error = Message::new(delivery(b"not json"), acker, true).unwrap_err();
        match error {
            RiverError::InvalidPayload { content, .. } => assert_eq!(content, "not json"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn ack_has_effect_only_once() {
        let acker = Arc::new(CountingAcker::default());
        let message = Message::new(delivery(b"{}"), Arc::clone(&acker) as Arc<dyn Acker>, true)
            .unwrap();

        message.ack().await.unwrap();
        message.ack().await.unwrap();
        message.nack().await.unwrap();

        assert_eq!(acker.acks.load(Ordering::SeqCst), 1);
        assert_eq!(acker.rejects.load(Ordering::SeqCst), 0);
        assert!(message.replied());
    }

    #[tokio::test]
    async fn nack_has_effect_only_once() {
        let acker = Arc::new(CountingAcker::default());
        let message = Message::new(delivery(b"{}"), Arc::clone(&acker) as Arc<dyn Acker>, true)
            .unwrap();

        message.nack().await.unwrap();
        message.nack().await.unwrap();
        message.ack().await.unwrap();

        assert_eq!(acker.rejects.load(Ordering::SeqCst), 1);
        assert_eq!(acker.acks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn nack_requeues_only_without_a_dead_letter_target() {
        let acker = Arc::new(CountingAcker::default());
        let message = Message::new(delivery(b"{}"), Arc::clone(&acker) as Arc<dyn Acker>, true)
            .unwrap();
        message.nack().await.unwrap();
        assert!(acker.last_requeue.load(Ordering::SeqCst));

        let acker = Arc::new(CountingAcker::default());
        let message = Message::new(delivery(b"{}"), Arc::clone(&acker) as Arc<dyn Acker>, false)
            .unwrap();
        message.nack().await.unwrap();
        assert!(!acker.last_requeue.load(Ordering::SeqCst));
    }
}
