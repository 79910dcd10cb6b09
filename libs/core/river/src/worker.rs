//! Queue worker.
//!
//! Polls one bound queue, wraps deliveries in [`Message`] envelopes,
//! invokes a [`Handler`], and manages acknowledgment, reconnection, and
//! error backoff. Nothing escapes the run loop: every failure path ends
//! in a logged, rate-limited continuation.

use crate::config::{QueueSpec, RiverConfig};
use crate::error::HandlerError;
use crate::message::Message;
use crate::metrics;
use crate::rate_limiter::RateLimiter;
use crate::river::{BoundQueue, River};
use crate::transport::{Channel, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

const IDLE_DELAY: Duration = Duration::from_secs(1);
const SUSPENDED_DELAY: Duration = Duration::from_secs(5);

/// What a handler decided about a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The message was handled; under managed acking it is acked.
    Handled,

    /// The message was refused; under managed acking it is nacked.
    Rejected,
}

/// A message handler.
///
/// `call` is required; `should_run` and `on_idle` are optional
/// capabilities with no-op defaults. Report broker trouble as
/// [`HandlerError::Connection`] (or just use `?` on a transport error)
/// to trigger the worker's reconnect path instead of the generic
/// exception callback.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one message.
    async fn call(&self, message: &Message) -> Result<Outcome, HandlerError>;

    /// Handler name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Gate polling: while false the worker sleeps instead of polling.
    fn should_run(&self) -> bool {
        true
    }

    /// Invoked after an empty poll. Errors are routed exactly like
    /// handler errors.
    async fn on_idle(&self) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Callback invoked with handler errors, on the channel matching the
/// error's category.
pub type ErrorCallback = Arc<dyn Fn(&HandlerError) + Send + Sync>;

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// When true (the default) the worker acks or nacks based on the
    /// handler outcome. When false the handler owns acknowledgment.
    pub managed_acking: bool,

    /// Error-path rate limit: tokens per window.
    pub error_rate: f64,

    /// Error-path rate limit window.
    pub error_window: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            managed_acking: true,
            error_rate: RateLimiter::DEFAULT_RATE,
            error_window: RateLimiter::DEFAULT_WINDOW,
        }
    }
}

enum Polled {
    Handled,
    Empty,
    Errored,
}

/// A single-queue worker loop.
pub struct Worker<T: Transport> {
    river: River<T>,
    handler: Arc<dyn Handler>,
    queue_spec: QueueSpec,
    queue: Option<BoundQueue<T::Channel>>,
    options: WorkerOptions,
    on_exception: Option<ErrorCallback>,
    on_connection_error: Option<ErrorCallback>,
    limiter: RateLimiter,
    next_event_at: Instant,
    consumer_id: String,
}

impl<T: Transport> Worker<T> {
    pub fn new(river: River<T>, handler: Arc<dyn Handler>, queue_spec: QueueSpec) -> Self {
        let options = WorkerOptions::default();
        Self {
            river,
            handler,
            queue_spec,
            queue: None,
            limiter: RateLimiter::new(options.error_rate, options.error_window),
            options,
            on_exception: None,
            on_connection_error: None,
            next_event_at: Instant::now(),
            consumer_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    /// Convenience for building a worker with its own connection.
    pub fn from_config(
        transport: T,
        config: RiverConfig,
        handler: Arc<dyn Handler>,
        queue_spec: QueueSpec,
    ) -> Self {
        Self::new(River::new(transport, config), handler, queue_spec)
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.limiter = RateLimiter::new(options.error_rate, options.error_window);
        self.options = options;
        self
    }

    pub fn with_managed_acking(mut self, managed_acking: bool) -> Self {
        self.options.managed_acking = managed_acking;
        self
    }

    /// Callback for generic handler failures.
    pub fn on_exception(mut self, callback: ErrorCallback) -> Self {
        self.on_exception = Some(callback);
        self
    }

    /// Callback for connection-level failures. Kept separate from
    /// `on_exception`: connection errors never reach the generic
    /// callback.
    pub fn on_connection_error(mut self, callback: ErrorCallback) -> Self {
        self.on_connection_error = Some(callback);
        self
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn connected(&self) -> bool {
        self.river.connected()
    }

    /// Run until the shutdown watch flips. Stop takes effect at the top
    /// of the next iteration; an in-flight handler call is never
    /// interrupted.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = %self.queue_spec.name,
            handler = %self.handler.name(),
            consumer_id = %self.consumer_id,
            "starting worker"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.next_event_at > Instant::now() {
                tokio::select! {
                    changed = shutdown.changed() => {
                        // A dropped sender counts as a stop request.
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = tokio::time::sleep_until(self.next_event_at) => {}
                }
            }
            self.tick().await;
        }
        self.drop_queue().await;
        self.river.disconnect().await;
        info!(queue = %self.queue_spec.name, consumer_id = %self.consumer_id, "worker stopped");
    }

    /// One iteration of the loop: wait out the schedule, then poll and
    /// process at most one delivery.
    pub async fn run_once(&mut self) {
        if self.next_event_at > Instant::now() {
            tokio::time::sleep_until(self.next_event_at).await;
        }
        self.tick().await;
    }

    async fn tick(&mut self) {
        if !self.handler.should_run() {
            self.next_event_at = Instant::now() + SUSPENDED_DELAY;
            return;
        }
        match self.process_next().await {
            Polled::Handled | Polled::Errored => {
                // Drain bursts quickly; error paths already paid the
                // rate limiter.
                self.next_event_at = Instant::now();
            }
            Polled::Empty => {
                if let Err(e) = self.handler.on_idle().await {
                    self.dispatch_failure(e, None).await;
                    self.next_event_at = Instant::now();
                } else {
                    self.next_event_at = Instant::now() + IDLE_DELAY;
                }
            }
        }
    }

    async fn process_next(&mut self) -> Polled {
        let queue = match self.ensure_queue().await {
            Ok(queue) => queue,
            Err(e) => {
                self.dispatch_failure(e, None).await;
                return Polled::Errored;
            }
        };

        let delivery = match queue.poll().await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return Polled::Empty,
            Err(e) => {
                self.dispatch_failure(e.into(), None).await;
                return Polled::Errored;
            }
        };

        let delivery_tag = delivery.delivery_tag;
        let acker = Arc::new(queue.channel().clone());
        let message = match Message::new(delivery, acker, !queue.dead_lettered()) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    queue = %self.queue_spec.name,
                    error = %e,
                    "rejecting message with invalid payload"
                );
                metrics::record_message(&self.queue_spec.name, "invalid");
                if let Err(reject_error) = queue.channel().reject(delivery_tag, false).await {
                    warn!(error = %reject_error, "failed to reject invalid message");
                }
                return Polled::Handled;
            }
        };

        match self.handler.call(&message).await {
            Ok(outcome) => {
                if self.options.managed_acking {
                    self.settle(&message, outcome).await;
                }
                Polled::Handled
            }
            Err(e) => {
                self.dispatch_failure(e, Some(&message)).await;
                Polled::Errored
            }
        }
    }

    async fn settle(&self, message: &Message, outcome: Outcome) {
        match outcome {
            Outcome::Rejected => {
                if let Err(e) = message.nack().await {
                    warn!(queue = %self.queue_spec.name, error = %e, "failed to nack message");
                }
                metrics::record_message(&self.queue_spec.name, "rejected");
            }
            Outcome::Handled => {
                if let Err(e) = message.ack().await {
                    warn!(queue = %self.queue_spec.name, error = %e, "failed to ack message");
                }
                metrics::record_message(&self.queue_spec.name, "acked");
            }
        }
    }

    /// Route a failure down its channel. Connection-level errors force
    /// a full reconnect on the next poll and never reach the generic
    /// exception callback. Both channels end in the rate limiter.
    async fn dispatch_failure(&mut self, failure: HandlerError, message: Option<&Message>) {
        if failure.is_connection_error() {
            warn!(
                queue = %self.queue_spec.name,
                error = %failure,
                "connection error, dropping queue and reconnecting"
            );
            metrics::record_worker_error(&self.queue_spec.name, "connection");
            self.drop_queue().await;
            self.river.disconnect().await;
            if let Some(callback) = &self.on_connection_error {
                callback(&failure);
            }
        } else {
            error!(
                queue = %self.queue_spec.name,
                handler = %self.handler.name(),
                error = %failure,
                "handler failed"
            );
            metrics::record_worker_error(&self.queue_spec.name, "handler");
            if self.options.managed_acking {
                if let Some(message) = message {
                    if let Err(e) = message.nack().await {
                        warn!(error = %e, "failed to nack message after handler failure");
                    }
                }
            }
            if let Some(callback) = &self.on_exception {
                callback(&failure);
            }
        }
        self.limiter.increment().await;
    }

    async fn ensure_queue(&mut self) -> Result<BoundQueue<T::Channel>, HandlerError> {
        if let Some(queue) = &self.queue {
            return Ok(queue.clone());
        }
        let queue = self.river.queue(&self.queue_spec).await?;
        self.queue = Some(queue.clone());
        Ok(queue)
    }

    async fn drop_queue(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiverConfig;
    use crate::memory::MemoryTransport;
    use crate::river::PublishOptions;
    use crate::transport::TransportError;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Script {
        calls: AtomicU32,
        idles: AtomicU32,
        payloads: Mutex<Vec<Value>>,
        outcome: Mutex<Option<Outcome>>,
        fail_with: Mutex<Option<HandlerError>>,
        suspended: AtomicBool,
    }

    struct ScriptedHandler(Arc<Script>);

    #[async_trait]
    impl Handler for ScriptedHandler {
        async fn call(&self, message: &Message) -> Result<Outcome, HandlerError> {
            self.0.calls.fetch_add(1, Ordering::SeqCst);
            self.0.payloads.lock().unwrap().push(message.payload().clone());
            if let Some(failure) = self.0.fail_with.lock().unwrap().take() {
                return Err(failure);
            }
            Ok(self.0.outcome.lock().unwrap().unwrap_or(Outcome::Handled))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn should_run(&self) -> bool {
            !self.0.suspended.load(Ordering::SeqCst)
        }

        async fn on_idle(&self) -> Result<(), HandlerError> {
            self.0.idles.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn worker(
        transport: &MemoryTransport,
        spec: QueueSpec,
    ) -> (Worker<MemoryTransport>, Arc<Script>) {
        let script = Arc::new(Script::default());
        let handler = Arc::new(ScriptedHandler(Arc::clone(&script)));
        let river = River::new(transport.clone(), RiverConfig::new("test"));
        (Worker::new(river, handler, spec), script)
    }

    async fn seed(transport: &MemoryTransport, spec: &QueueSpec, event: &str, uid: &str) {
        let mut river = River::new(transport.clone(), RiverConfig::new("test"));
        river.queue(spec).await.unwrap();
        river
            .publish(&PublishOptions::new(event, uid))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn successful_handler_acks_exactly_once() {
        let transport = MemoryTransport::new();
        let spec = QueueSpec::new("work");
        seed(&transport, &spec, "smile", "thing:rspec$1").await;

        let (mut worker, script) = worker(&transport, spec);
        worker.run_once().await;

        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
        assert_eq!(script.payloads.lock().unwrap()[0]["uid"], "thing:rspec$1");
        assert_eq!(transport.message_count("work"), 0);
        assert_eq!(transport.unacked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_outcome_nacks_and_never_acks() {
        let transport = MemoryTransport::new();
        let spec = QueueSpec::new("work");
        seed(&transport, &spec, "smile", "thing:rspec$1").await;

        let (mut worker, script) = worker(&transport, spec);
        *script.outcome.lock().unwrap() = Some(Outcome::Rejected);
        worker.run_once().await;

        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
        // No dead-letter target, so the reject requeues.
        assert_eq!(transport.message_count("work"), 1);
        assert_eq!(transport.unacked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_outcome_dead_letters_when_configured() {
        let transport = MemoryTransport::new();
        let spec = QueueSpec::new("work").with_dead_letter_routing_key("work.failures");
        seed(&transport, &spec, "smile", "thing:rspec$1").await;
        {
            let mut river = River::new(transport.clone(), RiverConfig::new("test"));
            let graveyard = QueueSpec::new("graveyard").with_routing_key("work.failures");
            river.queue(&graveyard).await.unwrap();
        }

        let (mut worker, script) = worker(&transport, spec);
        *script.outcome.lock().unwrap() = Some(Outcome::Rejected);
        worker.run_once().await;

        assert_eq!(transport.message_count("work"), 0);
        assert_eq!(transport.message_count("graveyard"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unmanaged_acking_leaves_settlement_to_the_handler() {
        let transport = MemoryTransport::new();
        let spec = QueueSpec::new("work");
        seed(&transport, &spec, "smile", "thing:rspec$1").await;

        let (worker, script) = worker(&transport, spec.clone());
        let mut worker = worker.with_managed_acking(false);
        worker.run_once().await;

        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
        // Neither acked nor nacked: the delivery stays unsettled.
        assert_eq!(transport.unacked_count(), 1);
        assert_eq!(transport.message_count("work"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_payload_is_rejected_without_reaching_the_handler() {
        let transport = MemoryTransport::new();
        let spec = QueueSpec::new("work");
        {
            let mut river = River::new(transport.clone(), RiverConfig::new("test"));
            river.queue(&spec).await.unwrap();
        }
        transport.push_raw("work", b"definitely not json");

        let (mut worker, script) = worker(&transport, spec);
        worker.run_once().await;

        assert_eq!(script.calls.load(Ordering::SeqCst), 0);
        // Rejected without requeue and no dead-letter target: dropped.
        assert_eq!(transport.message_count("work"), 0);
        assert_eq!(transport.unacked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn generic_handler_error_nacks_and_invokes_the_exception_callback() {
        let transport = MemoryTransport::new();
        let spec = QueueSpec::new("work");
        seed(&transport, &spec, "smile", "thing:rspec$1").await;

        let (worker, script) = worker(&transport, spec);
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut worker = worker.on_exception(Arc::new(move |e| {
            sink.lock().unwrap().push(e.to_string());
        }));

        *script.fail_with.lock().unwrap() = Some(HandlerError::failure("boom"));
        worker.run_once().await;

        assert_eq!(seen.lock().unwrap().as_slice(), ["boom"]);
        // Nacked back onto the queue; the worker keeps running and
        // processes it again cleanly.
        assert_eq!(transport.message_count("work"), 1);
        worker.run_once().await;
        assert_eq!(script.calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.message_count("work"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_error_reconnects_and_skips_the_generic_callback() {
        let transport = MemoryTransport::new();
        let spec = QueueSpec::new("work");
        seed(&transport, &spec, "smile", "thing:rspec$1").await;

        let (worker, script) = worker(&transport, spec);
        let generic_calls = Arc::new(AtomicU32::new(0));
        let connection_calls = Arc::new(AtomicU32::new(0));
        let generic = Arc::clone(&generic_calls);
        let connection = Arc::clone(&connection_calls);
        let mut worker = worker
            .on_exception(Arc::new(move |_| {
                generic.fetch_add(1, Ordering::SeqCst);
            }))
            .on_connection_error(Arc::new(move |_| {
                connection.fetch_add(1, Ordering::SeqCst);
            }));

        *script.fail_with.lock().unwrap() = Some(HandlerError::Connection(
            TransportError::connection("reset by peer"),
        ));
        worker.run_once().await;

        assert_eq!(generic_calls.load(Ordering::SeqCst), 0);
        assert_eq!(connection_calls.load(Ordering::SeqCst), 1);
        assert!(!worker.connected());
        assert!(worker.queue.is_none());

        // The un-nacked delivery is still outstanding on the broker
        // side; the worker itself reconnects and keeps polling.
        worker.run_once().await;
        assert!(worker.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_poll_invokes_on_idle_and_backs_off_a_second() {
        let transport = MemoryTransport::new();
        let spec = QueueSpec::new("work");
        {
            let mut river = River::new(transport.clone(), RiverConfig::new("test"));
            river.queue(&spec).await.unwrap();
        }

        let (mut worker, script) = worker(&transport, spec);
        let before = Instant::now();
        worker.run_once().await;

        assert_eq!(script.idles.load(Ordering::SeqCst), 1);
        assert_eq!(worker.next_event_at - before, IDLE_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_handler_skips_polling_for_five_seconds() {
        let transport = MemoryTransport::new();
        let spec = QueueSpec::new("work");
        seed(&transport, &spec, "smile", "thing:rspec$1").await;

        let (mut worker, script) = worker(&transport, spec);
        script.suspended.store(true, Ordering::SeqCst);

        let before = Instant::now();
        worker.run_once().await;

        assert_eq!(script.calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.message_count("work"), 1);
        assert_eq!(worker.next_event_at - before, SUSPENDED_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_when_the_shutdown_watch_flips() {
        let transport = MemoryTransport::new();
        let spec = QueueSpec::new("work");
        seed(&transport, &spec, "smile", "thing:rspec$1").await;

        let (mut worker, script) = worker(&transport, spec);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            worker.run(stop_rx).await;
        });

        // Let the worker drain the queue, then stop it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.message_count("work"), 0);
    }
}
