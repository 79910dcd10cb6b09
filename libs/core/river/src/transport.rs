//! Broker transport contract.
//!
//! The connection, worker, and supervision state machines are written
//! against these traits rather than a concrete client so they can run
//! against a real broker (`AmqpTransport`) or entirely in memory
//! (`MemoryTransport`). The contract mirrors what a topic broker
//! provides: sessions, channels with optional prefetch, durable topic
//! exchanges, durable queues with TTL/dead-letter arguments, bindings,
//! non-blocking polls, and ack/reject.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Error raised by a transport backend.
///
/// The `Connection`/`Protocol`/`Timeout` variants form the
/// connection-level category: the retry policy reconnects and backs off
/// on them, and the worker treats them as infrastructure failures.
/// `Broker` covers broker-reported operation errors (unknown queue,
/// precondition failures) which are not retried.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Session or socket level failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Wire protocol violation reported by the client or broker.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Broker refused an operation on an open connection.
    #[error("broker error: {0}")]
    Broker(String),
}

impl TransportError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker(message.into())
    }

    /// Whether this error belongs to the connection-level category that
    /// warrants tearing down the session and reconnecting.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_) | TransportError::Protocol(_) | TransportError::Timeout(_)
        )
    }
}

/// A single delivery taken off a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag used for ack/reject.
    pub delivery_tag: u64,

    /// Routing key the message was published with.
    pub routing_key: String,

    /// Raw message body.
    pub payload: Vec<u8>,
}

/// Broker-level arguments applied at queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// Per-message TTL.
    pub message_ttl: Option<Duration>,

    /// Exchange rejected messages are republished to.
    pub dead_letter_exchange: Option<String>,

    /// Routing key rejected messages are republished with.
    pub dead_letter_routing_key: Option<String>,
}

/// Factory for broker sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    type Session: Session<Channel = Self::Channel> + 'static;
    type Channel: Channel;

    /// Open a new session against the broker at `url`.
    async fn open(&self, url: &str) -> Result<Self::Session, TransportError>;
}

/// An open broker session owning zero or more channels.
#[async_trait]
pub trait Session: Send + Sync {
    type Channel: Channel;

    /// Create a channel, optionally limiting unacknowledged deliveries.
    async fn create_channel(&self, prefetch: Option<u16>) -> Result<Self::Channel, TransportError>;

    /// Close the session.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A broker channel: the unit all queue and exchange operations run on.
///
/// Channels are `Clone` so a queue handle and the message envelopes it
/// produces can keep acknowledging after the owning connection manager
/// has moved on.
#[async_trait]
pub trait Channel: Clone + Send + Sync + 'static {
    /// Declare a durable topic exchange.
    async fn declare_exchange(&self, name: &str) -> Result<(), TransportError>;

    /// Declare a durable queue with the given broker arguments.
    async fn declare_queue(
        &self,
        name: &str,
        arguments: &QueueArguments,
    ) -> Result<(), TransportError>;

    /// Bind a queue to an exchange under a routing-key pattern.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Publish a message to an exchange.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(), TransportError>;

    /// Take at most one pending delivery off a queue without blocking.
    async fn poll(&self, queue: &str) -> Result<Option<Delivery>, TransportError>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Reject a delivery, optionally requeueing it.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    /// Close the channel.
    async fn close(&self) -> Result<(), TransportError>;
}
