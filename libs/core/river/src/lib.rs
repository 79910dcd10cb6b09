//! River — topic pub/sub client and worker supervision over AMQP.
//!
//! Producers publish typed events onto a shared topic exchange;
//! consumers bind durable queues to wildcard/optional routing patterns
//! and process messages with explicit acknowledgment, automatic
//! reconnection, and supervised worker pools that replace workers when
//! they die.
//!
//! ## Features
//!
//! - **Routing compiler**: event/class/path selectors with wildcards,
//!   alternation, and optional trailing segments compile to the exact
//!   set of broker binding keys
//! - **Resilient connections**: bounded retry with capped exponential
//!   backoff around connect and publish
//! - **Exactly-once settlement**: per-message ack/nack with dead-letter
//!   routing for rejected messages
//! - **Supervision**: one pool of workers per queue, kept at strength
//!   and drained cleanly on shutdown
//! - **Pluggable transport**: `lapin`-backed AMQP in production, an
//!   in-memory topic broker for tests
//!
//! ## Example
//!
//! ```ignore
//! use river::{
//!     AmqpTransport, ListenerOptions, QueueSpec, RiverConfig, Supervisor,
//! };
//!
//! let config = RiverConfig::from_env()?;
//! let mut supervisor = Supervisor::new("grove", AmqpTransport::new(), config);
//! supervisor.add_listener(
//!     Arc::new(MyHandler),
//!     QueueSpec::new("grove.posts")
//!         .with_event("create|update")
//!         .with_class("post")
//!         .with_path("feeds.^bagera"),
//!     ListenerOptions::default(),
//! );
//! supervisor.run(shutdown_rx).await?;
//! ```

mod amqp;
mod config;
mod error;
mod memory;
mod message;
pub mod metrics;
mod pool;
mod rate_limiter;
mod river;
pub mod routing;
mod supervisor;
mod transport;
mod worker;

pub use amqp::{AmqpChannel, AmqpSession, AmqpTransport};
pub use config::{QueueSpec, RiverConfig};
pub use error::{HandlerError, RiverError};
pub use memory::{MemoryChannel, MemorySession, MemoryTransport};
pub use message::Message;
pub use pool::{Entry, PoolSpec, WorkerPool};
pub use rate_limiter::RateLimiter;
pub use river::{BoundQueue, PublishOptions, River};
pub use routing::{Selector, Uid};
pub use supervisor::{ListenerOptions, Supervisor};
pub use transport::{Channel, Delivery, QueueArguments, Session, Transport, TransportError};
pub use worker::{ErrorCallback, Handler, Outcome, Worker, WorkerOptions};
