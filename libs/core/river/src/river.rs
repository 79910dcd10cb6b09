//! Connection manager.
//!
//! `River` owns at most one session/channel/exchange triple and masks
//! transient broker failures from callers with a bounded retry policy.

use crate::config::{QueueSpec, RiverConfig};
use crate::error::RiverError;
use crate::metrics;
use crate::routing;
use crate::transport::{Channel, Delivery, QueueArguments, Session, Transport, TransportError};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Backoff before retry attempt `n`: half of `2^n - 1` seconds, rounded
/// up and capped, giving the sequence 1, 2, 4, 8, 10, 10, …
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(30);
    let seconds = (0.5 * (2f64.powi(exponent as i32) - 1.0)).ceil() as u64;
    Duration::from_secs(seconds.min(MAX_BACKOFF.as_secs()))
}

/// Which failure a retry loop reports on exhaustion.
#[derive(Clone, Copy, Debug)]
enum FailureKind {
    Connect,
    Send,
}

impl FailureKind {
    fn as_str(self) -> &'static str {
        match self {
            FailureKind::Connect => "connect",
            FailureKind::Send => "publish",
        }
    }

    fn exhausted(self, source: TransportError) -> RiverError {
        match self {
            FailureKind::Connect => RiverError::ConnectFailure { source },
            FailureKind::Send => RiverError::SendFailure { source },
        }
    }
}

/// A message to publish, together with its delivery options.
///
/// Serialized as the wire payload: a JSON object carrying `event`,
/// `uid`, `attributes` when present, and any extra top-level fields.
#[derive(Debug, Clone, Serialize)]
pub struct PublishOptions {
    pub event: String,

    pub uid: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,

    /// Additional top-level fields merged into the wire payload.
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    /// Delivery persistence. Not part of the wire payload.
    #[serde(skip)]
    pub persistent: bool,
}

impl PublishOptions {
    pub fn new(event: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            uid: uid.into(),
            attributes: None,
            extra: Map::new(),
            persistent: true,
        }
    }

    pub fn with_attributes(mut self, attributes: Value) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Mark the message non-persistent.
    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }
}

/// A declared, bound queue ready for polling.
pub struct BoundQueue<C: Channel> {
    name: String,
    channel: C,
    dead_lettered: bool,
}

impl<C: Channel> BoundQueue<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the queue was declared with a dead-letter routing key.
    pub fn dead_lettered(&self) -> bool {
        self.dead_lettered
    }

    pub(crate) fn channel(&self) -> &C {
        &self.channel
    }

    /// Take at most one pending delivery without blocking.
    pub async fn poll(&self) -> Result<Option<Delivery>, TransportError> {
        self.channel.poll(&self.name).await
    }

    /// Close the underlying channel handle, swallowing close errors.
    pub async fn close(&self) {
        if let Err(e) = self.channel.close().await {
            debug!(queue = %self.name, error = %e, "error closing queue channel");
        }
    }
}

impl<C: Channel> Clone for BoundQueue<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            channel: self.channel.clone(),
            dead_lettered: self.dead_lettered,
        }
    }
}

struct Publication<'a> {
    routing_key: &'a str,
    payload: &'a [u8],
    persistent: bool,
}

/// Topic pub/sub client owning a single broker connection.
pub struct River<T: Transport> {
    transport: T,
    config: RiverConfig,
    exchange_name: String,
    session: Option<T::Session>,
    channel: Option<T::Channel>,
}

impl<T: Transport> River<T> {
    pub fn new(transport: T, config: RiverConfig) -> Self {
        let exchange_name = config.exchange_name();
        Self {
            transport,
            config,
            exchange_name,
            session: None,
            channel: None,
        }
    }

    pub fn environment(&self) -> &str {
        &self.config.environment
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn connected(&self) -> bool {
        self.session.is_some() && self.channel.is_some()
    }

    /// Ensure a live session, channel, and exchange. A no-op when
    /// already connected; otherwise retried under the deadline and
    /// failing with [`RiverError::ConnectFailure`].
    pub async fn connect(&mut self) -> Result<(), RiverError> {
        if self.connected() {
            return Ok(());
        }
        self.retry(FailureKind::Connect, None).await
    }

    /// Close channel and session, swallowing broker close errors.
    /// Always leaves the manager disconnected.
    pub async fn disconnect(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "error closing channel");
            }
        }
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!(error = %e, "error closing session");
            }
        }
    }

    /// Publish a message to the topic exchange.
    ///
    /// The routing key is compiled from the event and uid; the full
    /// option set is serialized as the JSON payload. Retried under the
    /// deadline, failing with [`RiverError::SendFailure`].
    pub async fn publish(&mut self, options: &PublishOptions) -> Result<(), RiverError> {
        let routing_key = routing::publish_key(&options.event, &options.uid)?;
        let payload = serde_json::to_vec(options)?;
        self.retry(
            FailureKind::Send,
            Some(Publication {
                routing_key: &routing_key,
                payload: &payload,
                persistent: options.persistent,
            }),
        )
        .await
    }

    /// Declare a durable queue and bind it to every compiled binding
    /// key plus the optional literal override.
    pub async fn queue(&mut self, spec: &QueueSpec) -> Result<BoundQueue<T::Channel>, RiverError> {
        if spec.name.is_empty() {
            return Err(RiverError::MissingArgument("queue name"));
        }

        self.connect().await?;
        let channel = self.channel()?.clone();

        let arguments = QueueArguments {
            message_ttl: spec.ttl,
            dead_letter_exchange: spec
                .dead_letter_routing_key
                .as_ref()
                .map(|_| self.exchange_name.clone()),
            dead_letter_routing_key: spec.dead_letter_routing_key.clone(),
        };
        channel.declare_queue(&spec.name, &arguments).await?;

        // A literal routing key on its own overrides the compiled set;
        // the match-everything default applies only when no binding
        // input is given at all.
        let selectorless =
            spec.event.is_none() && spec.class.is_none() && spec.path.is_none();
        let mut keys = if selectorless && spec.routing_key.is_some() {
            Vec::new()
        } else {
            routing::binding_keys(spec.event.as_ref(), spec.class.as_ref(), spec.path.as_ref())
        };
        if let Some(key) = &spec.routing_key {
            keys.push(key.clone());
        }
        for key in &keys {
            channel
                .bind_queue(&spec.name, &self.exchange_name, key)
                .await?;
        }
        debug!(queue = %spec.name, bindings = keys.len(), "queue declared and bound");

        Ok(BoundQueue {
            name: spec.name.clone(),
            channel,
            dead_lettered: spec.dead_letter_routing_key.is_some(),
        })
    }

    fn channel(&self) -> Result<&T::Channel, TransportError> {
        self.channel
            .as_ref()
            .ok_or_else(|| TransportError::connection("not connected"))
    }

    /// Open session and channel and declare the exchange, tearing down
    /// any partial state first.
    async fn establish(&mut self) -> Result<(), TransportError> {
        if self.connected() {
            return Ok(());
        }
        self.disconnect().await;
        let session = self.transport.open(&self.config.url).await?;
        let channel = session.create_channel(self.config.prefetch).await?;
        channel.declare_exchange(&self.exchange_name).await?;
        self.session = Some(session);
        self.channel = Some(channel);
        debug!(exchange = %self.exchange_name, "connected");
        Ok(())
    }

    async fn attempt(&mut self, publication: Option<&Publication<'_>>) -> Result<(), TransportError> {
        self.establish().await?;
        if let Some(publication) = publication {
            self.channel()?
                .publish(
                    &self.exchange_name,
                    publication.routing_key,
                    publication.payload,
                    publication.persistent,
                )
                .await?;
        }
        Ok(())
    }

    /// The retry policy: on every connection-level error, disconnect to
    /// clear poisoned state, back off, and try again until the deadline
    /// elapses. Exhaustion reports the last transport error, or a
    /// synthetic timeout if the deadline passed before any attempt
    /// failed.
    async fn retry(
        &mut self,
        kind: FailureKind,
        publication: Option<Publication<'_>>,
    ) -> Result<(), RiverError> {
        let deadline = Instant::now() + self.config.retry_deadline;
        let mut attempt: u32 = 0;
        let mut last_error: Option<TransportError> = None;

        loop {
            match self.attempt(publication.as_ref()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_connection_error() => {
                    attempt += 1;
                    warn!(
                        op = kind.as_str(),
                        attempt,
                        error = %e,
                        "connection error, backing off"
                    );
                    metrics::record_connection_retry(kind.as_str());
                    self.disconnect().await;
                    last_error = Some(e);
                    if Instant::now() >= deadline {
                        break;
                    }
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.disconnect().await;
        let source = last_error
            .unwrap_or_else(|| TransportError::timeout("retry deadline elapsed"));
        Err(kind.exhausted(source))
    }
}
