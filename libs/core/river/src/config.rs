//! Client configuration and queue specifications.

use crate::error::RiverError;
use crate::routing::Selector;
use std::env;
use std::time::Duration;

const DEFAULT_URL: &str = "amqp://127.0.0.1:5672/%2f";
const DEFAULT_ENVIRONMENT: &str = "development";
const DEFAULT_EXCHANGE: &str = "river";
const DEFAULT_PREFETCH: u16 = 1;
const DEFAULT_RETRY_DEADLINE: Duration = Duration::from_secs(30);

const PRODUCTION: &str = "production";

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Connection configuration.
///
/// All broker-connection options are explicit values threaded through
/// constructors; there is no process-wide mutable state. Load once from
/// the environment at startup and pass clones to every `River`,
/// `Worker`, and `Supervisor`.
#[derive(Debug, Clone)]
pub struct RiverConfig {
    /// Broker URL.
    pub url: String,

    /// Environment tag namespacing the exchange (`production` uses the
    /// bare exchange name, anything else is suffixed).
    pub environment: String,

    /// Base exchange name.
    pub exchange: String,

    /// Per-channel unacknowledged-delivery limit.
    pub prefetch: Option<u16>,

    /// Overall deadline for the connect/publish retry policy.
    pub retry_deadline: Duration,
}

impl RiverConfig {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            environment: environment.into(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            prefetch: Some(DEFAULT_PREFETCH),
            retry_deadline: DEFAULT_RETRY_DEADLINE,
        }
    }

    /// Load configuration from the environment.
    ///
    /// Variables: `AMQP_URL`, `RIVER_ENV` (falling back to `APP_ENV`),
    /// `RIVER_EXCHANGE`, `RIVER_PREFETCH`.
    pub fn from_env() -> Result<Self, RiverError> {
        let environment = env::var("RIVER_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| DEFAULT_ENVIRONMENT.to_string());

        let mut config = Self::new(environment);
        config.url = env_or_default("AMQP_URL", DEFAULT_URL);
        config.exchange = env_or_default("RIVER_EXCHANGE", DEFAULT_EXCHANGE);
        if let Ok(prefetch) = env::var("RIVER_PREFETCH") {
            let prefetch: u16 = prefetch.parse().map_err(|_| {
                RiverError::Configuration(format!("RIVER_PREFETCH is not a number: {prefetch:?}"))
            })?;
            config.prefetch = Some(prefetch);
        }
        Ok(config)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_prefetch(mut self, prefetch: Option<u16>) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_retry_deadline(mut self, deadline: Duration) -> Self {
        self.retry_deadline = deadline;
        self
    }

    /// The exchange name for this environment. Production uses the base
    /// name; every other environment gets a `.<environment>` suffix.
    pub fn exchange_name(&self) -> String {
        if self.environment == PRODUCTION {
            self.exchange.clone()
        } else {
            format!("{}.{}", self.exchange, self.environment)
        }
    }
}

impl Default for RiverConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENVIRONMENT)
    }
}

/// Declaration of a durable queue and the bindings applied to it.
#[derive(Debug, Clone, Default)]
pub struct QueueSpec {
    /// Queue name. Required; must be unique per deployment.
    pub name: String,

    /// Message TTL applied at the broker.
    pub ttl: Option<Duration>,

    /// Rejected messages are republished to the same exchange under
    /// this key instead of being requeued.
    pub dead_letter_routing_key: Option<String>,

    /// Literal binding key applied in addition to the compiled ones.
    pub routing_key: Option<String>,

    /// Event pattern for binding-key compilation.
    pub event: Option<Selector>,

    /// Uid-class pattern for binding-key compilation.
    pub class: Option<Selector>,

    /// Uid-path pattern for binding-key compilation.
    pub path: Option<Selector>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_dead_letter_routing_key(mut self, key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(key.into());
        self
    }

    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn with_event(mut self, event: impl Into<Selector>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_class(mut self, class: impl Into<Selector>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<Selector>) -> Self {
        self.path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_name_is_suffixed_outside_production() {
        let config = RiverConfig::new("whatever");
        assert_eq!(config.exchange_name(), "river.whatever");
    }

    #[test]
    fn exchange_name_is_bare_in_production() {
        let config = RiverConfig::new("production");
        assert_eq!(config.exchange_name(), "river");
    }

    #[test]
    fn exchange_base_is_configurable() {
        let config = RiverConfig::new("staging").with_exchange("grove.events");
        assert_eq!(config.exchange_name(), "grove.events.staging");
    }

    #[test]
    fn queue_spec_builder() {
        let spec = QueueSpec::new("thingivore")
            .with_ttl(Duration::from_secs(60))
            .with_dead_letter_routing_key("thingivore.failures")
            .with_event("create|delete")
            .with_class("post")
            .with_path("feeds.^bagera");

        assert_eq!(spec.name, "thingivore");
        assert_eq!(spec.ttl, Some(Duration::from_secs(60)));
        assert_eq!(
            spec.dead_letter_routing_key.as_deref(),
            Some("thingivore.failures")
        );
        assert!(spec.event.is_some());
    }
}
