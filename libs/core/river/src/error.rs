//! Error taxonomy.
//!
//! Split along the channels callers observe them on:
//! - `RiverError`: returned synchronously by connection-manager and
//!   supervisor operations. `ConnectFailure`/`SendFailure` mean the
//!   retry policy was exhausted and carry the last transport error.
//! - `HandlerError`: what a message handler reports back to its worker.
//!   The `Connection` variant is the infrastructure channel (reconnect,
//!   rate-limited continuation, connection-error callback); `Failure`
//!   is the generic channel (reject, exception callback).

use crate::transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the client library.
#[derive(Debug, Error)]
pub enum RiverError {
    /// Connecting kept failing until the retry deadline elapsed.
    #[error("connect failed: {source}")]
    ConnectFailure {
        #[source]
        source: TransportError,
    },

    /// Publishing kept failing until the retry deadline elapsed.
    #[error("send failed: {source}")]
    SendFailure {
        #[source]
        source: TransportError,
    },

    /// A message body that could not be parsed as JSON.
    #[error("invalid payload: {reason} (content was {content:?})")]
    InvalidPayload { reason: String, content: String },

    /// The supervisor or client was assembled incorrectly.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A required argument was not supplied. Programmer error, never
    /// retried.
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    /// An identifier that does not follow the `class:path$oid` form.
    #[error("invalid uid: {0:?}")]
    InvalidUid(String),

    /// Transport failure outside the retry policy.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wire-format serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RiverError {
    /// Build an `InvalidPayload` error preserving the original content.
    pub fn invalid_payload(reason: impl Into<String>, content: &[u8]) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
            content: String::from_utf8_lossy(content).into_owned(),
        }
    }

    /// Whether this is a retry-exhaustion failure.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            RiverError::ConnectFailure { .. } | RiverError::SendFailure { .. }
        )
    }
}

/// Error reported by a message handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Broker infrastructure failed underneath the handler.
    #[error("connection error: {0}")]
    Connection(#[source] TransportError),

    /// The handler itself failed.
    #[error("{message}")]
    Failure {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl HandlerError {
    /// Create a generic handler failure from a message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
            source: None,
        }
    }

    /// Create a generic handler failure wrapping a source error.
    pub fn failure_from(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Failure {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether this error travels on the infrastructure channel.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, HandlerError::Connection(_))
    }
}

impl From<TransportError> for HandlerError {
    fn from(error: TransportError) -> Self {
        if error.is_connection_error() {
            HandlerError::Connection(error)
        } else {
            HandlerError::failure_from(error)
        }
    }
}

impl From<RiverError> for HandlerError {
    fn from(error: RiverError) -> Self {
        match error {
            RiverError::ConnectFailure { source } | RiverError::SendFailure { source } => {
                HandlerError::Connection(source)
            }
            RiverError::Transport(source) if source.is_connection_error() => {
                HandlerError::Connection(source)
            }
            other => HandlerError::failure_from(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_payload_preserves_content() {
        let error = RiverError::invalid_payload("expected value", b"not json");
        match error {
            RiverError::InvalidPayload { content, .. } => assert_eq!(content, "not json"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn handler_error_channels() {
        let connection = HandlerError::from(TransportError::connection("reset"));
        assert!(connection.is_connection_error());

        let generic = HandlerError::failure("boom");
        assert!(!generic.is_connection_error());

        let broker = HandlerError::from(TransportError::broker("refused"));
        assert!(!broker.is_connection_error());
    }

    #[test]
    fn exhaustion_errors_convert_to_connection_channel() {
        let error = RiverError::SendFailure {
            source: TransportError::connection("reset"),
        };
        assert!(HandlerError::from(error).is_connection_error());

        let error = RiverError::MissingArgument("queue name");
        assert!(!HandlerError::from(error).is_connection_error());
    }
}
