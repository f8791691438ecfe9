//! Error types for the presence hub
//!
//! One enum per concern: inbound frame decoding, transport I/O, registry
//! bookkeeping, handshake authentication, and configuration. `AppError`
//! wraps them for the connection handler and the binary.
//! Uses thiserror for ergonomic error definitions.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::types::UserId;

/// Malformed inbound frame (non-fatal, the connection stays alive)
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not valid JSON or does not match the envelope shape
    #[error("invalid message format: {0}")]
    Json(#[from] serde_json::Error),

    /// A field required by the message kind is absent or zero
    #[error("{kind} message requires `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

/// Transport failure on a single connection (fatal for that connection)
#[derive(Debug, Error)]
pub enum TransportError {
    /// WebSocket protocol or I/O error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Write did not complete within the write deadline
    #[error("write deadline of {0:?} exceeded")]
    WriteTimeout(Duration),

    /// No frame or pong arrived within the read deadline
    #[error("read deadline of {0:?} exceeded")]
    ReadTimeout(Duration),

    /// Outbound queue full: the peer is not keeping up
    #[error("outbound queue of {0} frames is full")]
    Congested(usize),

    /// Connection is already closing or closed
    #[error("connection closed")]
    Closed,
}

/// Errors returned by registry and façade calls
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A live connection already exists for this user
    #[error("user {0} is already online")]
    AlreadyOnline(UserId),

    /// The user has no live connection
    #[error("user {0} is not online")]
    NotOnline(UserId),

    /// The recipient is online but the write failed; the connection is being torn down
    #[error("message to user {user_id} not delivered: {source}")]
    Undelivered {
        user_id: UserId,
        #[source]
        source: TransportError,
    },

    /// The outbound message could not be encoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Handshake authentication failures
#[derive(Debug, Error)]
pub enum AuthError {
    /// The request carried no identity
    #[error("missing user identity")]
    MissingIdentity,

    /// The identity was present but unusable
    #[error("invalid user identity: {0}")]
    InvalidIdentity(String),
}

/// Invalid runtime configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Pings must be sent before the peer's read deadline runs out
    #[error("ping interval {ping_interval:?} must be shorter than read timeout {read_timeout:?}")]
    HeartbeatTooSlow {
        ping_interval: Duration,
        read_timeout: Duration,
    },

    /// A duration setting was zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Application-level errors
///
/// Returned by the connection handler and the binary entry point.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket handshake or protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake rejected
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Registration or routing failure
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_message() {
        let err = ProtocolError::MissingField {
            kind: "private",
            field: "to",
        };
        assert_eq!(err.to_string(), "private message requires `to`");
    }

    #[test]
    fn test_undelivered_keeps_source() {
        let err = RegistryError::Undelivered {
            user_id: 7,
            source: TransportError::Closed,
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("connection closed"));
    }
}
