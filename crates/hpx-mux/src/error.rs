//! Error handling for the multiplexed transport.
//!
//! Nothing in the public manager surface returns these errors directly; they
//! are recorded on connection state, handed to router error callbacks, and
//! published on the event bus.

use std::time::Duration;

use thiserror::Error;

/// The main result type used throughout the transport layer.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error type for all transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket-level failure (handshake, read or write).
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// The socket was closed, by either side.
    #[error("Connection closed (code {code}): {reason}")]
    ConnectionClosed { code: u16, reason: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An inbound frame could not be decoded.
    #[error("Malformed frame: {message}")]
    FrameParse { message: String },

    /// A router handler returned an error or panicked.
    #[error("Router '{route_id}' failed: {message}")]
    Handler { route_id: String, message: String },

    /// The outbound queue evicted its oldest entry.
    #[error("Outbound queue for {connection_id} is full (capacity {capacity})")]
    QueueOverflow {
        connection_id: String,
        capacity: usize,
    },

    /// The reconnect policy ran out of attempts.
    #[error("Reconnection attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// A connection id string did not match either id shape.
    #[error("Invalid connection id: {value}")]
    InvalidConnectionId { value: String },

    /// URL could not be parsed.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TransportError {
    /// Create a WebSocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create a connection closed error.
    pub fn connection_closed(code: u16, reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            code,
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a frame parse error.
    pub fn frame_parse(message: impl Into<String>) -> Self {
        Self::FrameParse {
            message: message.into(),
        }
    }

    /// Create a router handler error.
    pub fn handler(route_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            route_id: route_id.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TransportError::config("Invalid URL");
        assert!(matches!(err, TransportError::Config { .. }));

        let err = TransportError::timeout(Duration::from_secs(5));
        assert!(matches!(err, TransportError::Timeout { .. }));

        let err = TransportError::connection_closed(1006, "Connection lost");
        assert_eq!(err.to_string(), "Connection closed (code 1006): Connection lost");

        let err = TransportError::handler("metrics-store", "boom");
        assert_eq!(err.to_string(), "Router 'metrics-store' failed: boom");
    }

    #[test]
    fn test_serde_error_converts() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: TransportError = parse.unwrap_err().into();
        assert!(matches!(err, TransportError::Serialization(_)));
    }
}
