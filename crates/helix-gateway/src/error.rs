//! Error types for the gateway session

use thiserror::Error;

use crate::protocol::ErrorShape;

/// Socket-level failures. Always recoverable by reconnecting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Gateway not connected")]
    NotConnected,

    #[error("Gateway connection closed ({code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("Gateway connect failed: {0}")]
    Connect(String),

    #[error("Gateway send failed: {0}")]
    Send(String),

    #[error("Gateway request timed out")]
    Timeout,

    #[error("Gateway session stopped")]
    Stopped,
}

/// Errors surfaced to callers of the gateway session.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake rejected ({code}): {message}")]
    Handshake { code: String, message: String },

    #[error("Gateway error ({}): {}", .0.code, .0.message)]
    Remote(ErrorShape),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport(TransportError::Stopped) => false,
            GatewayError::Transport(_) => true,
            GatewayError::Remote(shape) => shape.retryable.unwrap_or(false),
            GatewayError::Protocol(_) | GatewayError::Handshake { .. } | GatewayError::Json(_) => {
                false
            }
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(GatewayError::from(TransportError::NotConnected).is_retryable());
        assert!(
            GatewayError::from(TransportError::Closed {
                code: 1006,
                reason: "abnormal".to_string()
            })
            .is_retryable()
        );
        assert!(!GatewayError::from(TransportError::Stopped).is_retryable());
    }

    #[test]
    fn test_remote_retryable_flag() {
        let shape = ErrorShape {
            code: "UNAVAILABLE".to_string(),
            message: "busy".to_string(),
            details: None,
            retryable: Some(true),
            retry_after_ms: None,
        };
        assert!(GatewayError::Remote(shape.clone()).is_retryable());

        let shape = ErrorShape {
            retryable: None,
            ..shape
        };
        assert!(!GatewayError::Remote(shape).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = GatewayError::Handshake {
            code: "INVALID_REQUEST".to_string(),
            message: "protocol mismatch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Handshake rejected (INVALID_REQUEST): protocol mismatch"
        );
    }
}
