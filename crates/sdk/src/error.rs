//! Error types for the fleetlink SDK.

use fleetlink_core::FleetError;

/// Result type for SDK operations.
pub type SdkResult<T> = Result<T, SdkError>;

/// Error types that can occur on a slave link.
#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    /// WebSocket handshake or I/O failed.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The master refused the registration.
    #[error("Registration rejected: {0}")]
    Rejected(String),

    /// The link is closed.
    #[error("Not connected to master")]
    NotConnected,

    /// No reply within the request timeout.
    #[error("Request timed out")]
    Timeout,

    /// A master tool reported failure.
    #[error("Tool failed: {0}")]
    ToolFailed(String),

    /// Frame could not be built or decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl SdkError {
    /// Check if reconnecting may help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WebSocket(_) | Self::NotConnected | Self::Timeout)
    }
}

impl From<FleetError> for SdkError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::ToolFailed(msg) => Self::ToolFailed(msg),
            FleetError::Timeout(_) => Self::Timeout,
            FleetError::NotConnected(_) => Self::NotConnected,
            FleetError::Json(e) => Self::Json(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(SdkError::Timeout.is_retryable());
        assert!(SdkError::WebSocket("reset".into()).is_retryable());
        assert!(!SdkError::Rejected("revoked".into()).is_retryable());
        assert!(!SdkError::ToolFailed("boom".into()).is_retryable());
    }

    #[test]
    fn test_from_fleet_error() {
        let err: SdkError = FleetError::ToolFailed("boom".into()).into();
        assert!(matches!(err, SdkError::ToolFailed(msg) if msg == "boom"));

        let err: SdkError = FleetError::Protocol("bad frame".into()).into();
        assert!(matches!(err, SdkError::Protocol(_)));
    }
}
