//! Error types for fleet coordination.

/// Result type for registry, manager and link operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors surfaced to callers of the registry, manager and link server.
///
/// None of these abort the process: a failing slave only affects the
/// operation that addressed it.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// The addressed host id has no live connection.
    #[error("slave {0} not connected")]
    NotConnected(String),

    /// A collaborator (usually the link server) has not been set up yet.
    #[error("{0} not initialized")]
    NotInitialized(&'static str),

    /// Socket level failure. Treated as an implicit disconnect.
    #[error("transport error: {0}")]
    Transport(String),

    /// Persistence call failed.
    #[error("store error: {0:#}")]
    Store(anyhow::Error),

    /// Malformed frame or unknown message type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No correlated reply arrived in time.
    #[error("{0} timed out")]
    Timeout(String),

    /// The link presented an identity the authority does not accept.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The host's credential is on the revocation list.
    #[error("credentials revoked for {0}")]
    Revoked(String),

    /// Unknown slave record, tool or server.
    #[error("not found: {0}")]
    NotFound(String),

    /// A name is already taken by another tool source.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The remote side executed the tool and reported failure.
    #[error("tool call failed: {0}")]
    ToolFailed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    /// Whether the error means the peer is simply gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::NotConnected(_) | Self::Transport(_))
    }
}
