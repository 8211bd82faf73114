//! Sync client error types.

use thiserror::Error;

/// Why a connection could not be established or was terminated for good.
///
/// Cloneable: every caller waiting on a link receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// Credential rejected by the server. Never retried automatically.
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed {
        /// Reason reported by the server.
        reason: String,
        /// The credential expired; the host must sign the user out.
        expired: bool,
    },

    /// Reconnect backoff gave up.
    #[error("Gave up after {0} connection attempts")]
    Exhausted(u32),

    /// The transport was closed before a session was established.
    #[error("Connection closed")]
    Closed,
}

impl ConnectError {
    /// Whether the host application must force re-authentication.
    pub fn requires_sign_out(&self) -> bool {
        matches!(self, ConnectError::AuthenticationFailed { expired: true, .. })
    }
}

/// Sync client error type.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Protocol encode/decode error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] common::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parse error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Connection could not be established.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Operation needs an authenticated session.
    #[error("Not connected")]
    NotConnected,

    /// REST API returned an error status.
    #[error("API error: {0}")]
    Api(String),

    /// Entity does not exist on the server.
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// Entity could not be stored in the cache.
    #[error("Invalid entity: {0}")]
    InvalidEntity(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Channel send error.
    #[error("Channel send error")]
    ChannelSend,
}

/// Result type for sync client operations.
pub type Result<T> = std::result::Result<T, SyncError>;
