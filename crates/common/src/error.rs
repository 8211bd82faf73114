//! Error types shared across the sync workspace.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unsupported frame: {0}")]
    UnsupportedFrame(String),

    #[error("Invalid payload for '{event_type}': {source}")]
    InvalidPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Generic error: {0}")]
    Generic(String),
}

pub type Result<T> = std::result::Result<T, Error>;
