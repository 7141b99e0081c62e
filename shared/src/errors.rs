/// Unified error types for the Vidrelay system.
use thiserror::Error;

/// Errors raised by the progress notification channel.
///
/// None of these ever reach a progress producer; only the subscribing
/// request sees `Transport`.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("WebSocket upgrade failed: {0}")]
    Transport(String),
}

/// Errors raised by the stream relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Missing url parameter")]
    BadRequest,

    #[error("Invalid URL: {0}")]
    InvalidTarget(String),

    #[error("Failed to request upstream: {0}")]
    UpstreamUnreachable(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl RelayError {
    /// HTTP status this error maps to when it is answered before any body.
    pub fn http_status(&self) -> u16 {
        match self {
            RelayError::BadRequest | RelayError::InvalidTarget(_) => 400,
            RelayError::UpstreamUnreachable(_) => 502,
            // headers are already on the wire; only used for logging
            RelayError::StreamInterrupted(_) => 500,
        }
    }
}

/// Errors from the video platform (login and resolution).
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("[{code}] {message}")]
    Api { code: i64, message: String },

    #[error("Unexpected response: {0}")]
    Parse(String),

    #[error("No video id found in {0}")]
    InvalidVideoLink(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the credential file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
