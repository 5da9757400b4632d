//! Error types for the quorum channel.

use std::time::Duration;
use thiserror::Error;

/// Result type for quorum channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on the quorum channel.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection could not be established
    #[error("Connection error: {0}")]
    Connect(String),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Quorum frame payload was not valid JSON
    #[error("Malformed quorum frame: {0}")]
    Frame(#[from] serde_json::Error),

    /// Channel URL could not be built
    #[error("Invalid channel URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Base URL scheme has no push equivalent
    #[error("Unsupported scheme for push channel: {0}")]
    UnsupportedScheme(String),

    /// Event stream ended before quorum was observed
    #[error("quorum channel closed before quorum was reached")]
    ChannelClosed,

    /// Backoff policy stopped reconnecting
    #[error("quorum channel gave up after {attempts} reconnect attempts")]
    GaveUp { attempts: u32 },

    /// Caller-imposed wait limit elapsed
    #[error("quorum not reached within {0:?}")]
    Timeout(Duration),
}
