//! Error types for transport construction.
//!
//! Request failures are not errors of this kind: they are
//! [`AjaxRejection`](crate::AjaxRejection) values.

use thiserror::Error;

/// Result type for transport setup.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building a [`Transport`](crate::Transport).
#[derive(Debug, Error)]
pub enum Error {
    /// The HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// The base URL is unusable
    #[error("Invalid base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
