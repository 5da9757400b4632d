//! Error types for the identity store.

use thiserror::Error;

/// Result type for identity operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading or writing participant identity.
#[derive(Debug, Error)]
pub enum Error {
    /// Durable store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A participant id is already bound to this identity
    #[error("participant id already set to {current}, refusing to overwrite with {requested}")]
    ParticipantIdImmutable { current: String, requested: String },

    /// Entry URL could not be parsed
    #[error("Invalid entry URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Fingerprinting is blocked or unsupported on this host
    #[error("Fingerprint unavailable: {0}")]
    FingerprintUnavailable(String),
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
