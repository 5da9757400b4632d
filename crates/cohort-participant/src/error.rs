//! Error types for the participant lifecycle.

use crate::lifecycle::LifecycleState;
use cohort_transport::AjaxRejection;
use thiserror::Error;

/// Result type for participant operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a participant session.
#[derive(Debug, Error)]
pub enum Error {
    /// The experiment server rejected a request
    #[error("request rejected: {0}")]
    Rejected(#[from] AjaxRejection),

    /// Identity store error
    #[error("identity error: {0}")]
    Identity(#[from] cohort_identity::Error),

    /// Quorum channel error
    #[error("quorum error: {0}")]
    Quorum(#[from] cohort_quorum::Error),

    /// Transport could not be built
    #[error("transport error: {0}")]
    Transport(#[from] cohort_transport::Error),

    /// Fingerprinting is blocked; registration must not proceed
    #[error("fingerprint unavailable: {0}")]
    FingerprintUnavailable(String),

    /// Operation not allowed in the current lifecycle state
    #[error("illegal lifecycle transition: {from} -> {to}")]
    IllegalTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    /// Quorum was not reached within the configured limit
    #[error("quorum not reached within {0:?}")]
    QuorumTimeout(std::time::Duration),

    /// Operation needs a registered participant
    #[error("participant is not registered")]
    NotRegistered,

    /// Server response did not have the expected shape
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Navigation failed
    #[error("navigation error: {0}")]
    Navigation(#[from] crate::navigation::NavigationError),

    /// Error report could not be delivered
    #[error("error report failed: {0}")]
    Report(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// URL could not be built
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// Lift a quorum error, surfacing an expired wait as [`Error::QuorumTimeout`].
    pub(crate) fn from_quorum(err: cohort_quorum::Error) -> Self {
        match err {
            cohort_quorum::Error::Timeout(limit) => Self::QuorumTimeout(limit),
            other => Self::Quorum(other),
        }
    }

    /// The underlying request rejection, if this error is one.
    pub fn rejection(&self) -> Option<&AjaxRejection> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }
}
