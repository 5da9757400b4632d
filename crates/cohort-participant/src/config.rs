//! Client configuration.
//!
//! Everything can be set through `COHORT_*` environment variables; unset
//! variables keep the defaults below.

use crate::error::{Error, Result};
use cohort_quorum::{ExponentialBackoff, Termination};
use cohort_transport::BodyEncoding;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const DEFAULT_BASE_URL: &str = "http://localhost:5000";
const DEFAULT_DATA_DIR: &str = "./cohort-data";

/// Participant client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Experiment server root.
    pub base_url: Url,
    /// URL the participant entered on, carrying the recruitment parameters.
    /// Defaults to `base_url`.
    pub entry_url: Option<Url>,
    /// Durable identity store location.
    pub data_dir: PathBuf,
    pub request_timeout: Duration,
    pub body_encoding: BodyEncoding,
    pub termination: Termination,
    pub reconnect: ExponentialBackoff,
    /// Upper bound on the quorum wait. `None` waits indefinitely.
    pub quorum_timeout: Option<Duration>,
}

impl ClientConfig {
    /// Defaults for everything but the server root.
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            entry_url: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            request_timeout: Duration::from_secs(30),
            body_encoding: BodyEncoding::default(),
            termination: Termination::default(),
            reconnect: ExponentialBackoff::default(),
            quorum_timeout: None,
        }
    }

    /// Load configuration from `COHORT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let base = var("COHORT_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut config = Self::new(parse_url("COHORT_BASE_URL", &base)?);
        if let Some(entry) = var("COHORT_ENTRY_URL") {
            config.entry_url = Some(parse_url("COHORT_ENTRY_URL", &entry)?);
        }
        if let Some(dir) = var("COHORT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = var("COHORT_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(parse("COHORT_REQUEST_TIMEOUT_SECS", &secs)?);
        }
        if let Some(encoding) = var("COHORT_BODY_ENCODING") {
            config.body_encoding = parse("COHORT_BODY_ENCODING", &encoding)?;
        }
        if let Some(termination) = var("COHORT_QUORUM_TERMINATION") {
            config.termination = parse("COHORT_QUORUM_TERMINATION", &termination)?;
        }
        if let Some(ms) = var("COHORT_RECONNECT_INITIAL_MS") {
            let initial = Duration::from_millis(parse("COHORT_RECONNECT_INITIAL_MS", &ms)?);
            config.reconnect = config.reconnect.with_initial(initial);
        }
        if let Some(ms) = var("COHORT_RECONNECT_MAX_MS") {
            let max = Duration::from_millis(parse("COHORT_RECONNECT_MAX_MS", &ms)?);
            config.reconnect = config.reconnect.with_max(max);
        }
        if let Some(factor) = var("COHORT_RECONNECT_FACTOR") {
            config.reconnect = config.reconnect.with_factor(parse("COHORT_RECONNECT_FACTOR", &factor)?);
        }
        if let Some(secs) = var("COHORT_QUORUM_TIMEOUT_SECS") {
            config.quorum_timeout = Some(Duration::from_secs(parse("COHORT_QUORUM_TIMEOUT_SECS", &secs)?));
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_base_url(mut self, url: Url) -> Self {
        self.base_url = url;
        self
    }

    #[must_use]
    pub fn with_entry_url(mut self, url: Url) -> Self {
        self.entry_url = Some(url);
        self
    }

    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_termination(mut self, termination: Termination) -> Self {
        self.termination = termination;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ExponentialBackoff) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_quorum_timeout(mut self, timeout: Duration) -> Self {
        self.quorum_timeout = Some(timeout);
        self
    }

    /// The entry URL, falling back to the server root.
    pub fn entry_url(&self) -> &Url {
        self.entry_url.as_ref().unwrap_or(&self.base_url)
    }
}

fn parse_url(key: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| Error::Config(format!("{key}: {e}")))
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{key}: {e}")))
}
