//! Browser-style fingerprints for duplicate-participant detection.
//!
//! A fingerprint is an opaque hash. Acquisition is asynchronous and must never
//! block registration; see [`crate::Identity::request_fingerprint`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Source of fingerprint hashes.
#[async_trait]
pub trait FingerprintProvider: Send + Sync {
    /// Capability probe. An error means fingerprinting is blocked on this
    /// host and registration must not proceed.
    fn probe(&self) -> Result<()>;

    /// Compute the fingerprint hash.
    async fn fingerprint(&self) -> Result<String>;
}

/// Fingerprint derived from host attributes, hashed with BLAKE3.
#[derive(Debug, Clone)]
pub struct HostFingerprint {
    user_agent: String,
}

impl HostFingerprint {
    /// Create a provider that mixes `user_agent` into the host attributes.
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }

    fn components(&self) -> Vec<String> {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        vec![
            self.user_agent.clone(),
            std::env::consts::OS.to_string(),
            std::env::consts::ARCH.to_string(),
            std::env::var("HOSTNAME").unwrap_or_default(),
            std::env::var("LANG").unwrap_or_default(),
            std::env::var("TZ").unwrap_or_default(),
            parallelism.to_string(),
        ]
    }
}

impl Default for HostFingerprint {
    fn default() -> Self {
        Self::new(concat!("cohort-participant/", env!("CARGO_PKG_VERSION")))
    }
}

#[async_trait]
impl FingerprintProvider for HostFingerprint {
    fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn fingerprint(&self) -> Result<String> {
        let mut hasher = blake3::Hasher::new();
        for component in self.components() {
            hasher.update(component.as_bytes());
            hasher.update(&[0]);
        }
        Ok(hex::encode(&hasher.finalize().as_bytes()[..16]))
    }
}

/// Fixed fingerprint, optionally delivered after a delay.
#[derive(Debug, Clone)]
pub struct StaticFingerprint {
    hash: String,
    delay: Option<Duration>,
}

impl StaticFingerprint {
    /// Deliver `hash` immediately.
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            delay: None,
        }
    }

    /// Deliver the hash only after `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl FingerprintProvider for StaticFingerprint {
    fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn fingerprint(&self) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.hash.clone())
    }
}

/// Provider whose capability probe always fails, as when a content blocker
/// strips the fingerprinting library.
#[derive(Debug, Clone, Default)]
pub struct BlockedFingerprint;

#[async_trait]
impl FingerprintProvider for BlockedFingerprint {
    fn probe(&self) -> Result<()> {
        Err(Error::FingerprintUnavailable(
            "fingerprinting blocked; disable content blockers and reload".into(),
        ))
    }

    async fn fingerprint(&self) -> Result<String> {
        Err(Error::FingerprintUnavailable("fingerprinting blocked".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn host_fingerprint_is_stable() {
        let provider = HostFingerprint::new("agent");
        let a = provider.fingerprint().await.unwrap();
        let b = provider.fingerprint().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn user_agent_changes_hash() {
        let a = HostFingerprint::new("one").fingerprint().await.unwrap();
        let b = HostFingerprint::new("two").fingerprint().await.unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn passes_basic_probe() {
        assert!(HostFingerprint::default().probe().is_ok());
        assert!(BlockedFingerprint.probe().is_err());
    }
}
