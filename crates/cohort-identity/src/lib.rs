//! Cohort Identity - who the participant is, across restarts.
//!
//! # Architecture
//!
//! - **Store**: storage port with RocksDB-backed durable and in-memory backends
//! - **Identity**: typed read-through/write-through view of the stored fields
//! - **Fingerprint**: asynchronous, non-blocking fingerprint acquisition
//!
//! # Example
//!
//! ```no_run
//! use cohort_identity::{Identity, Storage};
//! use url::Url;
//!
//! let storage = Storage::open_or_fallback("./cohort-data");
//! let entry = Url::parse("http://localhost/ad?hit_id=H1&worker_id=W1&assignment_id=A1&mode=debug")?;
//! let identity = Identity::initialize(storage, &entry)?;
//! assert_eq!(identity.unique_id()?.as_deref(), Some("W1:A1"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod store;

pub use error::{Error, Result};
pub use fingerprint::{BlockedFingerprint, FingerprintProvider, HostFingerprint, StaticFingerprint};
pub use identity::{is_defined, keys, EntryInformation, HitParams, Identity, Mode, ParticipantId};
pub use store::{KeyValueStore, MemoryStore, RocksStore, Storage};
