//! Participant identity with read-through/write-through persistence.
//!
//! Every field lives in the backing [`Storage`] under a fixed key (see
//! [`keys`]); the [`Identity`] itself holds no copies, so any clone observes
//! writes made through any other clone, and a new process opened over the same
//! durable store resumes where the previous one stopped.

use crate::error::{Error, Result};
use crate::fingerprint::FingerprintProvider;
use crate::store::Storage;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Durable store key names. Changing any of these orphans persisted
/// identities mid-flow.
pub mod keys {
    pub const RECRUITER: &str = "recruiter";
    pub const HIT_ID: &str = "hit_id";
    pub const WORKER_ID: &str = "worker_id";
    pub const ASSIGNMENT_ID: &str = "assignment_id";
    pub const UNIQUE_ID: &str = "unique_id";
    pub const MODE: &str = "mode";
    pub const PARTICIPANT_ID: &str = "participant_id";
    pub const FINGERPRINT_HASH: &str = "fingerprint_hash";
    pub const ENTRY_INFORMATION: &str = "entry_information";
}

/// All query parameters captured at entry, `mode` removed.
pub type EntryInformation = BTreeMap<String, String>;

/// Query parameter spellings accepted for each identity field.
const URL_PARAMS: &[(&str, &[&str])] = &[
    (keys::RECRUITER, &["recruiter"]),
    (keys::HIT_ID, &["hitId", "hit_id"]),
    (keys::WORKER_ID, &["workerId", "worker_id"]),
    (keys::ASSIGNMENT_ID, &["assignmentId", "assignment_id"]),
    (keys::MODE, &["mode"]),
];

/// Parameters that identify a page within the flow rather than an entry.
const NAVIGATION_PARAMS: &[&str] = &["mode", "participant_id"];

/// True unless the value is empty or the literal text `undefined`, which is
/// what an unset identifier becomes after a round trip through a URL.
pub fn is_defined(value: &str) -> bool {
    !value.is_empty() && value != "undefined"
}

/// Deployment mode of the experiment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Mode {
    Live,
    Sandbox,
    Debug,
    Other(String),
}

impl Mode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Live => "live",
            Self::Sandbox => "sandbox",
            Self::Debug => "debug",
            Self::Other(other) => other,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "live" => Self::Live,
            "sandbox" => Self::Sandbox,
            "debug" => Self::Debug,
            other => Self::Other(other.to_string()),
        })
    }
}

impl From<String> for Mode {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(mode) => mode,
            Err(never) => match never {},
        }
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.as_str().to_string()
    }
}

/// Server-issued participant identifier.
///
/// The server emits integers; URLs and the durable store carry strings. Both
/// forms deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for ParticipantId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for ParticipantId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Self(n.to_string()),
            Raw::Text(s) => Self(s),
        })
    }
}

/// Snapshot of the recruitment identifiers, as sent with registration and
/// attached to error reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HitParams {
    pub recruiter: Option<String>,
    pub hit_id: Option<String>,
    pub worker_id: Option<String>,
    pub assignment_id: Option<String>,
    pub mode: Option<Mode>,
    pub fingerprint_hash: Option<String>,
}

/// The participant's identity for this session.
#[derive(Debug, Clone)]
pub struct Identity {
    storage: Storage,
}

impl Identity {
    /// Identity over previously persisted values.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Populate the identity from the entry URL, on top of whatever the
    /// store already holds.
    ///
    /// Identifiers present in the query overwrite stored ones; absent ones
    /// keep their stored values, so later pages in the flow (which carry only
    /// `participant_id`) resume the same identity.
    pub fn initialize(storage: Storage, entry_url: &Url) -> Result<Self> {
        let identity = Self::new(storage);
        let params: Vec<(String, String)> = entry_url.query_pairs().into_owned().collect();
        let lookup = |names: &[&str]| {
            params
                .iter()
                .find(|(name, _)| names.contains(&name.as_str()))
                .map(|(_, value)| value.clone())
        };

        if let Some(assignment_id) =
            lookup(&["assignmentId", "assignment_id"]).filter(|v| is_defined(v))
        {
            let previous = identity.assignment_id()?;
            if previous.is_some_and(|prev| prev != assignment_id) {
                info!(
                    assignment_id = %assignment_id,
                    "New assignment at entry, discarding previous participant binding"
                );
                identity.storage.remove(keys::PARTICIPANT_ID)?;
            }
        }

        for &(key, names) in URL_PARAMS {
            if let Some(value) = lookup(names).filter(|v| is_defined(v)) {
                identity.storage.set(key, &value)?;
            }
        }

        if let (Some(worker), Some(assignment)) = (identity.worker_id()?, identity.assignment_id()?) {
            identity.set_unique_id(&format!("{worker}:{assignment}"))?;
        }

        if let Some(participant_id) = lookup(&["participant_id"]).filter(|v| is_defined(v)) {
            match identity.set_participant_id(&ParticipantId::new(participant_id)) {
                Ok(()) => {}
                Err(Error::ParticipantIdImmutable { current, requested }) => {
                    warn!(
                        participant_id = %current,
                        ignored = %requested,
                        "Entry URL names another participant, keeping the stored one"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let entry: EntryInformation = params
            .iter()
            .filter(|(name, _)| name != "mode")
            .cloned()
            .collect();
        if entry.keys().any(|name| !NAVIGATION_PARAMS.contains(&name.as_str())) {
            identity.set_entry_information(&entry)?;
        }

        debug!(
            storage_available = identity.storage_available(),
            params = params.len(),
            "Identity initialized"
        );
        Ok(identity)
    }

    /// Whether the identity will survive a restart.
    pub fn storage_available(&self) -> bool {
        self.storage.available()
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.storage.get(key)?.filter(|v| is_defined(v)))
    }

    pub fn recruiter(&self) -> Result<Option<String>> {
        self.read(keys::RECRUITER)
    }

    pub fn set_recruiter(&self, value: &str) -> Result<()> {
        self.storage.set(keys::RECRUITER, value)
    }

    pub fn hit_id(&self) -> Result<Option<String>> {
        self.read(keys::HIT_ID)
    }

    pub fn set_hit_id(&self, value: &str) -> Result<()> {
        self.storage.set(keys::HIT_ID, value)
    }

    pub fn worker_id(&self) -> Result<Option<String>> {
        self.read(keys::WORKER_ID)
    }

    pub fn set_worker_id(&self, value: &str) -> Result<()> {
        self.storage.set(keys::WORKER_ID, value)
    }

    pub fn assignment_id(&self) -> Result<Option<String>> {
        self.read(keys::ASSIGNMENT_ID)
    }

    pub fn set_assignment_id(&self, value: &str) -> Result<()> {
        self.storage.set(keys::ASSIGNMENT_ID, value)
    }

    pub fn unique_id(&self) -> Result<Option<String>> {
        self.read(keys::UNIQUE_ID)
    }

    pub fn set_unique_id(&self, value: &str) -> Result<()> {
        self.storage.set(keys::UNIQUE_ID, value)
    }

    pub fn mode(&self) -> Result<Option<Mode>> {
        Ok(self.read(keys::MODE)?.map(Mode::from))
    }

    pub fn set_mode(&self, mode: &Mode) -> Result<()> {
        self.storage.set(keys::MODE, mode.as_str())
    }

    pub fn fingerprint_hash(&self) -> Result<Option<String>> {
        self.read(keys::FINGERPRINT_HASH)
    }

    pub fn set_fingerprint_hash(&self, value: &str) -> Result<()> {
        self.storage.set(keys::FINGERPRINT_HASH, value)
    }

    /// The registered participant, `None` until registration succeeds.
    pub fn participant_id(&self) -> Result<Option<ParticipantId>> {
        Ok(self.read(keys::PARTICIPANT_ID)?.map(ParticipantId))
    }

    /// Bind the participant id. Write-once: a different id is rejected.
    pub fn set_participant_id(&self, id: &ParticipantId) -> Result<()> {
        match self.participant_id()? {
            Some(current) if current == *id => Ok(()),
            Some(current) => Err(Error::ParticipantIdImmutable {
                current: current.0,
                requested: id.0.clone(),
            }),
            None => self.storage.set(keys::PARTICIPANT_ID, id.as_str()),
        }
    }

    pub fn entry_information(&self) -> Result<Option<EntryInformation>> {
        self.storage.get_json(keys::ENTRY_INFORMATION)
    }

    pub fn set_entry_information(&self, entry: &EntryInformation) -> Result<()> {
        self.storage.set_json(keys::ENTRY_INFORMATION, entry)
    }

    /// Current recruitment identifiers.
    pub fn hit_params(&self) -> Result<HitParams> {
        Ok(HitParams {
            recruiter: self.recruiter()?,
            hit_id: self.hit_id()?,
            worker_id: self.worker_id()?,
            assignment_id: self.assignment_id()?,
            mode: self.mode()?,
            fingerprint_hash: self.fingerprint_hash()?,
        })
    }

    /// Start fingerprint acquisition in the background.
    ///
    /// The hash is stored whenever it arrives; nothing waits on it. Callers
    /// reading `fingerprint_hash` before then see `None`.
    pub fn request_fingerprint(
        &self,
        provider: Arc<dyn FingerprintProvider>,
    ) -> JoinHandle<Option<String>> {
        let identity = self.clone();
        tokio::spawn(async move {
            match provider.fingerprint().await {
                Ok(hash) => {
                    if let Err(e) = identity.set_fingerprint_hash(&hash) {
                        warn!(error = %e, "Failed to persist fingerprint");
                    }
                    debug!("Fingerprint acquired");
                    Some(hash)
                }
                Err(e) => {
                    warn!(error = %e, "Fingerprint acquisition failed");
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::StaticFingerprint;
    use std::time::Duration;

    fn url(query: &str) -> Url {
        Url::parse(&format!("http://localhost/test.html?{query}")).unwrap()
    }

    #[test]
    fn initialized_from_camel_case_query() {
        let identity = Identity::initialize(
            Storage::memory(),
            &url("recruiter=hotair&hitId=HHH&assignmentId=AAA&workerId=WWW&mode=debug"),
        )
        .unwrap();

        assert_eq!(identity.recruiter().unwrap().as_deref(), Some("hotair"));
        assert_eq!(identity.assignment_id().unwrap().as_deref(), Some("AAA"));
        assert_eq!(identity.hit_id().unwrap().as_deref(), Some("HHH"));
        assert_eq!(identity.worker_id().unwrap().as_deref(), Some("WWW"));
        assert_eq!(identity.unique_id().unwrap().as_deref(), Some("WWW:AAA"));
        assert_eq!(identity.mode().unwrap(), Some(Mode::Debug));
    }

    #[test]
    fn initialized_from_snake_case_query() {
        let identity = Identity::initialize(
            Storage::memory(),
            &url("hit_id=H1&worker_id=W1&assignment_id=A1&mode=debug"),
        )
        .unwrap();

        assert_eq!(identity.unique_id().unwrap().as_deref(), Some("W1:A1"));
        assert_eq!(identity.hit_id().unwrap().as_deref(), Some("H1"));
    }

    #[test]
    fn participant_id_initially_unset() {
        let identity = Identity::initialize(Storage::memory(), &url("workerId=W")).unwrap();
        assert_eq!(identity.participant_id().unwrap(), None);
    }

    #[test]
    fn literal_undefined_is_unset() {
        let identity =
            Identity::initialize(Storage::memory(), &url("participant_id=undefined")).unwrap();
        assert_eq!(identity.participant_id().unwrap(), None);

        let storage = Storage::memory();
        storage.set(keys::PARTICIPANT_ID, "undefined").unwrap();
        assert_eq!(Identity::new(storage).participant_id().unwrap(), None);
    }

    #[test]
    fn values_can_be_set() {
        let identity = Identity::initialize(Storage::memory(), &url("recruiter=hotair")).unwrap();
        identity.set_recruiter("other recruiter").unwrap();
        assert_eq!(
            identity.recruiter().unwrap().as_deref(),
            Some("other recruiter")
        );
    }

    #[test]
    fn entry_information_drops_mode() {
        let identity = Identity::initialize(
            Storage::memory(),
            &url("hit_id=H1&worker_id=W1&assignment_id=A1&mode=debug&extra=1"),
        )
        .unwrap();

        let entry = identity.entry_information().unwrap().unwrap();
        assert_eq!(entry.get("extra").map(String::as_str), Some("1"));
        assert_eq!(entry.get("worker_id").map(String::as_str), Some("W1"));
        assert!(!entry.contains_key("mode"));
    }

    #[test]
    fn navigation_pages_keep_entry_information() {
        let storage = Storage::memory();
        Identity::initialize(storage.clone(), &url("worker_id=W1&assignment_id=A1")).unwrap();
        let identity = Identity::initialize(storage, &url("participant_id=42")).unwrap();

        let entry = identity.entry_information().unwrap().unwrap();
        assert_eq!(entry.get("worker_id").map(String::as_str), Some("W1"));
        assert_eq!(
            identity.participant_id().unwrap(),
            Some(ParticipantId::new("42"))
        );
    }

    #[test]
    fn identity_survives_reload() {
        let storage = Storage::memory();
        let first = Identity::initialize(storage.clone(), &url("worker_id=W1&assignment_id=A1"))
            .unwrap();
        first.set_participant_id(&ParticipantId::from(7)).unwrap();

        let reloaded = Identity::initialize(storage, &url("")).unwrap();
        assert_eq!(reloaded.worker_id().unwrap().as_deref(), Some("W1"));
        assert_eq!(reloaded.participant_id().unwrap(), Some(ParticipantId::from(7)));
    }

    #[test]
    fn participant_id_is_write_once() {
        let identity = Identity::new(Storage::memory());
        identity.set_participant_id(&ParticipantId::from(1)).unwrap();
        identity.set_participant_id(&ParticipantId::from(1)).unwrap();

        let err = identity
            .set_participant_id(&ParticipantId::from(2))
            .unwrap_err();
        assert!(matches!(err, Error::ParticipantIdImmutable { .. }));
        assert_eq!(identity.participant_id().unwrap(), Some(ParticipantId::from(1)));
    }

    #[test]
    fn new_assignment_releases_participant() {
        let storage = Storage::memory();
        let identity =
            Identity::initialize(storage.clone(), &url("worker_id=W&assignment_id=A1")).unwrap();
        identity.set_participant_id(&ParticipantId::from(5)).unwrap();

        let identity = Identity::initialize(storage, &url("worker_id=W&assignment_id=A2")).unwrap();
        assert_eq!(identity.participant_id().unwrap(), None);
        assert_eq!(identity.unique_id().unwrap().as_deref(), Some("W:A2"));
    }

    #[test]
    fn conflicting_entry_participant_keeps_stored_id() {
        let storage = Storage::memory();
        let identity =
            Identity::initialize(storage.clone(), &url("worker_id=W&assignment_id=A1")).unwrap();
        identity.set_participant_id(&ParticipantId::from(5)).unwrap();

        let identity = Identity::initialize(
            storage,
            &url("worker_id=W&assignment_id=A1&participant_id=9"),
        )
        .unwrap();
        assert_eq!(identity.participant_id().unwrap(), Some(ParticipantId::from(5)));
    }

    #[test]
    fn participant_id_deserializes_numbers_and_strings() {
        let a: ParticipantId = serde_json::from_str("42").unwrap();
        let b: ParticipantId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn mode_roundtrips_unknown_values() {
        assert_eq!(Mode::from("lab".to_string()), Mode::Other("lab".into()));
        assert_eq!(String::from(Mode::Sandbox), "sandbox");
    }

    #[tokio::test]
    async fn fingerprint_arrives_later() {
        let identity = Identity::new(Storage::memory());
        let handle = identity.request_fingerprint(Arc::new(
            StaticFingerprint::new("testing").with_delay(Duration::from_millis(20)),
        ));

        assert_eq!(identity.fingerprint_hash().unwrap(), None);
        assert_eq!(handle.await.unwrap().as_deref(), Some("testing"));
        assert_eq!(identity.fingerprint_hash().unwrap().as_deref(), Some("testing"));
    }
}
