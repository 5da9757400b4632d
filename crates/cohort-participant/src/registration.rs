//! Registration protocol shapes.
//!
//! Two request shapes coexist. Entry-information clients post a structured
//! body; older clients encode the recruitment identifiers positionally in the
//! path. Which one is used depends only on whether entry information was
//! captured at entry.

use crate::error::{Error, Result};
use cohort_identity::{is_defined, EntryInformation, Identity, Mode, ParticipantId};
use cohort_quorum::{QuorumInfo, QuorumProgress, Termination};
use cohort_transport::Payload;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

/// Placeholder sent for identifiers the legacy path needs but does not have.
const UNDEFINED: &str = "undefined";

/// A registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationRequest {
    /// `POST /participant` with a body.
    Structured {
        entry_information: EntryInformation,
        recruiter: Option<String>,
        mode: Option<Mode>,
        fingerprint_hash: Option<String>,
    },
    /// `POST /participant/<worker>/<hit>/<assignment>/<mode>`.
    Legacy {
        worker_id: Option<String>,
        hit_id: Option<String>,
        assignment_id: Option<String>,
        mode: Option<Mode>,
        fingerprint_hash: Option<String>,
        recruiter: Option<String>,
    },
}

impl RegistrationRequest {
    /// Pick the request shape for the current identity.
    pub fn from_identity(identity: &Identity) -> Result<Self> {
        let params = identity.hit_params()?;
        let request = match identity.entry_information()? {
            Some(entry_information) => Self::Structured {
                entry_information,
                recruiter: params.recruiter,
                mode: params.mode,
                fingerprint_hash: params.fingerprint_hash,
            },
            None => Self::Legacy {
                worker_id: params.worker_id,
                hit_id: params.hit_id,
                assignment_id: params.assignment_id,
                mode: params.mode,
                fingerprint_hash: params.fingerprint_hash,
                recruiter: params.recruiter,
            },
        };
        debug!(shape = request.shape(), "Built registration request");
        Ok(request)
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Self::Structured { .. } => "structured",
            Self::Legacy { .. } => "legacy",
        }
    }

    /// Route, including any query string.
    pub fn route(&self) -> Result<String> {
        match self {
            Self::Structured { .. } => Ok("/participant".to_string()),
            Self::Legacy {
                worker_id,
                hit_id,
                assignment_id,
                mode,
                fingerprint_hash,
                recruiter,
            } => {
                let mut url = Url::parse("http://localhost/")?;
                url.path_segments_mut()
                    .map_err(|()| Error::Config("cannot build registration path".into()))?
                    .clear()
                    .push("participant")
                    .push(worker_id.as_deref().unwrap_or(UNDEFINED))
                    .push(hit_id.as_deref().unwrap_or(UNDEFINED))
                    .push(assignment_id.as_deref().unwrap_or(UNDEFINED))
                    .push(mode.as_ref().map(Mode::as_str).unwrap_or(UNDEFINED));
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("fingerprint_hash", fingerprint_hash.as_deref().unwrap_or_default());
                    if let Some(recruiter) = recruiter {
                        query.append_pair("recruiter", recruiter);
                    }
                }
                Ok(match url.query() {
                    Some(query) => format!("{}?{}", url.path(), query),
                    None => url.path().to_string(),
                })
            }
        }
    }

    /// Request body. Absent identifiers are left out rather than sent empty.
    pub fn payload(&self) -> Option<Payload> {
        match self {
            Self::Structured {
                entry_information,
                recruiter,
                mode,
                fingerprint_hash,
            } => {
                let mut body = Payload::new();
                body.insert("entry_information".into(), json!(entry_information));
                if let Some(recruiter) = recruiter {
                    body.insert("recruiter".into(), json!(recruiter));
                }
                if let Some(mode) = mode {
                    body.insert("mode".into(), json!(mode.as_str()));
                }
                if let Some(hash) = fingerprint_hash {
                    body.insert("fingerprint_hash".into(), json!(hash));
                }
                Some(body)
            }
            Self::Legacy { .. } => None,
        }
    }
}

/// Participant record as returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ParticipantRecord {
    pub id: ParticipantId,
    #[serde(default)]
    pub assignment_id: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub hit_id: Option<String>,
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub recruiter_id: Option<String>,
    #[serde(default)]
    pub fingerprint_hash: Option<String>,
}

impl ParticipantRecord {
    /// Write the server's identifiers over the local ones. The server is
    /// authoritative; the participant id stays write-once.
    pub fn apply_to(&self, identity: &Identity) -> Result<()> {
        identity.set_participant_id(&self.id)?;
        let fields: [(&Option<String>, fn(&Identity, &str) -> cohort_identity::Result<()>); 4] = [
            (&self.assignment_id, Identity::set_assignment_id),
            (&self.worker_id, Identity::set_worker_id),
            (&self.hit_id, Identity::set_hit_id),
            (&self.unique_id, Identity::set_unique_id),
        ];
        for (value, set) in fields {
            if let Some(value) = value.as_deref().filter(|v| is_defined(v)) {
                set(identity, value)?;
            }
        }
        if let Some(mode) = &self.mode {
            identity.set_mode(mode)?;
        }
        Ok(())
    }
}

/// `{participant: {...}, quorum?: {...}}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegistrationResponse {
    pub participant: ParticipantRecord,
    #[serde(default)]
    pub quorum: Option<QuorumInfo>,
}

impl RegistrationResponse {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::UnexpectedResponse(e.to_string()))
    }
}

/// What registration means for the quorum wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumDecision {
    /// No quorum in play, or it is already met.
    Proceed,
    /// Arrived after quorum was met; go straight to debrief.
    Skip(QuorumInfo),
    /// Wait for the channel, starting from this progress.
    Wait(QuorumProgress),
}

impl QuorumDecision {
    pub fn decide(quorum: Option<QuorumInfo>, termination: Termination) -> Self {
        match quorum {
            None => Self::Proceed,
            Some(info) if info.overrecruited => Self::Skip(info),
            // an exact wait can never be satisfied once the count overshoots
            Some(info) if termination == Termination::Exact && info.n > info.q => Self::Skip(info),
            Some(info) if info.progress().is_met(termination) => Self::Proceed,
            Some(info) => Self::Wait(info.progress()),
        }
    }
}
