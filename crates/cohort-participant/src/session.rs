//! The participant session: one context object per participant, driving the
//! lifecycle from registration through quorum to completion.

use crate::error::{Error, Result};
use crate::exit_guard::ExitGuard;
use crate::lifecycle::LifecycleState;
use crate::navigation::{has_live_opener, HeadlessNavigator, Navigator};
use crate::registration::{
    ParticipantRecord, QuorumDecision, RegistrationRequest, RegistrationResponse,
};
use crate::reporter::{ErrorReporter, HostPage, HttpHostPage, ReportOutcome};
use crate::config::ClientConfig;
use cohort_identity::{FingerprintProvider, HostFingerprint, Identity, ParticipantId, Storage};
use cohort_quorum::{
    channel_url, wait_for_quorum_within, BackoffPolicy, ExponentialBackoff, PushConnector,
    QuorumChannel, QuorumInfo, QuorumProgress, Termination, WsConnector,
};
use cohort_transport::{AjaxRejection, Payload, Transport, TransportConfig};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;

/// Question name used when a questionnaire is submitted without one.
pub const DEFAULT_QUESTIONNAIRE: &str = "questionnaire";

/// Final redirect target after completion.
pub const EXIT_ROUTE: &str = "/recruiter-exit";

/// Result of [`ParticipantSession::create_participant`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// Identity already carried a participant; nothing was sent.
    AlreadyRegistered(ParticipantId),
    /// Registered, and quorum (if any) is met.
    Registered {
        participant_id: ParticipantId,
        quorum: Option<QuorumProgress>,
    },
    /// Registered after quorum was already met. The skip flag is set.
    Overrecruited {
        participant_id: ParticipantId,
        quorum: QuorumInfo,
    },
}

impl RegistrationOutcome {
    pub fn participant_id(&self) -> &ParticipantId {
        match self {
            Self::AlreadyRegistered(id) => id,
            Self::Registered { participant_id, .. } | Self::Overrecruited { participant_id, .. } => {
                participant_id
            }
        }
    }
}

/// Result of [`ParticipantSession::create_agent`].
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Created(Value),
    /// The server refused a new node: the participant is finished and should
    /// move on to the debrief.
    ExitToDebrief,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionStatus {
    Pending,
    Received,
    All,
}

impl TransmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Received => "received",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionDirection {
    Incoming,
    Outgoing,
    All,
}

impl TransmissionDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
            Self::All => "all",
        }
    }
}

/// Query for `GET /node/<id>/transmissions`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmissionFilter {
    pub status: Option<TransmissionStatus>,
    pub direction: Option<TransmissionDirection>,
}

impl TransmissionFilter {
    fn payload(&self) -> Payload {
        let mut data = Payload::new();
        if let Some(status) = self.status {
            data.insert("status".into(), json!(status.as_str()));
        }
        if let Some(direction) = self.direction {
            data.insert("direction".into(), json!(direction.as_str()));
        }
        data
    }
}

/// Builder for [`ParticipantSession`]. Unset collaborators get their
/// production implementations.
pub struct SessionBuilder {
    identity: Identity,
    transport: Transport,
    exit_guard: Option<Arc<ExitGuard>>,
    navigator: Option<Arc<dyn Navigator>>,
    host_page: Option<Arc<dyn HostPage>>,
    connector: Option<Arc<dyn PushConnector>>,
    backoff: Option<Arc<dyn BackoffPolicy>>,
    fingerprint: Option<Arc<dyn FingerprintProvider>>,
    termination: Termination,
    quorum_timeout: Option<Duration>,
}

impl SessionBuilder {
    pub fn exit_guard(mut self, guard: Arc<ExitGuard>) -> Self {
        self.exit_guard = Some(guard);
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn host_page(mut self, page: Arc<dyn HostPage>) -> Self {
        self.host_page = Some(page);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn PushConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn fingerprint(mut self, provider: Arc<dyn FingerprintProvider>) -> Self {
        self.fingerprint = Some(provider);
        self
    }

    pub fn termination(mut self, termination: Termination) -> Self {
        self.termination = termination;
        self
    }

    pub fn quorum_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.quorum_timeout = timeout;
        self
    }

    pub fn build(self) -> ParticipantSession {
        let exit_guard = self.exit_guard.unwrap_or_default();
        let navigator = self
            .navigator
            .unwrap_or_else(|| Arc::new(HeadlessNavigator::new(exit_guard.clone())));
        let host_page = self.host_page.unwrap_or_else(|| {
            Arc::new(HttpHostPage::new(
                self.transport.client().clone(),
                self.transport.base_url().clone(),
            ))
        });

        // A participant carried over from an earlier page resumes as active.
        let initial = match self.identity.participant_id() {
            Ok(Some(_)) => LifecycleState::Active,
            _ => LifecycleState::Unregistered,
        };
        let (state, _) = watch::channel(initial);

        ParticipantSession {
            identity: self.identity,
            transport: self.transport,
            exit_guard,
            reporter: ErrorReporter::new(host_page),
            navigator,
            connector: self.connector.unwrap_or_else(|| Arc::new(WsConnector)),
            backoff: self
                .backoff
                .unwrap_or_else(|| Arc::new(ExponentialBackoff::default())),
            fingerprint: self
                .fingerprint
                .unwrap_or_else(|| Arc::new(HostFingerprint::default())),
            termination: self.termination,
            quorum_timeout: self.quorum_timeout,
            state,
            skip_experiment: AtomicBool::new(false),
            question_number: AtomicU32::new(0),
        }
    }
}

/// A participant's session with the experiment server.
pub struct ParticipantSession {
    identity: Identity,
    transport: Transport,
    exit_guard: Arc<ExitGuard>,
    reporter: ErrorReporter,
    navigator: Arc<dyn Navigator>,
    connector: Arc<dyn PushConnector>,
    backoff: Arc<dyn BackoffPolicy>,
    fingerprint: Arc<dyn FingerprintProvider>,
    termination: Termination,
    quorum_timeout: Option<Duration>,
    state: watch::Sender<LifecycleState>,
    skip_experiment: AtomicBool,
    question_number: AtomicU32,
}

impl fmt::Debug for ParticipantSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticipantSession")
            .field("state", &self.state())
            .field("base_url", &self.transport.base_url().as_str())
            .field("termination", &self.termination)
            .finish_non_exhaustive()
    }
}

impl ParticipantSession {
    pub fn builder(identity: Identity, transport: Transport) -> SessionBuilder {
        SessionBuilder {
            identity,
            transport,
            exit_guard: None,
            navigator: None,
            host_page: None,
            connector: None,
            backoff: None,
            fingerprint: None,
            termination: Termination::default(),
            quorum_timeout: None,
        }
    }

    /// Build a session with production collaborators: durable identity
    /// storage under the configured data directory (falling back to memory),
    /// WebSocket push channel and host fingerprinting.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
            warn!(path = ?config.data_dir, error = %e, "Failed to create data directory");
        }
        let storage = Storage::open_or_fallback(&config.data_dir);
        if !storage.available() {
            warn!("Durable storage unavailable, identity will not survive a restart");
        }
        let identity = Identity::initialize(storage, config.entry_url())?;
        let transport = Transport::new(
            TransportConfig::new(config.base_url.clone())
                .with_timeout(config.request_timeout)
                .with_body_encoding(config.body_encoding),
        )?;

        Ok(Self::builder(identity, transport)
            .backoff(Arc::new(config.reconnect.clone()))
            .termination(config.termination)
            .quorum_timeout(config.quorum_timeout)
            .build())
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn exit_guard(&self) -> &Arc<ExitGuard> {
        &self.exit_guard
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Whether the participant arrived after quorum and should go straight to
    /// the debrief. Advisory only.
    pub fn skip_experiment(&self) -> bool {
        self.skip_experiment.load(Ordering::SeqCst)
    }

    /// Register the participant, waiting for quorum if the server asks for it.
    ///
    /// A no-op when the identity already holds a participant id, so reloads
    /// never register twice. `on_progress` fires with the registration's own
    /// quorum numbers before any push update arrives, then once per update.
    pub async fn create_participant<F>(&self, on_progress: F) -> Result<RegistrationOutcome>
    where
        F: FnMut(QuorumProgress),
    {
        if let Some(id) = self.identity.participant_id()? {
            debug!(participant_id = %id, "Participant already registered");
            if self.state() == LifecycleState::Unregistered {
                self.transition(LifecycleState::Active)?;
            }
            return Ok(RegistrationOutcome::AlreadyRegistered(id));
        }

        if let Err(e) = self.fingerprint.probe() {
            warn!(error = %e, "Fingerprinting blocked, refusing to register");
            self.enter_errored();
            return Err(Error::FingerprintUnavailable(e.to_string()));
        }

        self.transition(LifecycleState::Registering)?;
        if self.identity.fingerprint_hash()?.is_none() {
            // stored whenever it arrives; registration goes ahead without it
            drop(self.identity.request_fingerprint(self.fingerprint.clone()));
        }

        let request = self.or_errored(RegistrationRequest::from_identity(&self.identity))?;
        let route = self.or_errored(request.route())?;
        let value = match self.transport.post(&route, request.payload().as_ref()).await {
            Ok(value) => value,
            Err(rejection) => return Err(self.fail(rejection).await),
        };
        let response = self.or_errored(RegistrationResponse::from_value(value))?;
        self.or_errored(response.participant.apply_to(&self.identity))?;

        let participant_id = response.participant.id.clone();
        info!(participant_id = %participant_id, "Participant registered");

        match QuorumDecision::decide(response.quorum, self.termination) {
            QuorumDecision::Proceed => {
                self.transition(LifecycleState::Active)?;
                Ok(RegistrationOutcome::Registered {
                    participant_id,
                    quorum: response.quorum.map(|q| q.progress()),
                })
            }
            QuorumDecision::Skip(quorum) => {
                info!(n = quorum.n, q = quorum.q, "Overrecruited, skipping experiment");
                self.skip_experiment.store(true, Ordering::SeqCst);
                self.transition(LifecycleState::Active)?;
                Ok(RegistrationOutcome::Overrecruited {
                    participant_id,
                    quorum,
                })
            }
            QuorumDecision::Wait(progress) => {
                self.transition(LifecycleState::WaitingForQuorum)?;
                let mut on_progress = on_progress;
                on_progress(progress);
                let reached = self.or_errored(self.await_quorum(&participant_id, on_progress).await)?;
                self.transition(LifecycleState::Active)?;
                Ok(RegistrationOutcome::Registered {
                    participant_id,
                    quorum: Some(reached),
                })
            }
        }
    }

    async fn await_quorum<F>(&self, participant_id: &ParticipantId, on_progress: F) -> Result<QuorumProgress>
    where
        F: FnMut(QuorumProgress),
    {
        let worker_id = self.identity.worker_id()?;
        let url = channel_url(self.transport.base_url(), worker_id.as_deref(), participant_id.as_str())?;
        info!(url = %url, "Waiting for quorum");

        let (channel, mut events) =
            QuorumChannel::spawn(url, self.connector.clone(), self.backoff.clone());
        let result =
            wait_for_quorum_within(&mut events, self.termination, self.quorum_timeout, on_progress)
                .await;
        // nobody reads past quorum; release the buffer before stopping the task
        drop(events);
        channel.close().await;

        let progress = result.map_err(Error::from_quorum)?;
        info!(n = progress.n, q = progress.q, "Quorum reached");
        Ok(progress)
    }

    /// Re-attach to an existing participant by assignment id, or by entry
    /// information when there is none.
    pub async fn load_participant(&self) -> Result<ParticipantRecord> {
        let mut data = Payload::new();
        if let Some(assignment_id) = self.identity.assignment_id()? {
            data.insert("assignment_id".into(), json!(assignment_id));
        } else if let Some(entry) = self.identity.entry_information()? {
            data.insert("entry_information".into(), json!(entry));
        }

        let value = match self.transport.post("/load-participant", Some(&data)).await {
            Ok(value) => value,
            Err(rejection) => return Err(self.fail(rejection).await),
        };
        let record = self.or_errored(RegistrationResponse::from_value(value))?.participant;
        self.or_errored(record.apply_to(&self.identity))?;
        if self.state() == LifecycleState::Unregistered {
            self.transition(LifecycleState::Active)?;
        }
        info!(participant_id = %record.id, "Participant loaded");
        Ok(record)
    }

    /// Fetch the current participant record.
    pub async fn get_participant(&self) -> Result<ParticipantRecord> {
        let id = self.require_participant()?;
        let value = self.transport.get(&format!("/participant/{id}"), None).await?;
        Ok(RegistrationResponse::from_value(value)?.participant)
    }

    /// Create this participant's node. A 403 means there is nothing left to
    /// do and is not an error.
    pub async fn create_agent(&self) -> Result<AgentOutcome> {
        let id = self.require_participant()?;
        match self.transport.post(&format!("/node/{id}"), None).await {
            Ok(value) => Ok(AgentOutcome::Created(value)),
            Err(rejection) if rejection.is_status(403) => {
                info!(participant_id = %id, "Node creation refused, exiting to debrief");
                Ok(AgentOutcome::ExitToDebrief)
            }
            Err(rejection) => Err(rejection.into()),
        }
    }

    pub async fn create_info(&self, node_id: impl fmt::Display, data: &Payload) -> Result<Value> {
        Ok(self.transport.post(&format!("/info/{node_id}"), Some(data)).await?)
    }

    pub async fn get_info(&self, node_id: impl fmt::Display, info_id: impl fmt::Display) -> Result<Value> {
        Ok(self.transport.get(&format!("/info/{node_id}/{info_id}"), None).await?)
    }

    pub async fn get_infos(&self, node_id: impl fmt::Display) -> Result<Value> {
        Ok(self.transport.get(&format!("/node/{node_id}/infos"), None).await?)
    }

    pub async fn get_received_infos(&self, node_id: impl fmt::Display) -> Result<Value> {
        Ok(self
            .transport
            .get(&format!("/node/{node_id}/received_infos"), None)
            .await?)
    }

    pub async fn get_transmissions(
        &self,
        node_id: impl fmt::Display,
        filter: TransmissionFilter,
    ) -> Result<Value> {
        let data = filter.payload();
        Ok(self
            .transport
            .get(&format!("/node/{node_id}/transmissions"), Some(&data))
            .await?)
    }

    /// Read an experiment-level property, such as `quorum`.
    pub async fn get_experiment_property(&self, name: &str) -> Result<Value> {
        Ok(self.transport.get(&format!("/experiment/{name}"), None).await?)
    }

    /// Submit a questionnaire as one payload, then complete the assignment.
    ///
    /// `responses` is the flat name to value map of the questionnaire's
    /// inputs.
    pub async fn submit_questionnaire(
        &self,
        name: Option<&str>,
        responses: &BTreeMap<String, String>,
    ) -> Result<Url> {
        let id = self.require_participant()?;
        self.transition(LifecycleState::Finalizing)?;

        let mut data = Payload::new();
        data.insert("question".into(), json!(name.unwrap_or(DEFAULT_QUESTIONNAIRE)));
        data.insert("number".into(), json!(self.next_question_number()));
        data.insert("response".into(), json!(json!(responses).to_string()));

        if let Err(rejection) = self.transport.post(&format!("/question/{id}"), Some(&data)).await {
            return Err(self.fail(rejection).await);
        }
        debug!(participant_id = %id, fields = responses.len(), "Questionnaire submitted");
        self.complete(&id).await
    }

    /// Submit responses one request per field, in order, then complete the
    /// assignment. For servers that only accept single-question posts; stops
    /// at the first failure, leaving earlier answers recorded.
    pub async fn submit_responses_sequentially(&self, fields: &[(String, String)]) -> Result<Url> {
        let id = self.require_participant()?;
        self.transition(LifecycleState::Finalizing)?;

        for (question, response) in fields {
            let mut data = Payload::new();
            data.insert("question".into(), json!(question));
            data.insert("number".into(), json!(self.next_question_number()));
            data.insert("response".into(), json!(response));
            if let Err(rejection) = self.transport.post(&format!("/question/{id}"), Some(&data)).await {
                return Err(self.fail(rejection).await);
            }
        }
        self.complete(&id).await
    }

    /// Mark the assignment complete and leave for the exit route.
    pub async fn submit_assignment(&self) -> Result<Url> {
        let id = self.require_participant()?;
        self.transition(LifecycleState::Finalizing)?;
        self.complete(&id).await
    }

    async fn complete(&self, id: &ParticipantId) -> Result<Url> {
        // refresh the authoritative identifiers before completing
        match self.transport.get(&format!("/participant/{id}"), None).await {
            Ok(value) => {
                let record = self.or_errored(RegistrationResponse::from_value(value))?.participant;
                self.or_errored(record.apply_to(&self.identity))?;
            }
            Err(rejection) => return Err(self.fail(rejection).await),
        }

        let mut data = Payload::new();
        data.insert("participant_id".into(), json!(id.as_str()));
        if let Err(rejection) = self.transport.post("/worker_complete", Some(&data)).await {
            return Err(self.fail(rejection).await);
        }
        self.transition(LifecycleState::Done)?;
        info!(participant_id = %id, "Assignment complete");

        self.exit_guard.allow_exit();
        let exit = self.page_url(EXIT_ROUTE, id)?;
        if has_live_opener(self.navigator.as_ref()) {
            self.navigator.redirect_opener(&exit)?;
            self.navigator.close()?;
        } else {
            self.navigator.redirect(&exit)?;
        }
        Ok(exit)
    }

    /// Navigate to another experiment page, carrying the participant id.
    pub async fn go_to_page(&self, page: &str) -> Result<Url> {
        let id = self.require_participant()?;
        let url = self.page_url(&format!("/{}", page.trim_start_matches('/')), &id)?;
        self.navigator.redirect(&url)?;
        Ok(url)
    }

    /// Hand a rejection to the Error Reporter.
    pub async fn error(&self, rejection: &AjaxRejection) -> Result<ReportOutcome> {
        self.enter_errored();
        self.reporter.report(rejection, &self.identity).await
    }

    fn page_url(&self, route: &str, id: &ParticipantId) -> Result<Url> {
        let mut url = self.transport.resolve(route)?;
        url.query_pairs_mut().append_pair("participant_id", id.as_str());
        Ok(url)
    }

    fn require_participant(&self) -> Result<ParticipantId> {
        self.identity.participant_id()?.ok_or(Error::NotRegistered)
    }

    fn next_question_number(&self) -> u32 {
        self.question_number.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn transition(&self, to: LifecycleState) -> Result<()> {
        let mut from = to;
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| {
            from = *state;
            match state.transition(to) {
                Ok(next) => {
                    *state = next;
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        if outcome.is_ok() {
            info!(from = %from, to = %to, "Lifecycle transition");
        }
        outcome
    }

    fn enter_errored(&self) {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(LifecycleState::Errored) {
                from = Some(*state);
                *state = LifecycleState::Errored;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            warn!(from = %from, "Lifecycle entered Errored");
        }
    }

    fn or_errored<T, E: Into<Error>>(&self, result: std::result::Result<T, E>) -> Result<T> {
        result.map_err(|e| {
            self.enter_errored();
            e.into()
        })
    }

    /// Route an unhandled rejection to the reporter.
    async fn fail(&self, rejection: AjaxRejection) -> Error {
        self.enter_errored();
        if let Err(e) = self.reporter.report(&rejection, &self.identity).await {
            error!(error = %e, "Failed to deliver error report");
        }
        Error::Rejected(rejection)
    }
}
