//! Cohort Participant - the participant side of a Cohort experiment.
//!
//! A [`ParticipantSession`] is built once at entry and carries everything a
//! participant needs: identity, transport, exit guard, error reporter and
//! quorum channel. It drives the lifecycle:
//!
//! ```text
//! Unregistered → Registering → (WaitingForQuorum) → Active → Finalizing → Done
//! ```
//!
//! with `Errored` reachable from every state but `Done`.
//!
//! # Example
//!
//! ```no_run
//! use cohort_participant::{ClientConfig, ParticipantSession};
//!
//! # async fn run() -> cohort_participant::Result<()> {
//! let config = ClientConfig::from_env()?;
//! let session = ParticipantSession::from_config(&config)?;
//!
//! session
//!     .create_participant(|progress| println!("waiting: {progress}"))
//!     .await?;
//! session.submit_assignment().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod exit_guard;
pub mod lifecycle;
pub mod navigation;
pub mod registration;
pub mod reporter;
pub mod session;

pub use config::ClientConfig;
pub use error::{Error, Result};
pub use exit_guard::{ExitGuard, UnloadDecision, EXIT_WARNING};
pub use lifecycle::LifecycleState;
pub use navigation::{
    has_live_opener, HeadlessNavigator, NavigationError, NavigationEvent, Navigator, OpenerState,
};
pub use registration::{
    ParticipantRecord, QuorumDecision, RegistrationRequest, RegistrationResponse,
};
pub use reporter::{
    find_recovery_form, EmbeddedForm, ErrorReporter, HostPage, HostPageEvent, HttpHostPage,
    RecordingHostPage, RecoveryForm, ReportOutcome, ERROR_ROUTE, RECOVERY_FORM_ID,
};
pub use session::{
    AgentOutcome, ParticipantSession, RegistrationOutcome, SessionBuilder, TransmissionDirection,
    TransmissionFilter, TransmissionStatus, DEFAULT_QUESTIONNAIRE, EXIT_ROUTE,
};
