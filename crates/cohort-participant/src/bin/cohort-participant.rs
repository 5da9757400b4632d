//! Cohort participant binary
//!
//! Runs one participant through an experiment without a browser: register,
//! wait for quorum, then complete. Questionnaire answers may be given as
//! `name=value` arguments.

use cohort_participant::{ClientConfig, ParticipantSession, RegistrationOutcome};
use std::collections::BTreeMap;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cohort_participant=info,cohort=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::from_env()?;
    tracing::info!(server = %config.base_url, entry = %config.entry_url(), "Starting participant");

    let responses: BTreeMap<String, String> = std::env::args()
        .skip(1)
        .filter_map(|arg| {
            arg.split_once('=')
                .map(|(name, value)| (name.to_string(), value.to_string()))
        })
        .collect();

    let session = ParticipantSession::from_config(&config)?;
    let outcome = session
        .create_participant(|progress| {
            tracing::info!(
                progress = %progress,
                percent = progress.percent(),
                "Waiting room"
            );
        })
        .await?;

    if let RegistrationOutcome::Overrecruited { .. } = outcome {
        tracing::info!("Experiment already full, going straight to debrief");
    }

    let exit = if responses.is_empty() || session.skip_experiment() {
        session.submit_assignment().await?
    } else {
        session.submit_questionnaire(None, &responses).await?
    };

    tracing::info!(participant_id = %outcome.participant_id(), exit = %exit, "Participant finished");
    Ok(())
}
