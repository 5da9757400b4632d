//! Guard against accidentally leaving an experiment mid-flow.
//!
//! Off by default: only experiment pages that opt in with
//! [`ExitGuard::set_prevent_exit`] ask for confirmation, so error and
//! completion pages never trap the participant. Deliberate navigation arms a
//! single-use permission with [`ExitGuard::allow_exit`].

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Confirmation text shown when leaving is prevented.
pub const EXIT_WARNING: &str = "Warning: the study is not yet finished. \
Closing the window, refreshing the page or navigating elsewhere \
might prevent you from finishing the experiment.";

/// Outcome of an unload check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadDecision {
    /// Leave silently.
    Proceed,
    /// Ask the participant to confirm, with this message.
    Confirm(&'static str),
}

/// Process-wide exit flags.
#[derive(Debug, Default)]
pub struct ExitGuard {
    prevent_exit: AtomicBool,
    allow_exit_once: AtomicBool,
}

impl ExitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the leave confirmation.
    pub fn set_prevent_exit(&self, prevent: bool) {
        self.prevent_exit.store(prevent, Ordering::SeqCst);
    }

    pub fn prevent_exit(&self) -> bool {
        self.prevent_exit.load(Ordering::SeqCst)
    }

    /// Permit the next unload without confirmation.
    pub fn allow_exit(&self) {
        self.allow_exit_once.store(true, Ordering::SeqCst);
    }

    pub fn allow_exit_once(&self) -> bool {
        self.allow_exit_once.load(Ordering::SeqCst)
    }

    /// Unload hook. Consumes any armed permission.
    pub fn before_unload(&self) -> UnloadDecision {
        let allowed = self.allow_exit_once.swap(false, Ordering::SeqCst);
        if self.prevent_exit() && !allowed {
            debug!("Unload intercepted by exit guard");
            UnloadDecision::Confirm(EXIT_WARNING)
        } else {
            UnloadDecision::Proceed
        }
    }
}
