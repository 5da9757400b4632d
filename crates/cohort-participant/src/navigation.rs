//! Window navigation port.
//!
//! The lifecycle never touches a window directly; it asks a [`Navigator`].
//! [`HeadlessNavigator`] is the implementation used when no browser is
//! attached: it records where the participant would have been sent and
//! consults the [`ExitGuard`] on every departure.

use crate::exit_guard::{ExitGuard, UnloadDecision};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

/// Errors raised by a navigator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NavigationError {
    /// The opener window belongs to another origin and cannot be inspected.
    #[error("opener window is cross-origin")]
    CrossOrigin,

    /// The exit guard asked for confirmation and nobody gave it.
    #[error("leaving {0} needs confirmation")]
    Blocked(String),

    #[error("{0}")]
    Failed(String),
}

/// Moves the participant between pages.
pub trait Navigator: Send + Sync {
    /// Whether this window has a still-open opener. May fail when the opener
    /// cannot be inspected.
    fn opener_open(&self) -> Result<bool, NavigationError>;

    /// Send the opener window to `url`.
    fn redirect_opener(&self, url: &Url) -> Result<(), NavigationError>;

    /// Send this window to `url`.
    fn redirect(&self, url: &Url) -> Result<(), NavigationError>;

    /// Close this window.
    fn close(&self) -> Result<(), NavigationError>;
}

/// Probe the opener, treating any probe failure as "no opener".
pub fn has_live_opener(navigator: &dyn Navigator) -> bool {
    match navigator.opener_open() {
        Ok(open) => open,
        Err(e) => {
            debug!(error = %e, "Opener probe failed, treating as no opener");
            false
        }
    }
}

/// What the headless window's opener looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenerState {
    /// Top-level window.
    #[default]
    None,
    Open,
    Closed,
    /// Opener exists but probing it fails.
    CrossOrigin,
}

/// A recorded navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationEvent {
    Redirect(Url),
    RedirectOpener(Url),
    Close,
    /// A departure refused by the exit guard.
    Blocked(Url),
}

/// Navigator for runs without a browser.
#[derive(Debug)]
pub struct HeadlessNavigator {
    guard: Arc<ExitGuard>,
    opener: OpenerState,
    history: Mutex<Vec<NavigationEvent>>,
}

impl HeadlessNavigator {
    pub fn new(guard: Arc<ExitGuard>) -> Self {
        Self {
            guard,
            opener: OpenerState::None,
            history: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_opener(mut self, opener: OpenerState) -> Self {
        self.opener = opener;
        self
    }

    /// Everything that happened so far, oldest first.
    pub fn history(&self) -> Vec<NavigationEvent> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Where this window currently is, if it has been redirected.
    pub fn location(&self) -> Option<Url> {
        self.history().into_iter().rev().find_map(|event| match event {
            NavigationEvent::Redirect(url) => Some(url),
            _ => None,
        })
    }

    fn record(&self, event: NavigationEvent) {
        if let Ok(mut history) = self.history.lock() {
            history.push(event);
        }
    }

    fn leave(&self, target: Option<&Url>) -> Result<(), NavigationError> {
        match self.guard.before_unload() {
            UnloadDecision::Proceed => Ok(()),
            UnloadDecision::Confirm(message) => {
                let target_str = target.map(Url::to_string).unwrap_or_else(|| "window".into());
                warn!(target = %target_str, message, "Departure blocked by exit guard");
                if let Some(url) = target {
                    self.record(NavigationEvent::Blocked(url.clone()));
                }
                Err(NavigationError::Blocked(target_str))
            }
        }
    }
}

impl Navigator for HeadlessNavigator {
    fn opener_open(&self) -> Result<bool, NavigationError> {
        match self.opener {
            OpenerState::None | OpenerState::Closed => Ok(false),
            OpenerState::Open => Ok(true),
            OpenerState::CrossOrigin => Err(NavigationError::CrossOrigin),
        }
    }

    fn redirect_opener(&self, url: &Url) -> Result<(), NavigationError> {
        if self.opener != OpenerState::Open {
            return Err(NavigationError::Failed("no opener window".into()));
        }
        info!(url = %url, "Redirecting opener window");
        self.record(NavigationEvent::RedirectOpener(url.clone()));
        Ok(())
    }

    fn redirect(&self, url: &Url) -> Result<(), NavigationError> {
        self.leave(Some(url))?;
        info!(url = %url, "Redirecting");
        self.record(NavigationEvent::Redirect(url.clone()));
        Ok(())
    }

    fn close(&self) -> Result<(), NavigationError> {
        self.leave(None)?;
        info!("Closing window");
        self.record(NavigationEvent::Close);
        Ok(())
    }
}
