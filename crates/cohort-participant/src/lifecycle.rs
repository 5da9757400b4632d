//! Participant lifecycle states.
//!
//! ```text
//! Unregistered ─▶ Registering ─▶ WaitingForQuorum ─▶ Active ─▶ Finalizing ─▶ Done
//!       │                 └──────────────────────────▶ ▲
//!       └───────────────(already registered)──────────┘
//! (any but Done) ─▶ Errored
//! ```

use crate::error::{Error, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Unregistered,
    Registering,
    WaitingForQuorum,
    Active,
    Finalizing,
    Done,
    Errored,
}

impl LifecycleState {
    /// States reachable from `self` in one step.
    pub fn successors(self) -> &'static [LifecycleState] {
        use LifecycleState::*;
        match self {
            Unregistered => &[Registering, Active, Errored],
            Registering => &[WaitingForQuorum, Active, Errored],
            WaitingForQuorum => &[Active, Errored],
            Active => &[Finalizing, Errored],
            Finalizing => &[Done, Errored],
            Done | Errored => &[],
        }
    }

    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        self.successors().contains(&to)
    }

    /// Validate a transition.
    pub fn transition(self, to: LifecycleState) -> Result<LifecycleState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(Error::IllegalTransition { from: self, to })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Errored)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unregistered => write!(f, "Unregistered"),
            Self::Registering => write!(f, "Registering"),
            Self::WaitingForQuorum => write!(f, "WaitingForQuorum"),
            Self::Active => write!(f, "Active"),
            Self::Finalizing => write!(f, "Finalizing"),
            Self::Done => write!(f, "Done"),
            Self::Errored => write!(f, "Errored"),
        }
    }
}
