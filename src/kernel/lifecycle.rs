//! Node lifecycle state machine.
//!
//! Legal edges:
//!
//! | From    | To       |
//! |---------|----------|
//! | Init    | Running  |
//! | Running | Paused   |
//! | Paused  | Running  |
//! | Running | Shutdown |
//! | Paused  | Shutdown |
//!
//! A transition to the current state is a no-op and is not recorded.
//! `Shutdown` is terminal.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Operating state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Bootstrapped, not yet accepting syscalls.
    #[default]
    Init,
    /// Accepting syscalls.
    Running,
    /// Held for operator review. Syscalls still pass the readiness gate.
    Paused,
    /// Terminal.
    Shutdown,
}

impl LifecycleState {
    /// All states, in declaration order.
    pub const ALL: [Self; 4] = [Self::Init, Self::Running, Self::Paused, Self::Shutdown];

    /// Whether `self -> to` is an edge in the transition table.
    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Init, Self::Running)
                | (Self::Running, Self::Paused)
                | (Self::Paused, Self::Running)
                | (Self::Running, Self::Shutdown)
                | (Self::Paused, Self::Shutdown)
        )
    }

    /// Whether syscalls may pass the readiness gate in this state.
    pub fn accepts_syscalls(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Lifecycle errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// The requested edge is not in the transition table.
    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        /// State at the time of the attempt.
        from: LifecycleState,
        /// Requested target state.
        to: LifecycleState,
    },
    /// A recorded history does not describe a legal walk from `Init`.
    #[error("corrupt lifecycle history at entry {index}: {reason}")]
    CorruptHistory {
        /// Offending entry.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },
}

/// One recorded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// State before.
    pub from: LifecycleState,
    /// State after.
    pub to: LifecycleState,
    /// Logical tick at which the transition happened.
    pub tick: u64,
}

/// Current state plus the append-only transition history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    state: LifecycleState,
    history: Vec<Transition>,
}

impl Lifecycle {
    /// Fresh lifecycle in `Init` with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a recorded history, validating every edge.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::CorruptHistory`] if an entry does not start
    /// where the previous one ended, is an illegal edge, or goes back in time.
    pub fn from_history(history: Vec<Transition>) -> Result<Self, LifecycleError> {
        let mut state = LifecycleState::Init;
        let mut last_tick = None;
        for (index, t) in history.iter().enumerate() {
            if t.from != state {
                return Err(LifecycleError::CorruptHistory {
                    index,
                    reason: format!("starts at {} but state is {state}", t.from),
                });
            }
            if !t.from.can_transition_to(t.to) {
                return Err(LifecycleError::CorruptHistory {
                    index,
                    reason: format!("illegal edge {} -> {}", t.from, t.to),
                });
            }
            if last_tick.is_some_and(|prev| t.tick < prev) {
                return Err(LifecycleError::CorruptHistory {
                    index,
                    reason: format!("tick {} precedes previous entry", t.tick),
                });
            }
            last_tick = Some(t.tick);
            state = t.to;
        }
        Ok(Self { state, history })
    }

    /// Attempt a transition at logical time `tick`.
    ///
    /// Returns `Ok(None)` for a same-state no-op and `Ok(Some(t))` for a
    /// recorded transition.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`]; state and history are
    /// left untouched.
    pub fn transition(
        &mut self,
        to: LifecycleState,
        tick: u64,
    ) -> Result<Option<Transition>, LifecycleError> {
        if to == self.state {
            return Ok(None);
        }
        if !self.state.can_transition_to(to) {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        let t = Transition {
            from: self.state,
            to,
            tick,
        };
        self.history.push(t);
        self.state = to;
        info!(from = %t.from, to = %t.to, tick, "lifecycle transition");
        Ok(Some(t))
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Recorded transitions, oldest first.
    pub fn history(&self) -> &[Transition] {
        &self.history
    }
}
