//! Iteration controller state machine.
//!
//! ```text
//! Idle -> Selecting -> Isolating -> Executing -> Validating -> Verifying -> Finalizing -> Idle
//!            |                                                                  (loop)
//!            +-> Done
//! any in-flight phase -> Finalizing (rollback path), any phase -> Halted
//! ```

use std::fmt;

use serde::Serialize;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Selecting,
    Isolating,
    Executing,
    Validating,
    Verifying,
    Finalizing,
    Done,
    Halted,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Selecting => "selecting",
            Phase::Isolating => "isolating",
            Phase::Executing => "executing",
            Phase::Validating => "validating",
            Phase::Verifying => "verifying",
            Phase::Finalizing => "finalizing",
            Phase::Done => "done",
            Phase::Halted => "halted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Halted)
    }

    /// True while the working tree may hold uncommitted agent output.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Phase::Executing | Phase::Validating | Phase::Verifying
        )
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Phase::Halted {
            return true;
        }
        // Rollback is reachable from every in-flight phase.
        if next == Phase::Finalizing && (self.is_in_flight() || self == Phase::Isolating) {
            return true;
        }
        matches!(
            (self, next),
            (Phase::Idle, Phase::Selecting)
                | (Phase::Selecting, Phase::Isolating)
                | (Phase::Selecting, Phase::Done)
                | (Phase::Isolating, Phase::Executing)
                | (Phase::Executing, Phase::Validating)
                | (Phase::Validating, Phase::Verifying)
                | (Phase::Verifying, Phase::Finalizing)
                | (Phase::Finalizing, Phase::Idle)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the current phase and refuses illegal transitions.
#[derive(Debug)]
pub struct PhaseTracker {
    current: Phase,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            current: Phase::Idle,
        }
    }
}

impl PhaseTracker {
    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn advance(&mut self, next: Phase) -> Result<(), String> {
        if !self.current.can_transition_to(next) {
            error!(from = %self.current, to = %next, "illegal phase transition");
            return Err(format!("illegal phase transition {} -> {}", self.current, next));
        }
        debug!(from = %self.current, to = %next, "phase");
        self.current = next;
        Ok(())
    }
}
