//! Shared deterministic types for the controller core.
//!
//! These types define stable contracts between components. They carry no I/O
//! and serialize deterministically so iteration records stay diffable.

use serde::{Deserialize, Serialize};

use crate::error::LoopError;

/// Outcome of one verification stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Pass,
    Fail,
    /// Stage exceeded its timeout and was killed; counts as a failure.
    TimedOut,
    /// An earlier stage failed, so this one never ran.
    NotRun,
}

impl StageOutcome {
    pub fn passed(self) -> bool {
        self == StageOutcome::Pass
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub outcome: StageOutcome,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Verdict of the verification gate. `passed` is true only if every enabled
/// stage passed, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub stages: Vec<StageResult>,
}

impl VerificationResult {
    /// First stage that did not pass, if any.
    pub fn failed_stage(&self) -> Option<&StageResult> {
        self.stages
            .iter()
            .find(|stage| matches!(stage.outcome, StageOutcome::Fail | StageOutcome::TimedOut))
    }
}

/// What the agent invocation produced, as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResult {
    /// Paths (relative to the repository root) changed in the working tree.
    pub files_changed: Vec<String>,
    pub exit_code: Option<i32>,
    /// True when the configured completion marker was found (or none is configured).
    pub reported_done: bool,
}

/// Why an iteration was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Verification ran and the named stage failed.
    Verification { stage: String },
    /// The agent exited cleanly without reporting completion.
    AgentIncomplete,
    /// A typed controller error; fatal ones halt the run.
    Error(LoopError),
}

impl Rejection {
    pub fn is_fatal(&self) -> bool {
        match self {
            Rejection::Error(err) => err.is_fatal(),
            Rejection::Verification { .. } | Rejection::AgentIncomplete => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Rejection::Verification { .. } => "verification_failure",
            Rejection::AgentIncomplete => "agent_incomplete",
            Rejection::Error(err) => err.kind(),
        }
    }

    /// One-line description suitable for a failure note.
    pub fn describe(&self) -> String {
        match self {
            Rejection::Verification { stage } => format!("verification stage '{stage}' failed"),
            Rejection::AgentIncomplete => "agent did not report completion".to_string(),
            Rejection::Error(err) => err.to_string().replace('\n', " "),
        }
    }
}

/// Resulting action of a finalized iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Committed { commit: String },
    RolledBack { rejection: Rejection },
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Action::Committed { .. } => "commit",
            Action::RolledBack { .. } => "rollback",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_stage_skips_not_run_entries() {
        let result = VerificationResult {
            passed: false,
            stages: vec![
                StageResult {
                    name: "build".to_string(),
                    outcome: StageOutcome::Pass,
                    exit_code: Some(0),
                    duration_ms: 1,
                },
                StageResult {
                    name: "test".to_string(),
                    outcome: StageOutcome::TimedOut,
                    exit_code: None,
                    duration_ms: 1,
                },
                StageResult {
                    name: "e2e".to_string(),
                    outcome: StageOutcome::NotRun,
                    exit_code: None,
                    duration_ms: 0,
                },
            ],
        };
        assert_eq!(result.failed_stage().map(|s| s.name.as_str()), Some("test"));
    }

    #[test]
    fn stage_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&StageOutcome::NotRun).expect("serialize");
        assert_eq!(json, "\"not_run\"");
    }
}
