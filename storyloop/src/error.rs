//! Typed failures of the iteration controller.
//!
//! These travel inside `anyhow::Error` and are recovered with
//! `downcast_ref::<LoopError>()` wherever the controller has to decide between
//! retrying an item and halting the run. A failed verification is not an
//! error; it is reported through [`crate::core::types::VerificationResult`].

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopError {
    /// Spec file is malformed (schema or semantic invariants).
    #[error("spec format invalid:\n- {}", .errors.join("\n- "))]
    SpecFormat { errors: Vec<String> },

    /// Immutable fields changed relative to the last known-good baseline.
    #[error("spec integrity violated:\n- {}", .errors.join("\n- "))]
    SpecIntegrity { errors: Vec<String> },

    /// A write touched something other than the selected item's `passed`/`notes`.
    #[error("spec mutation rejected:\n- {}", .errors.join("\n- "))]
    SpecMutation { errors: Vec<String> },

    /// Ledger content was not an append of the previous content.
    #[error("ledger {} is append-only: {detail}", .path.display())]
    LedgerIntegrity { path: PathBuf, detail: String },

    /// The agent wrote outside its permitted paths.
    #[error("agent wrote outside allowed paths: {}", .paths.join(", "))]
    WriteScope { paths: Vec<String> },

    /// Repository is not in the state the controller requires.
    #[error("repository state: {detail}")]
    VcsState { detail: String },

    /// Nothing to commit for an iteration that should have produced changes.
    #[error("commit failed: {detail}")]
    VcsCommit { detail: String },

    #[error("agent timed out after {timeout_secs}s")]
    AgentTimeout { timeout_secs: u64 },

    #[error("agent process failed (exit code {exit_code:?}): {detail}")]
    AgentProcess {
        exit_code: Option<i32>,
        detail: String,
    },
}

impl LoopError {
    /// Fatal errors mean the safety contract was broken: roll back and halt.
    /// Everything else is an ordinary failed attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LoopError::SpecFormat { .. }
                | LoopError::SpecIntegrity { .. }
                | LoopError::SpecMutation { .. }
                | LoopError::LedgerIntegrity { .. }
                | LoopError::WriteScope { .. }
                | LoopError::VcsState { .. }
        )
    }

    /// Stable label used in logs and iteration records.
    pub fn kind(&self) -> &'static str {
        match self {
            LoopError::SpecFormat { .. } => "spec_format",
            LoopError::SpecIntegrity { .. } => "spec_integrity",
            LoopError::SpecMutation { .. } => "spec_mutation",
            LoopError::LedgerIntegrity { .. } => "ledger_integrity",
            LoopError::WriteScope { .. } => "write_scope",
            LoopError::VcsState { .. } => "vcs_state",
            LoopError::VcsCommit { .. } => "vcs_commit",
            LoopError::AgentTimeout { .. } => "agent_timeout",
            LoopError::AgentProcess { .. } => "agent_process",
        }
    }

    pub fn vcs_state(detail: impl Into<String>) -> Self {
        LoopError::VcsState {
            detail: detail.into(),
        }
    }
}

/// Extract a typed controller error from an `anyhow` chain, if there is one.
pub fn as_loop_error(err: &anyhow::Error) -> Option<&LoopError> {
    err.chain().find_map(|cause| cause.downcast_ref::<LoopError>())
}
