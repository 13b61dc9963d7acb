//! Version control harness: the transactional wrapper around one iteration.
//!
//! ```text
//! Clean -> Isolated -> Dirty -> Committed
//!                         \-> RolledBack
//! Isolated -> RolledBack
//! ```
//!
//! Each iteration starts from a clean tree on the run branch. Everything the
//! agent does is either absorbed into a single controller commit or discarded
//! by resetting to the snapshot. Calls made in the wrong state fail with
//! [`LoopError::VcsState`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::LoopError;
use crate::io::git::Git;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcsPhase {
    Clean,
    Isolated,
    Dirty,
    Committed,
    RolledBack,
}

/// Rollback point recorded before the agent runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub commit: String,
    pub branch: String,
}

#[derive(Debug)]
pub struct VcsHarness {
    git: Git,
    phase: VcsPhase,
}

impl VcsHarness {
    pub fn new(git: Git) -> Self {
        Self {
            git,
            phase: VcsPhase::Clean,
        }
    }

    pub fn phase(&self) -> VcsPhase {
        self.phase
    }

    /// Check out `branch`, creating it at HEAD if it does not exist.
    #[instrument(skip_all, fields(branch))]
    pub fn ensure_branch(&mut self, branch: &str) -> Result<()> {
        self.expect_phase("ensure_branch", &[VcsPhase::Clean])?;
        self.git.ensure_clean()?;
        if self.git.current_branch()? == branch {
            debug!(branch, "already on run branch");
            return Ok(());
        }
        if self.git.branch_exists(branch)? {
            self.git.checkout_branch(branch)?;
        } else {
            info!(branch, "creating run branch");
            self.git.checkout_new_branch(branch)?;
        }
        Ok(())
    }

    /// Record HEAD as the rollback point. The tree must be clean.
    #[instrument(skip_all)]
    pub fn snapshot(&mut self) -> Result<Snapshot> {
        self.expect_phase(
            "snapshot",
            &[VcsPhase::Clean, VcsPhase::Committed, VcsPhase::RolledBack],
        )?;
        self.git.ensure_clean()?;
        let snapshot = Snapshot {
            commit: self.git.head_sha()?,
            branch: self.git.current_branch()?,
        };
        debug!(commit = %snapshot.commit, branch = %snapshot.branch, "snapshot taken");
        self.phase = VcsPhase::Isolated;
        Ok(snapshot)
    }

    /// The agent has been handed the tree; from here on it may be dirty.
    pub fn mark_dirty(&mut self) -> Result<()> {
        self.expect_phase("mark_dirty", &[VcsPhase::Isolated])?;
        self.phase = VcsPhase::Dirty;
        Ok(())
    }

    /// Paths the agent changed relative to HEAD (including untracked files).
    pub fn changed_paths(&self) -> Result<Vec<String>> {
        self.git.changed_paths()
    }

    /// Fold commits the agent made on top of the snapshot back into the tree.
    ///
    /// Returns true if HEAD had moved. HEAD on another branch, or on a commit
    /// that does not descend from the snapshot, is a [`LoopError::VcsState`].
    #[instrument(skip_all)]
    pub fn absorb_agent_commits(&mut self, snapshot: &Snapshot) -> Result<bool> {
        self.expect_phase("absorb_agent_commits", &[VcsPhase::Dirty])?;
        let branch = self.git.current_branch()?;
        if branch != snapshot.branch {
            return Err(LoopError::vcs_state(format!(
                "agent switched branch from '{}' to '{branch}'",
                snapshot.branch
            ))
            .into());
        }
        let head = self.git.head_sha()?;
        if head == snapshot.commit {
            return Ok(false);
        }
        if !self.git.is_ancestor(&snapshot.commit, &head)? {
            return Err(LoopError::vcs_state(format!(
                "HEAD {head} does not descend from snapshot {}",
                snapshot.commit
            ))
            .into());
        }
        warn!(head = %head, snapshot = %snapshot.commit, "absorbing commits made by the agent");
        self.git.reset_soft(&snapshot.commit)?;
        Ok(true)
    }

    /// Stage everything and commit it. Returns the new commit id.
    #[instrument(skip_all)]
    pub fn commit(&mut self, message: &str) -> Result<String> {
        self.expect_phase("commit", &[VcsPhase::Dirty])?;
        self.git.add_all()?;
        if !self.git.commit_staged(message)? {
            return Err(LoopError::VcsCommit {
                detail: "nothing to commit".to_string(),
            }
            .into());
        }
        let commit = self.git.head_sha()?;
        info!(commit = %commit, "iteration committed");
        self.phase = VcsPhase::Committed;
        Ok(commit)
    }

    /// Restore the tree and HEAD to `snapshot`, then prove it worked.
    #[instrument(skip_all, fields(snapshot = %snapshot.commit))]
    pub fn rollback(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.expect_phase("rollback", &[VcsPhase::Isolated, VcsPhase::Dirty])?;
        self.restore(snapshot)?;
        self.phase = VcsPhase::RolledBack;
        Ok(())
    }

    /// Roll back an iteration interrupted in a previous process.
    pub fn recover(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.expect_phase("recover", &[VcsPhase::Clean])?;
        self.restore(snapshot)
            .context("roll back interrupted iteration")
    }

    fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        if self.git.current_branch().ok().as_deref() != Some(snapshot.branch.as_str()) {
            warn!(branch = %snapshot.branch, "returning to run branch before rollback");
            self.git.checkout_branch_force(&snapshot.branch)?;
        }
        self.git.reset_hard(&snapshot.commit)?;
        self.git.clean_untracked()?;

        let head = self.git.head_sha()?;
        if head != snapshot.commit {
            return Err(LoopError::vcs_state(format!(
                "rollback left HEAD at {head}, expected {}",
                snapshot.commit
            ))
            .into());
        }
        self.git.ensure_clean().context("verify rollback")?;
        info!("rolled back to snapshot");
        Ok(())
    }

    fn expect_phase(&self, op: &str, allowed: &[VcsPhase]) -> Result<(), LoopError> {
        if allowed.contains(&self.phase) {
            return Ok(());
        }
        Err(LoopError::vcs_state(format!(
            "{op} not allowed in harness state {:?}",
            self.phase
        )))
    }
}
