//! Run state storage for iteration bookkeeping.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::immutability::Baseline;
use crate::io::fs_atomic::write_atomic;

/// Persisted bookkeeping for the controller (`.storyloop/state/run_state.json`).
///
/// The file sits in the git-ignored controller directory, so rollbacks never
/// touch it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    /// Next iteration number (1-indexed, monotonically increasing across runs).
    pub next_iter: u32,
    /// Failed attempts per item id.
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    /// Most recent failure description per item id.
    #[serde(default)]
    pub last_failure: BTreeMap<String, String>,
    /// Fingerprints of the last known-good spec.
    #[serde(default)]
    pub baseline: Option<Baseline>,
    /// Set between snapshot and finalization; a leftover marker means a crash.
    #[serde(default)]
    pub in_flight: Option<InFlight>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InFlight {
    pub iter: u32,
    pub item_id: String,
    /// Commit to roll back to.
    pub snapshot: String,
    pub branch: String,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            next_iter: 1,
            attempts: BTreeMap::new(),
            last_failure: BTreeMap::new(),
            baseline: None,
            in_flight: None,
        }
    }
}

impl RunState {
    pub fn attempts_for(&self, item_id: &str) -> u32 {
        self.attempts.get(item_id).copied().unwrap_or(0)
    }

    pub fn last_failure_for(&self, item_id: &str) -> Option<&str> {
        self.last_failure.get(item_id).map(String::as_str)
    }

    /// Count a failed attempt and remember why. Returns the new attempt count.
    pub fn record_failure(&mut self, item_id: &str, note: impl Into<String>) -> u32 {
        let count = self.attempts.entry(item_id.to_string()).or_insert(0);
        *count += 1;
        self.last_failure.insert(item_id.to_string(), note.into());
        *count
    }

    /// Forget the failure note once an item has been accepted.
    pub fn record_success(&mut self, item_id: &str) {
        self.last_failure.remove(item_id);
    }

    pub fn reset_attempts(&mut self) {
        self.attempts.clear();
        self.last_failure.clear();
    }
}

/// Load run state from disk.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(
        next_iter = state.next_iter,
        in_flight = state.in_flight.is_some(),
        "run state loaded"
    );
    Ok(state)
}

/// Load run state, treating a missing file as a fresh state.
pub fn load_or_default(path: &Path) -> Result<RunState> {
    if !path.exists() {
        return Ok(RunState::default());
    }
    load_run_state(path)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), next_iter = state.next_iter, "writing run state");
    let mut buf = serde_json::to_string_pretty(state).context("serialize run state")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{item, spec_with};

    #[test]
    fn run_state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run_state.json");

        let mut state = RunState {
            next_iter: 5,
            baseline: Some(Baseline::from_spec(&spec_with(vec![item("a", 0)]))),
            in_flight: Some(InFlight {
                iter: 4,
                item_id: "a".to_string(),
                snapshot: "abc123".to_string(),
                branch: "feature".to_string(),
            }),
            ..RunState::default()
        };
        state.record_failure("a", "verification failed at stage 'test'");

        write_run_state(&path, &state).expect("write");
        assert_eq!(load_run_state(&path).expect("load"), state);
    }

    #[test]
    fn run_state_defaults_are_deterministic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run_state.json");

        write_run_state(&path, &RunState::default()).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        let expected = "{\n  \"next_iter\": 1,\n  \"attempts\": {},\n  \"last_failure\": {},\n  \"baseline\": null,\n  \"in_flight\": null\n}\n";
        assert_eq!(contents, expected);
    }

    #[test]
    fn failures_accumulate_and_success_clears_note() {
        let mut state = RunState::default();
        assert_eq!(state.record_failure("a", "first"), 1);
        assert_eq!(state.record_failure("a", "second"), 2);
        assert_eq!(state.last_failure_for("a"), Some("second"));

        state.record_success("a");
        assert_eq!(state.attempts_for("a"), 2);
        assert_eq!(state.last_failure_for("a"), None);

        state.reset_attempts();
        assert_eq!(state.attempts_for("a"), 0);
    }

    #[test]
    fn missing_file_loads_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = load_or_default(&temp.path().join("absent.json")).expect("load");
        assert_eq!(state, RunState::default());
    }
}
