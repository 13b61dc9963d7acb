//! Selection helpers for `storyloop select`, `storyloop status` and the loop.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::selector::{is_exhausted, select_next};
use crate::io::config::load_config;
use crate::io::init::StoryloopPaths;
use crate::io::run_state::{RunState, load_or_default};
use crate::io::spec_store::load_spec;
use crate::spec::Spec;

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Every item passes (or there are none).
    Done,
    /// Open item selected.
    Open(SelectedItem),
    /// Selected item already used up its attempts.
    Exhausted(SelectedItem),
}

/// Minimal selected item metadata for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedItem {
    pub id: String,
    pub title: String,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// One row of `storyloop status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemStatus {
    pub id: String,
    pub title: String,
    pub priority: i64,
    pub passed: bool,
    pub attempts: u32,
    pub last_failure: Option<String>,
}

/// Select the next item from an in-memory spec and the persisted attempt counters.
///
/// An exhausted item is reported, never skipped: later items wait behind it.
pub fn select_item(spec: &Spec, run_state: &RunState, max_attempts: u32) -> SelectOutcome {
    let Some(item) = select_next(spec) else {
        return SelectOutcome::Done;
    };
    let attempts = run_state.attempts_for(&item.id);
    let selected = SelectedItem {
        id: item.id.clone(),
        title: item.title.clone(),
        attempts,
        max_attempts,
    };
    if is_exhausted(item, attempts, max_attempts) {
        return SelectOutcome::Exhausted(selected);
    }
    SelectOutcome::Open(selected)
}

/// Every item in execution order with its attempt bookkeeping.
pub fn item_statuses(spec: &Spec, run_state: &RunState) -> Vec<ItemStatus> {
    spec.ordered_items()
        .into_iter()
        .map(|item| ItemStatus {
            id: item.id.clone(),
            title: item.title.clone(),
            priority: item.priority,
            passed: item.passed,
            attempts: run_state.attempts_for(&item.id),
            last_failure: run_state.last_failure_for(&item.id).map(str::to_string),
        })
        .collect()
}

/// Load config, run state and spec from `root`.
pub fn load_for_selection(root: &Path) -> Result<(Spec, RunState, u32)> {
    let paths = StoryloopPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let run_state = load_or_default(&paths.run_state_path)?;
    let spec = load_spec(&paths.resolve(&config.spec_path))
        .with_context(|| "load spec for selection")?;
    Ok((spec, run_state, config.max_attempts))
}

/// Load everything from disk and select the next item.
pub fn select_from_root(root: &Path) -> Result<SelectOutcome> {
    let (spec, run_state, max_attempts) = load_for_selection(root)?;
    Ok(select_item(&spec, &run_state, max_attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::spec_store::persist_spec;
    use crate::test_support::{item, passed_item, spec_with};

    #[test]
    fn select_returns_open_item_with_attempts() {
        let spec = spec_with(vec![passed_item("a", 1), item("b", 2), item("c", 3)]);
        let mut state = RunState::default();
        state.record_failure("b", "stage 'test' failed");

        assert_eq!(
            select_item(&spec, &state, 3),
            SelectOutcome::Open(SelectedItem {
                id: "b".to_string(),
                title: "b title".to_string(),
                attempts: 1,
                max_attempts: 3,
            })
        );
    }

    #[test]
    fn exhausted_item_blocks_later_items() {
        let spec = spec_with(vec![item("a", 1), item("b", 2)]);
        let mut state = RunState::default();
        state.record_failure("a", "x");
        state.record_failure("a", "y");

        match select_item(&spec, &state, 2) {
            SelectOutcome::Exhausted(selected) => assert_eq!(selected.id, "a"),
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[test]
    fn done_when_everything_passed() {
        let spec = spec_with(vec![passed_item("a", 1)]);
        assert_eq!(select_item(&spec, &RunState::default(), 3), SelectOutcome::Done);
    }

    #[test]
    fn statuses_follow_execution_order() {
        let spec = spec_with(vec![item("late", 9), passed_item("early", 1)]);
        let mut state = RunState::default();
        state.record_failure("late", "agent timed out after 5s");

        let rows = item_statuses(&spec, &state);
        assert_eq!(rows[0].id, "early");
        assert!(rows[0].passed);
        assert_eq!(rows[1].attempts, 1);
        assert_eq!(
            rows[1].last_failure.as_deref(),
            Some("agent timed out after 5s")
        );
    }

    #[test]
    fn select_from_root_uses_default_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        persist_spec(
            &temp.path().join("prd.json"),
            &spec_with(vec![item("only", 0)]),
        )
        .expect("write spec");

        match select_from_root(temp.path()).expect("select") {
            SelectOutcome::Open(selected) => {
                assert_eq!(selected.id, "only");
                assert_eq!(selected.max_attempts, 5);
            }
            other => panic!("expected open, got {other:?}"),
        }
    }
}
