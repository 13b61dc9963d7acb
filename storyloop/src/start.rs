//! Run preparation: everything `storyloop run` must establish before the
//! first iteration.
//!
//! Preparing a run checks the workdir, loads config and run state, recovers an
//! iteration interrupted by a crash, loads the spec (with integrity checks
//! against the recorded baseline) and checks out the spec's branch.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::core::immutability::Baseline;
use crate::io::config::{StoryloopConfig, load_config};
use crate::io::git::Git;
use crate::io::harness::{Snapshot, VcsHarness};
use crate::io::init::{StoryloopPaths, ensure_storyloop_dir};
use crate::io::run_state::{InFlight, RunState, load_or_default, write_run_state};
use crate::io::spec_store::{load_spec, load_spec_checked};
use crate::spec::Spec;

/// Per-invocation overrides from the CLI.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub spec_path: Option<PathBuf>,
    pub max_iterations: Option<u32>,
    pub max_attempts: Option<u32>,
    pub agent_timeout_secs: Option<u64>,
    pub verify_timeout_secs: Option<u64>,
    /// Accept the current spec as the new known-good baseline.
    pub rebaseline: bool,
    /// Forget attempt counters and failure notes.
    pub reset_attempts: bool,
}

impl RunOptions {
    fn apply(&self, cfg: &mut StoryloopConfig) {
        if let Some(path) = &self.spec_path {
            cfg.spec_path = path.clone();
        }
        if let Some(value) = self.max_iterations {
            cfg.max_iterations = value;
        }
        if let Some(value) = self.max_attempts {
            cfg.max_attempts = value;
        }
        if let Some(value) = self.agent_timeout_secs {
            cfg.agent.timeout_secs = value;
        }
        if let Some(value) = self.verify_timeout_secs {
            cfg.verify.timeout_secs = value;
            for stage in &mut cfg.verify.stages {
                stage.timeout_secs = None;
            }
        }
    }
}

/// Everything an iteration needs, owned for the duration of a run.
#[derive(Debug)]
pub struct RunContext {
    pub paths: StoryloopPaths,
    pub config: StoryloopConfig,
    /// Absolute path of the spec file.
    pub spec_path: PathBuf,
    /// Absolute path of the ledger file.
    pub ledger_path: PathBuf,
    /// Last known-good spec; replaced only by accepted iterations.
    pub spec: Spec,
    pub run_state: RunState,
    pub harness: VcsHarness,
    /// Iteration rolled back during startup, if one was interrupted.
    pub recovered: Option<InFlight>,
}

impl RunContext {
    pub fn write_run_state(&self) -> Result<()> {
        write_run_state(&self.paths.run_state_path, &self.run_state)
    }
}

/// Prepare a run in `root`.
pub fn prepare_run(root: &Path, options: &RunOptions) -> Result<RunContext> {
    debug!(root = %root.display(), "preparing run");
    let git = Git::new(root);
    ensure_toplevel(&git, root)?;

    let paths = StoryloopPaths::new(root);
    ensure_storyloop_dir(&paths)?;

    let mut config = load_config(&paths.config_path)?;
    options.apply(&mut config);
    config.validate().context("invalid run options")?;

    let mut run_state = load_or_default(&paths.run_state_path)?;
    let mut harness = VcsHarness::new(git.clone());

    let recovered = recover_in_flight(&mut harness, &mut run_state, &paths)?;
    if recovered.is_none() {
        git.ensure_clean()
            .context("working tree must be clean before a run")?;
    }
    if options.reset_attempts {
        info!("resetting attempt counters");
        run_state.reset_attempts();
    }

    let spec_path = paths.resolve(&config.spec_path);
    let ledger_path = paths.resolve(&config.ledger_path);

    // The spec names the branch; the branch holds the spec the run continues from.
    let entry_spec = load_spec(&spec_path)?;
    harness.ensure_branch(&entry_spec.branch_name)?;

    let spec = if options.rebaseline {
        let spec = load_spec(&spec_path)?;
        warn!("accepting current spec as the new baseline");
        spec
    } else {
        load_spec_checked(&spec_path, run_state.baseline.as_ref())?
    };
    if spec.branch_name != entry_spec.branch_name {
        return Err(anyhow!(
            "spec on branch '{}' names a different branch '{}'",
            entry_spec.branch_name,
            spec.branch_name
        ));
    }
    run_state.baseline = Some(Baseline::from_spec(&spec));
    write_run_state(&paths.run_state_path, &run_state)?;

    info!(
        project = %spec.project,
        branch = %spec.branch_name,
        items = spec.items.len(),
        "run prepared"
    );
    Ok(RunContext {
        paths,
        config,
        spec_path,
        ledger_path,
        spec,
        run_state,
        harness,
        recovered,
    })
}

fn ensure_toplevel(git: &Git, root: &Path) -> Result<()> {
    let toplevel = git
        .toplevel()
        .with_context(|| format!("{} is not inside a git repository", root.display()))?;
    let root = fs::canonicalize(root).with_context(|| format!("resolve {}", root.display()))?;
    let toplevel = fs::canonicalize(&toplevel)
        .with_context(|| format!("resolve {}", toplevel.display()))?;
    if root != toplevel {
        return Err(anyhow!(
            "workdir {} must be the repository top level ({})",
            root.display(),
            toplevel.display()
        ));
    }
    Ok(())
}

/// Roll back an iteration that never reached finalization and count it as a failed attempt.
fn recover_in_flight(
    harness: &mut VcsHarness,
    run_state: &mut RunState,
    paths: &StoryloopPaths,
) -> Result<Option<InFlight>> {
    let Some(in_flight) = run_state.in_flight.clone() else {
        return Ok(None);
    };
    warn!(
        iter = in_flight.iter,
        item_id = %in_flight.item_id,
        snapshot = %in_flight.snapshot,
        "recovering interrupted iteration"
    );
    harness.recover(&Snapshot {
        commit: in_flight.snapshot.clone(),
        branch: in_flight.branch.clone(),
    })?;
    let attempts = run_state.record_failure(
        &in_flight.item_id,
        format!("iteration {} was interrupted before finalization", in_flight.iter),
    );
    run_state.in_flight = None;
    write_run_state(&paths.run_state_path, run_state)?;
    info!(item_id = %in_flight.item_id, attempts, "interrupted iteration rolled back");
    Ok(Some(in_flight))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LoopError, as_loop_error};
    use crate::io::spec_store::persist_spec;
    use crate::test_support::{TestRepo, item, spec_with};

    fn repo_with_spec() -> TestRepo {
        let repo = TestRepo::new().expect("repo");
        repo.ignore_storyloop_dir().expect("ignore");
        repo.commit_spec(&spec_with(vec![item("a", 1), item("b", 2)]))
            .expect("spec");
        repo
    }

    #[test]
    fn prepares_branch_and_records_baseline() {
        let repo = repo_with_spec();
        let ctx = prepare_run(repo.path(), &RunOptions::default()).expect("prepare");

        assert_eq!(
            repo.git(&["rev-parse", "--abbrev-ref", "HEAD"]).expect("branch"),
            "storyloop/demo"
        );
        assert_eq!(ctx.spec.items.len(), 2);
        assert_eq!(
            ctx.run_state.baseline,
            Some(Baseline::from_spec(&ctx.spec))
        );
        assert!(ctx.recovered.is_none());
    }

    #[test]
    fn dirty_tree_without_marker_is_refused() {
        let repo = repo_with_spec();
        repo.write_file("stray.txt", "x").expect("write");
        let err = prepare_run(repo.path(), &RunOptions::default()).unwrap_err();
        assert_eq!(as_loop_error(&err).map(LoopError::kind), Some("vcs_state"));
    }

    #[test]
    fn subdirectory_workdir_is_refused() {
        let repo = repo_with_spec();
        repo.write_file("sub/keep.txt", "x").expect("write");
        let err = prepare_run(&repo.path().join("sub"), &RunOptions::default()).unwrap_err();
        assert!(err.to_string().contains("top level"));
    }

    #[test]
    fn baseline_drift_requires_rebaseline() {
        let repo = repo_with_spec();
        prepare_run(repo.path(), &RunOptions::default()).expect("first run");

        let mut edited = spec_with(vec![item("a", 1), item("b", 2)]);
        edited.items[0].title = "rewritten by a human".to_string();
        persist_spec(&repo.path().join("prd.json"), &edited).expect("edit");
        repo.git(&["commit", "-q", "-a", "-m", "edit spec"]).expect("commit");

        let err = prepare_run(repo.path(), &RunOptions::default()).unwrap_err();
        assert_eq!(
            as_loop_error(&err).map(LoopError::kind),
            Some("spec_integrity")
        );

        let ctx = prepare_run(
            repo.path(),
            &RunOptions {
                rebaseline: true,
                ..RunOptions::default()
            },
        )
        .expect("rebaseline");
        assert_eq!(ctx.spec.items[0].title, "rewritten by a human");
        prepare_run(repo.path(), &RunOptions::default()).expect("new baseline holds");
    }

    #[test]
    fn interrupted_iteration_is_rolled_back_and_counted() {
        let repo = repo_with_spec();
        let ctx = prepare_run(repo.path(), &RunOptions::default()).expect("prepare");
        let snapshot = repo.head().expect("head");

        let mut state = ctx.run_state.clone();
        state.in_flight = Some(InFlight {
            iter: 1,
            item_id: "a".to_string(),
            snapshot: snapshot.clone(),
            branch: "storyloop/demo".to_string(),
        });
        write_run_state(&ctx.paths.run_state_path, &state).expect("write state");
        repo.write_file("half-done.txt", "partial").expect("agent leftovers");
        repo.write_file("README.md", "clobbered").expect("agent edit");

        let ctx = prepare_run(repo.path(), &RunOptions::default()).expect("recover");
        assert_eq!(ctx.recovered.map(|r| r.item_id), Some("a".to_string()));
        assert_eq!(ctx.run_state.attempts_for("a"), 1);
        assert!(ctx.run_state.in_flight.is_none());
        assert_eq!(repo.head().expect("head"), snapshot);
        assert_eq!(repo.status().expect("status"), "");
        assert_eq!(repo.read_file("README.md").expect("read"), "# demo\n");
    }

    #[test]
    fn cli_overrides_apply_and_are_validated() {
        let mut cfg = StoryloopConfig::default();
        RunOptions {
            max_attempts: Some(2),
            verify_timeout_secs: Some(7),
            ..RunOptions::default()
        }
        .apply(&mut cfg);
        assert_eq!(cfg.max_attempts, 2);
        assert_eq!(cfg.verify.stage_timeout_secs(&cfg.verify.stages[0]), 7);

        let repo = repo_with_spec();
        let err = prepare_run(
            repo.path(),
            &RunOptions {
                max_attempts: Some(0),
                ..RunOptions::default()
            },
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("max_attempts"));
    }
}
