//! Orchestration for a single iteration.
//!
//! One iteration works on exactly one item: snapshot, run the agent, validate
//! what it wrote, verify, then either commit once or roll back to the snapshot.
//! Every failure after the snapshot goes through the rollback path.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, error, info, info_span, warn};

use crate::core::immutability::check_permitted_mutation;
use crate::core::phase::{Phase, PhaseTracker};
use crate::core::state_update::apply_outcome;
use crate::core::types::{Action, Rejection, VerificationResult};
use crate::error::{LoopError, as_loop_error};
use crate::io::agent::{Agent, AgentRequest, invoke_agent, paths_outside_scope};
use crate::io::harness::Snapshot;
use crate::io::iteration_log::{IterationMeta, IterationPaths, write_meta, write_prompt, write_text};
use crate::io::ledger::{check_append, read_ledger};
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::run_state::InFlight;
use crate::io::spec_store::{load_spec, persist_spec};
use crate::io::verify::{StageRunner, verify};
use crate::spec::{Spec, WorkItem};
use crate::start::RunContext;

/// Result of a single finalized iteration.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub iter: u32,
    pub item_id: String,
    /// 1-based attempt number for the item.
    pub attempt: u32,
    pub action: Action,
    pub verification: Option<VerificationResult>,
}

enum Verdict {
    Accepted { spec: Spec, commit: String },
    Rejected(Rejection),
}

/// Facts gathered while attempting, kept even when the attempt fails.
#[derive(Debug, Default)]
struct AttemptRecord {
    files_changed: Vec<String>,
    verification: Option<VerificationResult>,
    prompt_bytes: usize,
    dropped_sections: Vec<String>,
}

/// Advance the controller state machine; an illegal move is a bug.
pub(crate) fn advance(tracker: &mut PhaseTracker, next: Phase) -> Result<()> {
    tracker.advance(next).map_err(|err| anyhow!(err))
}

/// Run one iteration on `item`.
///
/// Expects `tracker` in [`Phase::Selecting`] and leaves it in
/// [`Phase::Finalizing`]. Rejections (including fatal ones) are returned as
/// [`Action::RolledBack`]; only unexpected errors are returned as `Err`, after
/// the tree has been rolled back.
pub fn run_iteration(
    ctx: &mut RunContext,
    tracker: &mut PhaseTracker,
    agent: &dyn Agent,
    stages: &dyn StageRunner,
    item: &WorkItem,
) -> Result<IterationOutcome> {
    let started_at = Utc::now();
    let clock = Instant::now();
    let iter = ctx.run_state.next_iter;
    let attempt = ctx.run_state.attempts_for(&item.id) + 1;
    let span = info_span!("iteration", iter, item_id = %item.id, attempt);
    let _enter = span.enter();

    let paths = IterationPaths::new(&ctx.paths.iterations_dir, iter);
    paths.create()?;

    advance(tracker, Phase::Isolating)?;
    let snapshot = ctx.harness.snapshot()?;
    ctx.run_state.next_iter = iter + 1;
    ctx.run_state.in_flight = Some(InFlight {
        iter,
        item_id: item.id.clone(),
        snapshot: snapshot.commit.clone(),
        branch: snapshot.branch.clone(),
    });
    ctx.write_run_state()?;
    info!(snapshot = %snapshot.commit, "iteration started");

    let mut record = AttemptRecord::default();
    let verdict = attempt_item(
        ctx,
        tracker,
        agent,
        stages,
        item,
        &snapshot,
        &paths,
        &mut record,
    );

    let action = match verdict {
        Ok(Verdict::Accepted { spec, commit }) => {
            ctx.spec = spec;
            ctx.run_state.record_success(&item.id);
            Action::Committed { commit }
        }
        Ok(Verdict::Rejected(rejection)) => {
            roll_back(ctx, tracker, &snapshot)?;
            Action::RolledBack { rejection }
        }
        Err(err) => {
            roll_back(ctx, tracker, &snapshot)?;
            match as_loop_error(&err).cloned() {
                Some(typed) => Action::RolledBack {
                    rejection: Rejection::Error(typed),
                },
                None => {
                    error!(err = %format!("{err:#}"), "controller error, iteration rolled back");
                    write_text(
                        &paths.dir.join("controller_error.log"),
                        &format!("controller error: {err:#}\n"),
                    )?;
                    ctx.run_state
                        .record_failure(&item.id, format!("controller error: {err:#}"));
                    ctx.run_state.in_flight = None;
                    ctx.write_run_state()?;
                    return Err(err);
                }
            }
        }
    };

    if let Action::RolledBack { rejection } = &action {
        let attempts = ctx.run_state.record_failure(&item.id, rejection.describe());
        warn!(kind = rejection.kind(), attempts, "iteration rejected");
    }
    ctx.run_state.in_flight = None;
    ctx.write_run_state()?;

    let mut meta = IterationMeta {
        iter,
        item_id: item.id.clone(),
        attempt,
        snapshot: snapshot.commit.clone(),
        action: String::new(),
        commit: None,
        rejection: None,
        verification: record.verification.clone(),
        files_changed: record.files_changed,
        prompt_bytes: record.prompt_bytes,
        dropped_sections: record.dropped_sections,
        started_at: started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ended_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        duration_ms: clock.elapsed().as_millis() as u64,
    };
    meta.record_action(&action);
    write_meta(&paths, &meta)?;
    info!(action = action.label(), "iteration finalized");

    Ok(IterationOutcome {
        iter,
        item_id: item.id.clone(),
        attempt,
        action,
        verification: record.verification,
    })
}

#[allow(clippy::too_many_arguments)]
fn attempt_item(
    ctx: &mut RunContext,
    tracker: &mut PhaseTracker,
    agent: &dyn Agent,
    stages: &dyn StageRunner,
    item: &WorkItem,
    snapshot: &Snapshot,
    paths: &IterationPaths,
    record: &mut AttemptRecord,
) -> Result<Verdict> {
    let ledger_before = read_ledger(&ctx.ledger_path)?;
    let prompt = PromptBuilder::new(
        ctx.config.prompt.budget_bytes,
        ctx.config.prompt.ledger_tail_bytes,
    )
    .build(&PromptInputs {
        project: ctx.spec.project.clone(),
        spec_path: ctx.config.spec_path.display().to_string(),
        ledger_path: ctx.config.ledger_path.display().to_string(),
        item: item.clone(),
        constraints: ctx.spec.constraints.clone(),
        ledger: ledger_before.clone(),
        done_marker: ctx.config.agent.done_marker.clone(),
        allowed_paths: ctx.config.agent.allowed_paths.clone(),
    })?;
    record.prompt_bytes = prompt.len();
    record.dropped_sections = prompt.dropped_sections().to_vec();
    write_prompt(paths, prompt.as_str())?;

    advance(tracker, Phase::Executing)?;
    ctx.harness.mark_dirty()?;
    let request = AgentRequest {
        workdir: ctx.paths.root.clone(),
        payload: prompt.as_str().to_string(),
        log_path: paths.agent_log_path.clone(),
        timeout: Duration::from_secs(ctx.config.agent.timeout_secs),
        output_limit_bytes: ctx.config.agent.output_limit_bytes,
    };
    let result = invoke_agent(agent, &ctx.harness, &request, &ctx.config.agent.done_marker)?;
    record.files_changed = result.files_changed.clone();

    advance(tracker, Phase::Validating)?;
    let ledger_after = read_ledger(&ctx.ledger_path)?;
    check_append(&ctx.ledger_path, &ledger_before, &ledger_after)?;
    let spec_after = load_agent_spec(&ctx.spec_path, &ctx.spec, &item.id)?;
    ctx.harness.absorb_agent_commits(snapshot)?;
    record.files_changed = ctx.harness.changed_paths()?;
    let outside = paths_outside_scope(
        &record.files_changed,
        &ctx.config.agent.allowed_paths,
        &[ctx.config.spec_path.as_path(), ctx.config.ledger_path.as_path()],
    );
    if !outside.is_empty() {
        return Err(LoopError::WriteScope { paths: outside }.into());
    }

    if !result.reported_done {
        info!("agent did not report completion, skipping verification");
        return Ok(Verdict::Rejected(Rejection::AgentIncomplete));
    }

    advance(tracker, Phase::Verifying)?;
    let verification = verify(stages, &ctx.config.verify, &ctx.paths.root, paths)?;
    record.verification = Some(verification.clone());
    if !verification.passed {
        let stage = verification
            .failed_stage()
            .map(|stage| stage.name.clone())
            .unwrap_or_default();
        return Ok(Verdict::Rejected(Rejection::Verification { stage }));
    }

    advance(tracker, Phase::Finalizing)?;
    if record.files_changed.is_empty() {
        return Err(LoopError::VcsCommit {
            detail: "agent produced no changes".to_string(),
        }
        .into());
    }
    let notes = spec_after
        .item(&item.id)
        .map(|written| written.notes.clone())
        .unwrap_or_default();
    let next = apply_outcome(&ctx.spec, &item.id, true, &notes)?;
    persist_spec(&ctx.spec_path, &next)?;
    let reloaded = load_spec(&ctx.spec_path).context("reload persisted spec")?;
    if reloaded != next {
        return Err(LoopError::SpecMutation {
            errors: vec!["persisted spec does not read back identically".to_string()],
        }
        .into());
    }
    let commit = ctx
        .harness
        .commit(&format!("{}: {}", item.id, item.title))?;
    debug!(commit = %commit, "accepted");
    Ok(Verdict::Accepted { spec: next, commit })
}

/// Read the spec as the agent left it and hold it to the one-item mutation rule.
fn load_agent_spec(path: &Path, before: &Spec, item_id: &str) -> Result<Spec> {
    let after = load_spec(path).map_err(|err| LoopError::SpecMutation {
        errors: vec![format!("spec file no longer loads: {err:#}")],
    })?;
    let errors = check_permitted_mutation(before, &after, item_id);
    if !errors.is_empty() {
        return Err(LoopError::SpecMutation { errors }.into());
    }
    Ok(after)
}

fn roll_back(ctx: &mut RunContext, tracker: &mut PhaseTracker, snapshot: &Snapshot) -> Result<()> {
    if tracker.current() != Phase::Finalizing {
        advance(tracker, Phase::Finalizing)?;
    }
    ctx.harness
        .rollback(snapshot)
        .with_context(|| format!("roll back to snapshot {}", snapshot.commit))
}
