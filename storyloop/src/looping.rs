//! Multi-iteration loop for `storyloop run`.

use anyhow::Result;
use tracing::{info, warn};

use crate::core::phase::{Phase, PhaseTracker};
use crate::core::types::{Action, Rejection};
use crate::io::agent::Agent;
use crate::io::verify::StageRunner;
use crate::select::{SelectOutcome, select_item};
use crate::start::RunContext;
use crate::step::{IterationOutcome, advance, run_iteration};

/// Why a run halted instead of finishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// The next item used up its attempts; it is never skipped.
    AttemptsExhausted {
        id: String,
        attempts: u32,
        max_attempts: u32,
    },
    /// A fatal rejection: the safety contract was broken.
    IntegrityViolation {
        id: String,
        kind: String,
        detail: String,
    },
    /// This invocation ran `max_iterations` iterations.
    IterationLimit { max_iterations: u32 },
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every item passes.
    Done,
    Halted(HaltReason),
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub started_at_iter: u32,
    pub iterations: u32,
    pub committed: u32,
    pub stop: LoopStop,
}

/// Run iterations until every item passes or the run halts.
///
/// Only unexpected errors are returned as `Err`; the working tree has already
/// been rolled back when that happens.
pub fn run_loop<F: FnMut(&IterationOutcome)>(
    ctx: &mut RunContext,
    agent: &dyn Agent,
    stages: &dyn StageRunner,
    mut on_iter: F,
) -> Result<LoopOutcome> {
    let started_at_iter = ctx.run_state.next_iter;
    let max_iterations = ctx.config.max_iterations;
    let mut tracker = PhaseTracker::default();
    let mut iterations = 0u32;
    let mut committed = 0u32;

    let stop = loop {
        advance(&mut tracker, Phase::Selecting)?;
        let item = match select_item(&ctx.spec, &ctx.run_state, ctx.config.max_attempts) {
            SelectOutcome::Done => {
                advance(&mut tracker, Phase::Done)?;
                info!(iterations, "all items pass");
                break LoopStop::Done;
            }
            SelectOutcome::Exhausted(selected) => {
                warn!(item_id = %selected.id, attempts = selected.attempts, "attempts exhausted");
                advance(&mut tracker, Phase::Halted)?;
                break LoopStop::Halted(HaltReason::AttemptsExhausted {
                    id: selected.id,
                    attempts: selected.attempts,
                    max_attempts: selected.max_attempts,
                });
            }
            SelectOutcome::Open(selected) => selected,
        };
        if iterations >= max_iterations {
            advance(&mut tracker, Phase::Halted)?;
            break LoopStop::Halted(HaltReason::IterationLimit { max_iterations });
        }

        let Some(work_item) = ctx.spec.item(&item.id).cloned() else {
            return Err(anyhow::anyhow!("selected item '{}' vanished from spec", item.id));
        };
        let outcome = run_iteration(ctx, &mut tracker, agent, stages, &work_item)?;
        iterations += 1;
        on_iter(&outcome);

        match &outcome.action {
            Action::Committed { .. } => committed += 1,
            Action::RolledBack { rejection } if rejection.is_fatal() => {
                advance(&mut tracker, Phase::Halted)?;
                break LoopStop::Halted(integrity_violation(&outcome.item_id, rejection));
            }
            Action::RolledBack { .. } => {}
        }
        advance(&mut tracker, Phase::Idle)?;
    };

    Ok(LoopOutcome {
        started_at_iter,
        iterations,
        committed,
        stop,
    })
}

fn integrity_violation(id: &str, rejection: &Rejection) -> HaltReason {
    HaltReason::IntegrityViolation {
        id: id.to_string(),
        kind: rejection.kind().to_string(),
        detail: rejection.describe(),
    }
}
