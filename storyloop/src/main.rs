//! Command-line entry point for the storyloop controller.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use storyloop::core::types::Action;
use storyloop::error::{LoopError, as_loop_error};
use storyloop::exit_codes;
use storyloop::io::agent::CommandAgent;
use storyloop::io::config::load_config;
use storyloop::io::init::{InitOptions, StoryloopPaths, init_storyloop};
use storyloop::io::ledger::append_entry;
use storyloop::io::verify::CommandStageRunner;
use storyloop::logging;
use storyloop::looping::{HaltReason, LoopStop, run_loop};
use storyloop::select::{SelectOutcome, item_statuses, load_for_selection, select_item};
use storyloop::start::{RunOptions, prepare_run};
use storyloop::step::IterationOutcome;
use storyloop::validate::{BaselineCheck, validate_storyloop};

#[derive(Parser)]
#[command(
    name = "storyloop",
    version,
    about = "Drive a coding agent through a work-item list, one verified commit per item"
)]
struct Cli {
    /// Repository root to operate on.
    #[arg(long, global = true, default_value = ".")]
    workdir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.storyloop/` with a default config and empty run state.
    Init {
        /// Overwrite existing controller files.
        #[arg(short, long)]
        force: bool,
    },
    /// Check config, spec format and spec integrity against the recorded baseline.
    Validate,
    /// Print the id of the next item to work on.
    Select,
    /// Print every item with its pass state and attempt count.
    Status,
    /// Append an entry to the learnings ledger.
    Learn {
        /// Entry text; multi-line text becomes one bullet.
        text: String,
    },
    /// Run iterations until every item passes or the run halts.
    Run {
        /// Spec file, relative to the workdir.
        #[arg(long)]
        spec: Option<PathBuf>,
        #[arg(long)]
        max_iterations: Option<u32>,
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long)]
        agent_timeout_secs: Option<u64>,
        /// Applies to every stage, replacing per-stage timeouts.
        #[arg(long)]
        verify_timeout_secs: Option<u64>,
        /// Accept the current spec as the new baseline for integrity checks.
        #[arg(long)]
        rebaseline: bool,
        /// Forget attempt counters and failure notes before starting.
        #[arg(long)]
        reset_attempts: bool,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::ERROR
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let root = fs::canonicalize(&cli.workdir)
        .with_context(|| format!("resolve workdir {}", cli.workdir.display()))?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Validate => Ok(cmd_validate(&root)),
        Command::Select => cmd_select(&root),
        Command::Status => cmd_status(&root),
        Command::Learn { text } => cmd_learn(&root, &text),
        Command::Run {
            spec,
            max_iterations,
            max_attempts,
            agent_timeout_secs,
            verify_timeout_secs,
            rebaseline,
            reset_attempts,
        } => cmd_run(
            &root,
            &RunOptions {
                spec_path: spec,
                max_iterations,
                max_attempts,
                agent_timeout_secs,
                verify_timeout_secs,
                rebaseline,
                reset_attempts,
            },
        ),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_storyloop(root, &InitOptions { force })?;
    println!("initialized {}", paths.storyloop_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path) -> i32 {
    match validate_storyloop(root) {
        Ok(outcome) => {
            let baseline = match outcome.baseline {
                BaselineCheck::NotRecorded => "no baseline recorded",
                BaselineCheck::Matches => "baseline ok",
            };
            println!(
                "ok: {} ({} items, {} passed, {baseline})",
                outcome.project, outcome.items, outcome.passed
            );
            exit_codes::OK
        }
        Err(err) => {
            eprintln!("invalid: {err:#}");
            startup_exit_code(&err)
        }
    }
}

fn cmd_select(root: &Path) -> Result<i32> {
    let (spec, run_state, max_attempts) = match load_for_selection(root) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("invalid: {err:#}");
            return Ok(startup_exit_code(&err));
        }
    };
    match select_item(&spec, &run_state, max_attempts) {
        SelectOutcome::Done => {
            eprintln!("all items pass");
            Ok(exit_codes::COMPLETE)
        }
        SelectOutcome::Open(selected) => {
            println!("{}", selected.id);
            Ok(exit_codes::OK)
        }
        SelectOutcome::Exhausted(selected) => {
            println!("{}", selected.id);
            eprintln!(
                "item '{}' exhausted its attempts ({}/{})",
                selected.id, selected.attempts, selected.max_attempts
            );
            Ok(exit_codes::HALTED)
        }
    }
}

fn cmd_status(root: &Path) -> Result<i32> {
    let (spec, run_state, max_attempts) = match load_for_selection(root) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("invalid: {err:#}");
            return Ok(startup_exit_code(&err));
        }
    };
    for row in item_statuses(&spec, &run_state) {
        let mark = if row.passed { "x" } else { " " };
        println!(
            "[{mark}] {} (priority {}, attempts {}/{max_attempts}) {}",
            row.id, row.priority, row.attempts, row.title
        );
        if let Some(note) = row.last_failure {
            println!("      last failure: {note}");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_learn(root: &Path, text: &str) -> Result<i32> {
    let paths = StoryloopPaths::new(root);
    let config = load_config(&paths.config_path)?;
    append_entry(&paths.resolve(&config.ledger_path), text)?;
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, options: &RunOptions) -> Result<i32> {
    let mut ctx = match prepare_run(root, options) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("cannot start: {err:#}");
            return Ok(startup_exit_code(&err));
        }
    };
    if let Some(recovered) = &ctx.recovered {
        println!(
            "recovered interrupted iteration {} ({}), rolled back to {}",
            recovered.iter,
            recovered.item_id,
            short_sha(&recovered.snapshot)
        );
    }

    let agent = CommandAgent::new(ctx.config.agent.command.clone());
    let outcome = run_loop(&mut ctx, &agent, &CommandStageRunner, print_iteration)?;

    let summary = format!(
        "{} iterations, {} committed",
        outcome.iterations, outcome.committed
    );
    match outcome.stop {
        LoopStop::Done => {
            println!("done: all items pass ({summary})");
            Ok(exit_codes::OK)
        }
        LoopStop::Halted(reason) => {
            println!("halted: {} ({summary})", describe_halt(&reason));
            Ok(match reason {
                HaltReason::IntegrityViolation { .. } => exit_codes::INTEGRITY,
                HaltReason::AttemptsExhausted { .. } | HaltReason::IterationLimit { .. } => {
                    exit_codes::HALTED
                }
            })
        }
    }
}

fn print_iteration(outcome: &IterationOutcome) {
    let result = match &outcome.action {
        Action::Committed { commit } => format!("commit {}", short_sha(commit)),
        Action::RolledBack { rejection } => {
            format!("rollback {}: {}", rejection.kind(), rejection.describe())
        }
    };
    println!(
        "iter {} {} (attempt {}): {result}",
        outcome.iter, outcome.item_id, outcome.attempt
    );
}

fn describe_halt(reason: &HaltReason) -> String {
    match reason {
        HaltReason::AttemptsExhausted {
            id,
            attempts,
            max_attempts,
        } => format!("item '{id}' failed {attempts}/{max_attempts} attempts"),
        HaltReason::IntegrityViolation { id, kind, detail } => {
            format!("{kind} while working on '{id}': {detail}")
        }
        HaltReason::IterationLimit { max_iterations } => {
            format!("iteration limit of {max_iterations} reached")
        }
    }
}

/// Integrity problems found before the first iteration get their own code.
fn startup_exit_code(err: &anyhow::Error) -> i32 {
    match as_loop_error(err) {
        Some(LoopError::SpecIntegrity { .. }) => exit_codes::INTEGRITY,
        _ => exit_codes::INVALID,
    }
}

fn short_sha(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}
