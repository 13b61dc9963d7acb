//! Verification gate: ordered stages, stop at the first failure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::types::{StageOutcome, StageResult, VerificationResult};
use crate::io::config::VerifyConfig;
use crate::io::iteration_log::{IterationPaths, write_text};
use crate::io::process::{command_from_argv, run_command};

#[derive(Debug, Clone)]
pub struct StageRequest {
    pub workdir: PathBuf,
    pub name: String,
    pub command: Vec<String>,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// How a single stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRun {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl StageRun {
    pub fn outcome(&self) -> StageOutcome {
        if self.timed_out {
            StageOutcome::TimedOut
        } else if self.exit_code == Some(0) {
            StageOutcome::Pass
        } else {
            StageOutcome::Fail
        }
    }
}

pub trait StageRunner {
    fn run(&self, request: &StageRequest) -> Result<StageRun>;
}

/// Runs stage commands as subprocesses and logs their output.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandStageRunner;

impl StageRunner for CommandStageRunner {
    #[instrument(skip_all, fields(stage = %request.name))]
    fn run(&self, request: &StageRequest) -> Result<StageRun> {
        let cmd = command_from_argv(&request.command, &request.workdir)?;
        let output = run_command(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
            None,
        )
        .with_context(|| format!("run verify stage '{}'", request.name))?;
        let mut log = format!("$ {}\n", request.command.join(" "));
        log.push_str(&output.render_log(&request.name));
        write_text(&request.log_path, &log)?;
        Ok(StageRun {
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            duration: output.duration,
        })
    }
}

/// Run every enabled stage in order, stopping at the first one that fails.
///
/// Stages after a failure are reported as [`StageOutcome::NotRun`].
#[instrument(skip_all)]
pub fn verify(
    runner: &dyn StageRunner,
    config: &VerifyConfig,
    workdir: &Path,
    paths: &IterationPaths,
) -> Result<VerificationResult> {
    let stages = config.enabled_stages();
    let mut results = Vec::with_capacity(stages.len());
    let mut failed = false;

    for (index, stage) in stages.iter().enumerate() {
        if failed {
            results.push(StageResult {
                name: stage.name.clone(),
                outcome: StageOutcome::NotRun,
                exit_code: None,
                duration_ms: 0,
            });
            continue;
        }
        let request = StageRequest {
            workdir: workdir.to_path_buf(),
            name: stage.name.clone(),
            command: stage.command.clone(),
            log_path: paths.stage_log_path(index + 1, &stage.name),
            timeout: Duration::from_secs(config.stage_timeout_secs(stage)),
            output_limit_bytes: config.output_limit_bytes,
        };
        let run = runner.run(&request)?;
        let outcome = run.outcome();
        if outcome.passed() {
            info!(stage = %stage.name, "stage passed");
        } else {
            warn!(stage = %stage.name, ?outcome, exit_code = ?run.exit_code, "stage failed");
            failed = true;
        }
        results.push(StageResult {
            name: stage.name.clone(),
            outcome,
            exit_code: run.exit_code,
            duration_ms: run.duration.as_millis() as u64,
        });
    }

    Ok(VerificationResult {
        passed: !failed,
        stages: results,
    })
}
