//! Agent invocation: one fresh process per iteration, payload on stdin.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::types::AgentResult;
use crate::error::LoopError;
use crate::io::harness::VcsHarness;
use crate::io::iteration_log::write_text;
use crate::io::process::{command_from_argv, run_command};

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub workdir: PathBuf,
    pub payload: String,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// What the agent process reported, before the controller classifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
}

pub trait Agent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput>;
}

/// Runs the configured agent argv in the workdir.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all)]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput> {
        let cmd = command_from_argv(&self.command, &request.workdir)?;
        let output = run_command(
            cmd,
            Some(request.payload.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            Some(&request.log_path),
        )
        .with_context(|| format!("run agent {}", self.command.join(" ")))?;
        write_text(&request.log_path, &output.render_log("agent"))?;
        Ok(AgentOutput {
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            stdout: output.stdout_lossy(),
        })
    }
}

/// Run the agent and classify its exit.
///
/// Timeouts and non-zero exits are typed errors. A clean exit yields the
/// changed paths and whether the completion marker was printed.
#[instrument(skip_all)]
pub fn invoke_agent(
    agent: &dyn Agent,
    harness: &VcsHarness,
    request: &AgentRequest,
    done_marker: &str,
) -> Result<AgentResult> {
    let output = agent.invoke(request)?;
    if output.timed_out {
        warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
        return Err(LoopError::AgentTimeout {
            timeout_secs: request.timeout.as_secs(),
        }
        .into());
    }
    if output.exit_code != Some(0) {
        return Err(LoopError::AgentProcess {
            exit_code: output.exit_code,
            detail: format!("see {}", request.log_path.display()),
        }
        .into());
    }

    let files_changed = harness.changed_paths()?;
    let reported_done = reports_done(&output.stdout, done_marker);
    info!(files_changed = files_changed.len(), reported_done, "agent finished");
    Ok(AgentResult {
        files_changed,
        exit_code: output.exit_code,
        reported_done,
    })
}

/// True if a stdout line is exactly the marker. An empty marker disables the check.
pub fn reports_done(stdout: &str, marker: &str) -> bool {
    if marker.is_empty() {
        return true;
    }
    stdout.lines().any(|line| line.trim() == marker)
}

/// Paths outside every allowed prefix. `always_allowed` paths are exempt.
pub fn paths_outside_scope(
    changed: &[String],
    allowed_prefixes: &[String],
    always_allowed: &[&Path],
) -> Vec<String> {
    if allowed_prefixes.is_empty() {
        return Vec::new();
    }
    changed
        .iter()
        .filter(|path| {
            let path = Path::new(path.as_str());
            !always_allowed.contains(&path)
                && !allowed_prefixes
                    .iter()
                    .any(|prefix| path.starts_with(prefix.trim_end_matches('/')))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::as_loop_error;
    use crate::io::git::Git;
    use crate::test_support::TestRepo;

    fn request(repo: &TestRepo, timeout: Duration) -> AgentRequest {
        AgentRequest {
            workdir: repo.path().to_path_buf(),
            payload: "do the thing\n".to_string(),
            log_path: repo.path().join(".storyloop/iterations/1/agent.log"),
            timeout,
            output_limit_bytes: 10_000,
        }
    }

    fn sh(script: &str) -> CommandAgent {
        CommandAgent::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[test]
    fn command_agent_reads_payload_and_reports_changes() {
        let repo = TestRepo::new().expect("repo");
        repo.ignore_storyloop_dir().expect("ignore");
        let harness = VcsHarness::new(Git::new(repo.path()));
        let agent = sh("cat > payload.txt; echo working; echo DONE");
        let req = request(&repo, Duration::from_secs(10));

        let result = invoke_agent(&agent, &harness, &req, "DONE").expect("invoke");
        assert_eq!(result.files_changed, vec!["payload.txt"]);
        assert!(result.reported_done);
        assert_eq!(
            std::fs::read_to_string(repo.path().join("payload.txt")).expect("read"),
            "do the thing\n"
        );
        let log = std::fs::read_to_string(&req.log_path).expect("log");
        assert!(log.contains("working"));
        assert!(log.contains("exit_code: Some(0)"));
    }

    #[test]
    fn missing_marker_is_reported_not_an_error() {
        let repo = TestRepo::new().expect("repo");
        let harness = VcsHarness::new(Git::new(repo.path()));
        let result = invoke_agent(
            &sh("echo 'not DONE yet'"),
            &harness,
            &request(&repo, Duration::from_secs(10)),
            "DONE",
        )
        .expect("invoke");
        assert!(!result.reported_done);
    }

    #[test]
    fn timeout_and_failure_are_typed() {
        let repo = TestRepo::new().expect("repo");
        let harness = VcsHarness::new(Git::new(repo.path()));

        let err = invoke_agent(
            &sh("sleep 5"),
            &harness,
            &request(&repo, Duration::from_millis(200)),
            "DONE",
        )
        .unwrap_err();
        assert_eq!(
            as_loop_error(&err).map(LoopError::kind),
            Some("agent_timeout")
        );

        let err = invoke_agent(
            &sh("exit 7"),
            &harness,
            &request(&repo, Duration::from_secs(10)),
            "DONE",
        )
        .unwrap_err();
        match as_loop_error(&err) {
            Some(LoopError::AgentProcess { exit_code, .. }) => assert_eq!(*exit_code, Some(7)),
            other => panic!("expected AgentProcess, got {other:?}"),
        }
    }

    #[test]
    fn done_marker_matches_whole_lines() {
        assert!(reports_done("work\nDONE\n", "DONE"));
        assert!(reports_done("  DONE  ", "DONE"));
        assert!(!reports_done("NOT DONE", "DONE"));
        assert!(reports_done("", ""));
    }

    #[test]
    fn scope_check_respects_prefixes_and_exemptions() {
        let changed = vec![
            "src/lib.rs".to_string(),
            "prd.json".to_string(),
            "srcs/other.rs".to_string(),
            "README.md".to_string(),
        ];
        let outside = paths_outside_scope(
            &changed,
            &["src/".to_string()],
            &[Path::new("prd.json"), Path::new("learnings.md")],
        );
        assert_eq!(outside, vec!["srcs/other.rs", "README.md"]);
        assert!(paths_outside_scope(&changed, &[], &[]).is_empty());
    }
}
