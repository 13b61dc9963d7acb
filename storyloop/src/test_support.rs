//! Test helpers: spec builders, a throwaway git repository, and scripted
//! stand-ins for the agent and the verification stages.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::io::agent::{Agent, AgentOutput, AgentRequest};
use crate::io::spec_store::persist_spec;
use crate::io::verify::{StageRequest, StageRun, StageRunner};
use crate::spec::{Spec, WorkItem};

/// Create a deterministic, not-yet-passed work item.
pub fn item(id: &str, priority: i64) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        acceptance_criteria: vec![format!("{id} works")],
        priority,
        passed: false,
        notes: String::new(),
    }
}

/// Create a work item already marked as passed.
pub fn passed_item(id: &str, priority: i64) -> WorkItem {
    WorkItem {
        passed: true,
        ..item(id, priority)
    }
}

/// Wrap items in a spec with fixed project metadata.
pub fn spec_with(items: Vec<WorkItem>) -> Spec {
    Spec {
        project: "demo".to_string(),
        branch_name: "storyloop/demo".to_string(),
        description: None,
        constraints: Vec::new(),
        items,
    }
}

/// A real git repository in a temp dir, with one initial commit on `main`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo dir")?;
        let repo = Self { dir };
        repo.git(&["init", "--quiet"])?;
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        repo.git(&["config", "user.email", "storyloop@example.com"])?;
        repo.git(&["config", "user.name", "storyloop tests"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.commit_file("README.md", "# demo\n", "initial commit")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in the repo and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn write_file(&self, relative: &str, contents: &str) -> Result<()> {
        let path = self.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read_file(&self, relative: &str) -> Result<String> {
        let path = self.path().join(relative);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn commit_file(&self, relative: &str, contents: &str, message: &str) -> Result<()> {
        self.write_file(relative, contents)?;
        self.git(&["add", "--", relative])?;
        self.git(&["commit", "--quiet", "-m", message])?;
        Ok(())
    }

    /// Write and commit the spec (and an empty ledger if absent).
    pub fn commit_spec(&self, spec: &Spec) -> Result<()> {
        persist_spec(&self.path().join("prd.json"), spec)?;
        if !self.path().join("learnings.md").exists() {
            self.write_file("learnings.md", "")?;
        }
        self.git(&["add", "--", "prd.json", "learnings.md"])?;
        self.git(&["commit", "--quiet", "-m", "add spec"])?;
        Ok(())
    }

    /// Make `.storyloop/` ignore itself, as `storyloop init` would.
    pub fn ignore_storyloop_dir(&self) -> Result<()> {
        self.write_file(".storyloop/.gitignore", "*\n")
    }

    pub fn head(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"])
    }

    pub fn last_commit_message(&self) -> Result<String> {
        self.git(&["log", "-1", "--format=%s"])
    }

    pub fn commit_count(&self) -> Result<usize> {
        let count = self.git(&["rev-list", "--count", "HEAD"])?;
        count.parse().context("parse commit count")
    }

    pub fn status(&self) -> Result<String> {
        self.git(&["status", "--porcelain", "-uall"])
    }
}

type AgentStep = Box<dyn FnOnce(&AgentRequest) -> Result<AgentOutput>>;

/// Agent double that plays back one scripted step per invocation.
///
/// Each step gets the request (workdir, payload) and may touch the working
/// tree before returning what the "process" printed.
#[derive(Default)]
pub struct ScriptedAgent {
    steps: RefCell<VecDeque<AgentStep>>,
    payloads: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a step that edits the workdir and then prints `DONE`.
    pub fn step(self, edit: impl FnOnce(&Path) -> Result<()> + 'static) -> Self {
        self.step_with_output(move |workdir| {
            edit(workdir)?;
            Ok(done())
        })
    }

    /// Queue a step with full control over the reported output.
    pub fn step_with_output(
        self,
        run: impl FnOnce(&Path) -> Result<AgentOutput> + 'static,
    ) -> Self {
        self.steps
            .borrow_mut()
            .push_back(Box::new(move |request: &AgentRequest| run(&request.workdir)));
        self
    }

    /// Payloads received so far, in order.
    pub fn payloads(&self) -> Vec<String> {
        self.payloads.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.steps.borrow().len()
    }
}

impl Agent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput> {
        self.payloads.borrow_mut().push(request.payload.clone());
        let step = self
            .steps
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no steps left"))?;
        step(request)
    }
}

/// Output of a successful agent run that printed the default marker.
pub fn done() -> AgentOutput {
    AgentOutput {
        exit_code: Some(0),
        timed_out: false,
        stdout: "DONE\n".to_string(),
    }
}

/// Stage double: every stage passes unless told otherwise.
#[derive(Default)]
pub struct ScriptedStages {
    /// Remaining failures per stage; `None` means fail forever.
    failures: RefCell<HashMap<String, Option<u32>>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedStages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `stage` fail on every run.
    pub fn fail(self, stage: &str) -> Self {
        self.failures.borrow_mut().insert(stage.to_string(), None);
        self
    }

    /// Make `stage` fail for its next `times` runs, then pass.
    pub fn fail_times(self, stage: &str, times: u32) -> Self {
        self.failures
            .borrow_mut()
            .insert(stage.to_string(), Some(times));
        self
    }

    /// Stage names run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl StageRunner for ScriptedStages {
    fn run(&self, request: &StageRequest) -> Result<StageRun> {
        self.calls.borrow_mut().push(request.name.clone());
        let mut failures = self.failures.borrow_mut();
        let fails = match failures.get_mut(&request.name) {
            Some(None) => true,
            Some(Some(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        Ok(StageRun {
            exit_code: Some(if fails { 1 } else { 0 }),
            timed_out: false,
            duration: Duration::from_millis(1),
        })
    }
}
