//! Controller configuration stored under `.storyloop/config.toml`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Controller configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below; CLI flags on `storyloop run` override them per invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoryloopConfig {
    /// Spec file, relative to the workdir.
    pub spec_path: PathBuf,

    /// Learnings ledger, relative to the workdir.
    pub ledger_path: PathBuf,

    /// Failed attempts allowed per item before the run halts.
    pub max_attempts: u32,

    /// Iterations allowed per `storyloop run` invocation.
    pub max_iterations: u32,

    pub agent: AgentConfig,
    pub prompt: PromptConfig,
    pub verify: VerifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent argv; the prompt payload is written to its stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate captured agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Token the agent prints when it considers the item finished. Empty disables the check.
    pub done_marker: String,
    /// Path prefixes the agent may write to. Empty allows everything.
    pub allowed_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    /// Upper bound on the rendered payload.
    pub budget_bytes: usize,
    /// Ledger tail included before budgeting.
    pub ledger_tail_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Default per-stage timeout.
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageConfig {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn enabled_default() -> bool {
    true
}

impl Default for StoryloopConfig {
    fn default() -> Self {
        Self {
            spec_path: PathBuf::from("prd.json"),
            ledger_path: PathBuf::from("learnings.md"),
            max_attempts: 5,
            max_iterations: 50,
            agent: AgentConfig::default(),
            prompt: PromptConfig::default(),
            verify: VerifyConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            done_marker: "DONE".to_string(),
            allowed_paths: Vec::new(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 40_000,
            ledger_tail_bytes: 8_000,
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            stages: vec![StageConfig {
                name: "ci".to_string(),
                command: vec!["just".to_string(), "ci".to_string()],
                enabled: true,
                timeout_secs: None,
            }],
        }
    }
}

impl VerifyConfig {
    /// Stages that will actually run, in declaration order.
    pub fn enabled_stages(&self) -> Vec<StageConfig> {
        self.stages.iter().filter(|s| s.enabled).cloned().collect()
    }

    pub fn stage_timeout_secs(&self, stage: &StageConfig) -> u64 {
        stage.timeout_secs.unwrap_or(self.timeout_secs)
    }
}

impl StoryloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.spec_path.as_os_str().is_empty() {
            return Err(anyhow!("spec_path must be non-empty"));
        }
        if self.ledger_path.as_os_str().is_empty() {
            return Err(anyhow!("ledger_path must be non-empty"));
        }
        if self.spec_path == self.ledger_path {
            return Err(anyhow!("spec_path and ledger_path must differ"));
        }
        for path in [&self.spec_path, &self.ledger_path] {
            if path.is_absolute() {
                return Err(anyhow!(
                    "{} must be relative to the workdir",
                    path.display()
                ));
            }
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.prompt.budget_bytes == 0 {
            return Err(anyhow!("prompt.budget_bytes must be > 0"));
        }
        if self.verify.timeout_secs == 0 {
            return Err(anyhow!("verify.timeout_secs must be > 0"));
        }
        if self.verify.output_limit_bytes == 0 {
            return Err(anyhow!("verify.output_limit_bytes must be > 0"));
        }
        if self.verify.enabled_stages().is_empty() {
            return Err(anyhow!("verify.stages must contain at least one enabled stage"));
        }
        let mut names = HashSet::new();
        for stage in &self.verify.stages {
            if stage.name.trim().is_empty() {
                return Err(anyhow!("verify stage name must be non-empty"));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(anyhow!("duplicate verify stage '{}'", stage.name));
            }
            if stage.command.is_empty() || stage.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "verify stage '{}' command must be a non-empty array",
                    stage.name
                ));
            }
            if stage.timeout_secs == Some(0) {
                return Err(anyhow!("verify stage '{}' timeout_secs must be > 0", stage.name));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `StoryloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<StoryloopConfig> {
    if !path.exists() {
        let cfg = StoryloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: StoryloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &StoryloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::fs_atomic::write_atomic(path, buf.as_bytes())
}
