//! Audit records under `.storyloop/iterations/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{Action, VerificationResult};

/// Serialized form of why an iteration was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionRecord {
    pub kind: String,
    pub detail: String,
    pub fatal: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub iter: u32,
    pub item_id: String,
    pub attempt: u32,
    pub snapshot: String,
    /// "commit" or "rollback".
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RejectionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    pub files_changed: Vec<String>,
    pub prompt_bytes: usize,
    pub dropped_sections: Vec<String>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

impl IterationMeta {
    /// Fill the action-dependent fields from the finalized action.
    pub fn record_action(&mut self, action: &Action) {
        self.action = action.label().to_string();
        match action {
            Action::Committed { commit } => {
                self.commit = Some(commit.clone());
                self.rejection = None;
            }
            Action::RolledBack { rejection } => {
                self.commit = None;
                self.rejection = Some(RejectionRecord {
                    kind: rejection.kind().to_string(),
                    detail: rejection.describe(),
                    fatal: rejection.is_fatal(),
                });
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
    pub agent_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, iter: u32) -> Self {
        let dir = iterations_dir.join(iter.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
            agent_log_path: dir.join("agent.log"),
            dir,
        }
    }

    /// Log for the `index`-th (1-based) verification stage.
    pub fn stage_log_path(&self, index: usize, stage: &str) -> PathBuf {
        let safe: String = stage
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("verify-{index}-{safe}.log"))
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create iteration dir {}", self.dir.display()))
    }
}

pub fn write_prompt(paths: &IterationPaths, prompt: &str) -> Result<()> {
    write_text(&paths.prompt_path, prompt)
}

pub fn write_meta(paths: &IterationPaths, meta: &IterationMeta) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(meta).context("serialize iteration meta")?;
    buf.push('\n');
    write_text(&paths.meta_path, &buf)
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
