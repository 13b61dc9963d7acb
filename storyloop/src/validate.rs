//! Validation for `storyloop validate`: layout, config, spec format and
//! integrity against the recorded baseline.

use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::core::immutability::check_integrity;
use crate::error::LoopError;
use crate::io::config::load_config;
use crate::io::init::StoryloopPaths;
use crate::io::ledger::read_ledger;
use crate::io::run_state::load_or_default;
use crate::io::spec_store::load_spec;

/// Whether the spec was compared against a baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineCheck {
    /// No run has recorded a baseline yet.
    NotRecorded,
    /// Immutable fields match the recorded baseline.
    Matches,
}

/// High-level validation outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub project: String,
    pub items: usize,
    pub passed: usize,
    pub baseline: BaselineCheck,
}

/// Validate the controller directory, config, run state, spec and ledger in `root`.
///
/// Integrity violations come back as [`LoopError::SpecIntegrity`]; format
/// problems as [`LoopError::SpecFormat`].
pub fn validate_storyloop(root: &Path) -> Result<ValidateOutcome> {
    let paths = StoryloopPaths::new(root);
    if paths.storyloop_dir.exists() {
        ensure_gitignore(&paths.gitignore_path)?;
    }

    let config = load_config(&paths.config_path).with_context(|| "load config.toml")?;
    let run_state =
        load_or_default(&paths.run_state_path).with_context(|| "load run_state.json")?;
    let spec = load_spec(&paths.resolve(&config.spec_path))?;
    read_ledger(&paths.resolve(&config.ledger_path))?;

    let baseline = match &run_state.baseline {
        None => BaselineCheck::NotRecorded,
        Some(baseline) => {
            let errors = check_integrity(baseline, &spec);
            if !errors.is_empty() {
                return Err(LoopError::SpecIntegrity { errors }.into());
            }
            BaselineCheck::Matches
        }
    };

    Ok(ValidateOutcome {
        project: spec.project.clone(),
        items: spec.items.len(),
        passed: spec.items.iter().filter(|item| item.passed).count(),
        baseline,
    })
}

fn ensure_gitignore(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(anyhow!("missing file {}", path.display()));
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    if !contents.lines().any(|line| line.trim() == "*") {
        return Err(anyhow!(
            "{} must contain '*' so controller files stay untracked",
            path.display()
        ));
    }
    Ok(())
}
