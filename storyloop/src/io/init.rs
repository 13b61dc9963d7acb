//! Initialization helpers for `.storyloop/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{StoryloopConfig, write_config};
use super::run_state::{RunState, write_run_state};

/// All canonical paths within `.storyloop/` for a project root.
#[derive(Debug, Clone)]
pub struct StoryloopPaths {
    pub root: PathBuf,
    pub storyloop_dir: PathBuf,
    pub state_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub run_state_path: PathBuf,
}

impl StoryloopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let storyloop_dir = root.join(".storyloop");
        let state_dir = storyloop_dir.join("state");
        Self {
            root: root.clone(),
            iterations_dir: storyloop_dir.join("iterations"),
            gitignore_path: storyloop_dir.join(".gitignore"),
            config_path: storyloop_dir.join("config.toml"),
            run_state_path: state_dir.join("run_state.json"),
            state_dir,
            storyloop_dir,
        }
    }

    /// Resolve a workdir-relative path from the config.
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }
}

/// Options for `init_storyloop`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing controller-owned files.
    pub force: bool,
}

/// Create `.storyloop/` scaffolding in `root`.
///
/// Fails if `.storyloop/` already exists unless `options.force` is set.
/// The spec and ledger files are left alone; they belong to the project.
pub fn init_storyloop(root: &Path, options: &InitOptions) -> Result<StoryloopPaths> {
    let paths = StoryloopPaths::new(root);
    if paths.storyloop_dir.exists() && !paths.storyloop_dir.is_dir() {
        return Err(anyhow!(
            "storyloop init: .storyloop exists but is not a directory"
        ));
    }
    if paths.storyloop_dir.exists() && !options.force {
        return Err(anyhow!(
            "storyloop init: .storyloop already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.storyloop_dir)?;
    create_dir(&paths.state_dir)?;
    create_dir(&paths.iterations_dir)?;

    fs::write(&paths.gitignore_path, STORYLOOP_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &StoryloopConfig::default())?;
    write_run_state(&paths.run_state_path, &RunState::default())?;

    Ok(paths)
}

/// Ensure the controller directory exists and ignores itself.
///
/// `run` calls this so a project that never ran `init` still keeps its
/// bookkeeping out of commits and out of reach of `git clean`.
pub fn ensure_storyloop_dir(paths: &StoryloopPaths) -> Result<()> {
    create_dir(&paths.state_dir)?;
    create_dir(&paths.iterations_dir)?;
    if !paths.gitignore_path.exists() {
        fs::write(&paths.gitignore_path, STORYLOOP_GITIGNORE)
            .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    }
    Ok(())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const STORYLOOP_GITIGNORE: &str = "*\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;
    use crate::io::run_state::load_run_state;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_storyloop(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.state_dir.is_dir());
        assert!(paths.iterations_dir.is_dir());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            STORYLOOP_GITIGNORE
        );
        assert_eq!(
            load_config(&paths.config_path).expect("config"),
            StoryloopConfig::default()
        );
        assert_eq!(
            load_run_state(&paths.run_state_path).expect("state"),
            RunState::default()
        );
    }

    #[test]
    fn init_without_force_refuses_existing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_storyloop(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_storyloop(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_restores_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_storyloop(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "max_attempts = 9\n").expect("customize");

        init_storyloop(temp.path(), &InitOptions { force: true }).expect("re-init");
        assert_eq!(load_config(&paths.config_path).expect("config").max_attempts, 5);
    }

    #[test]
    fn ensure_dir_keeps_existing_gitignore() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = StoryloopPaths::new(temp.path());
        ensure_storyloop_dir(&paths).expect("ensure");
        assert!(paths.gitignore_path.is_file());
        ensure_storyloop_dir(&paths).expect("idempotent");
    }
}
