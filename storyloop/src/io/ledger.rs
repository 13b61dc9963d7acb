//! Append-only learnings ledger on disk.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::append_only::{appended_suffix, format_entry};
use crate::error::LoopError;
use crate::io::fs_atomic::write_atomic;

/// Read the ledger; a missing file reads as empty.
pub fn read_ledger(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err).with_context(|| format!("read ledger {}", path.display())),
    }
}

/// Replace the ledger with `proposed`, which must extend the current content.
pub fn append(path: &Path, proposed: &str) -> Result<()> {
    let current = read_ledger(path)?;
    check_append(path, &current, proposed)?;
    if proposed.len() == current.len() {
        return Ok(());
    }
    write_atomic(path, proposed.as_bytes())?;
    debug!(
        path = %path.display(),
        appended_bytes = proposed.len() - current.len(),
        "ledger appended"
    );
    Ok(())
}

/// Append one formatted entry to the ledger.
pub fn append_entry(path: &Path, text: &str) -> Result<()> {
    let entry = format_entry(text);
    if entry.is_empty() {
        return Ok(());
    }
    let mut proposed = read_ledger(path)?;
    if !proposed.is_empty() && !proposed.ends_with('\n') {
        proposed.push('\n');
    }
    proposed.push_str(&entry);
    append(path, &proposed)
}

/// Compare a snapshot taken before the agent ran with the content after.
pub fn check_append(path: &Path, before: &str, after: &str) -> Result<(), LoopError> {
    appended_suffix(before, after)
        .map(|_| ())
        .map_err(|detail| LoopError::LedgerIntegrity {
            path: path.to_path_buf(),
            detail,
        })
}
