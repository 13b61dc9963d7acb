//! Spec load/persist helpers with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::debug;

use crate::core::immutability::{Baseline, check_integrity};
use crate::core::invariants::validate_invariants;
use crate::error::LoopError;
use crate::io::fs_atomic::write_atomic;
use crate::spec::Spec;

const SPEC_SCHEMA: &str = include_str!("../../schemas/spec/v1.schema.json");

/// Load and validate a spec from disk (JSON + schema + invariants).
///
/// Malformed content is reported as [`LoopError::SpecFormat`]; a missing or
/// unreadable file is a plain I/O error.
pub fn load_spec(path: &Path) -> Result<Spec> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read spec {}", path.display()))?;
    let spec = parse_spec(&contents).with_context(|| format!("load spec {}", path.display()))?;
    debug!(path = %path.display(), items = spec.items.len(), "spec loaded");
    Ok(spec)
}

/// [`load_spec`] plus a comparison against the recorded baseline, if any.
pub fn load_spec_checked(path: &Path, baseline: Option<&Baseline>) -> Result<Spec> {
    let spec = load_spec(path)?;
    if let Some(baseline) = baseline {
        let errors = check_integrity(baseline, &spec);
        if !errors.is_empty() {
            return Err(LoopError::SpecIntegrity { errors })
                .with_context(|| format!("check spec {}", path.display()));
        }
    }
    Ok(spec)
}

/// Parse and validate spec JSON text.
pub fn parse_spec(contents: &str) -> Result<Spec> {
    let value: Value = serde_json::from_str(contents).map_err(|err| LoopError::SpecFormat {
        errors: vec![format!("invalid JSON: {err}")],
    })?;
    validate_schema(&value)?;
    let spec: Spec = serde_json::from_value(value).map_err(|err| LoopError::SpecFormat {
        errors: vec![err.to_string()],
    })?;
    let errors = validate_invariants(&spec);
    if !errors.is_empty() {
        return Err(LoopError::SpecFormat { errors }.into());
    }
    Ok(spec)
}

/// Write the spec in canonical form (pretty JSON, declaration order kept).
pub fn persist_spec(path: &Path, spec: &Spec) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(spec).context("serialize spec")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())?;
    debug!(path = %path.display(), "spec persisted");
    Ok(())
}

fn validate_schema(spec: &Value) -> Result<()> {
    let schema_value: Value =
        serde_json::from_str(SPEC_SCHEMA).context("parse embedded spec schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid spec schema: {err}"))?;
    if !compiled.is_valid(spec) {
        let errors = compiled
            .iter_errors(spec)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(LoopError::SpecFormat { errors }.into());
    }
    Ok(())
}
