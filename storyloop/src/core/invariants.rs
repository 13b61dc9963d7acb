//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use anyhow::{Result, anyhow};

use crate::spec::Spec;

/// Check semantic invariants not expressible in JSON Schema:
/// - Ids are unique and safe (`[A-Za-z0-9._-]`)
/// - Priorities are non-negative
/// - Items are declared in non-decreasing priority order
pub fn validate_invariants(spec: &Spec) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (index, item) in spec.items.iter().enumerate() {
        if let Err(err) = validate_id(&item.id) {
            errors.push(format!("items[{index}]: {err}"));
        }
        if !seen.insert(item.id.as_str()) {
            errors.push(format!("items[{index}]: duplicate id '{}'", item.id));
        }
        if item.priority < 0 {
            errors.push(format!(
                "items[{index}] '{}': priority must be >= 0 (got {})",
                item.id, item.priority
            ));
        }
    }

    for (index, pair) in spec.items.windows(2).enumerate() {
        if pair[1].priority < pair[0].priority {
            errors.push(format!(
                "items[{}] '{}': priority {} declared after priority {} (items must be in non-decreasing priority order)",
                index + 1,
                pair[1].id,
                pair[1].priority,
                pair[0].priority
            ));
        }
    }

    if spec.branch_name.trim().is_empty() {
        errors.push("branchName must not be empty".to_string());
    }

    errors
}

/// Validate that an id is safe for commit messages and log paths.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{item, spec_with};

    #[test]
    fn valid_spec_has_no_errors() {
        let spec = spec_with(vec![item("a", 1), item("b", 1), item("c", 2)]);
        assert!(validate_invariants(&spec).is_empty());
    }

    #[test]
    fn reports_duplicates_and_priority_order() {
        let spec = spec_with(vec![item("dup", 2), item("dup", 1), item("bad id", 3)]);
        let errors = validate_invariants(&spec);
        assert!(errors.iter().any(|err| err.contains("duplicate id 'dup'")));
        assert!(errors.iter().any(|err| err.contains("non-decreasing")));
        assert!(errors.iter().any(|err| err.contains("[A-Za-z0-9._-]")));
    }

    #[test]
    fn rejects_negative_priority() {
        let spec = spec_with(vec![item("a", -1)]);
        let errors = validate_invariants(&spec);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("priority must be >= 0"));
    }
}
