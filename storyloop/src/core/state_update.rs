//! Controller-owned write-back of an iteration outcome.

use crate::core::immutability::check_permitted_mutation;
use crate::error::LoopError;
use crate::spec::Spec;

/// Produce a new spec snapshot with only `item_id`'s `passed`/`notes` changed.
///
/// The new snapshot is validated against `spec` before it is returned, so a
/// caller can persist the result without re-checking it.
pub fn apply_outcome(
    spec: &Spec,
    item_id: &str,
    passed: bool,
    notes: &str,
) -> Result<Spec, LoopError> {
    let mut next = spec.clone();
    let item = next
        .items
        .iter_mut()
        .find(|item| item.id == item_id)
        .ok_or_else(|| LoopError::SpecMutation {
            errors: vec![format!("unknown item '{item_id}'")],
        })?;
    item.passed = passed;
    item.notes = notes.to_string();

    let errors = check_permitted_mutation(spec, &next, item_id);
    if !errors.is_empty() {
        return Err(LoopError::SpecMutation { errors });
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{item, spec_with};

    #[test]
    fn marks_only_the_named_item() {
        let spec = spec_with(vec![item("a", 1), item("b", 2)]);
        let next = apply_outcome(&spec, "a", true, "implemented").expect("apply");
        assert!(next.items[0].passed);
        assert_eq!(next.items[0].notes, "implemented");
        assert_eq!(next.items[1], spec.items[1]);
        // The input snapshot is untouched.
        assert!(!spec.items[0].passed);
    }

    #[test]
    fn unknown_item_is_a_mutation_error() {
        let spec = spec_with(vec![item("a", 1)]);
        let err = apply_outcome(&spec, "ghost", true, "").unwrap_err();
        assert_eq!(
            err,
            LoopError::SpecMutation {
                errors: vec!["unknown item 'ghost'".to_string()]
            }
        );
    }
}
