//! Field-level immutability checks for the spec.
//!
//! Two checks share the same notion of "immutable part" of a spec:
//! - [`check_permitted_mutation`] compares two in-run snapshots and allows only
//!   the selected item's `passed`/`notes` to differ.
//! - [`check_integrity`] compares a freshly loaded spec against the fingerprints
//!   recorded from the last known-good spec ([`Baseline`]).

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::spec::{Spec, WorkItem};

/// Validate that `next` differs from `prev` at most in the selected item's
/// `passed` and `notes` fields.
///
/// Returns a list of stable error messages (empty on success).
pub fn check_permitted_mutation(prev: &Spec, next: &Spec, selected_id: &str) -> Vec<String> {
    let mut errors = Vec::new();

    if prev.project != next.project {
        errors.push("project changed".to_string());
    }
    if prev.branch_name != next.branch_name {
        errors.push("branchName changed".to_string());
    }
    if prev.description != next.description {
        errors.push("description changed".to_string());
    }
    if prev.constraints != next.constraints {
        errors.push("constraints changed".to_string());
    }

    let prev_ids: Vec<&str> = prev.items.iter().map(|i| i.id.as_str()).collect();
    let next_ids: Vec<&str> = next.items.iter().map(|i| i.id.as_str()).collect();
    if prev_ids != next_ids {
        errors.push(format!(
            "item list changed (before: [{}], after: [{}])",
            prev_ids.join(", "),
            next_ids.join(", ")
        ));
        return errors;
    }

    for (before, after) in prev.items.iter().zip(&next.items) {
        if before.id == selected_id {
            for field in changed_immutable_fields(before, after) {
                errors.push(format!("item '{}': immutable field '{field}' changed", before.id));
            }
        } else if before != after {
            errors.push(format!(
                "item '{}' changed but only '{selected_id}' may change this iteration",
                before.id
            ));
        }
    }

    errors
}

fn changed_immutable_fields(before: &WorkItem, after: &WorkItem) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if before.title != after.title {
        fields.push("title");
    }
    if before.description != after.description {
        fields.push("description");
    }
    if before.acceptance_criteria != after.acceptance_criteria {
        fields.push("acceptanceCriteria");
    }
    if before.priority != after.priority {
        fields.push("priority");
    }
    fields
}

/// Fingerprints of the immutable parts of a known-good spec.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Baseline {
    /// Fingerprint of project, branch, description and constraints.
    pub header: String,
    /// Fingerprint per item id.
    pub items: BTreeMap<String, String>,
}

impl Baseline {
    pub fn from_spec(spec: &Spec) -> Self {
        Self {
            header: header_fingerprint(spec),
            items: spec
                .items
                .iter()
                .map(|item| (item.id.clone(), item_fingerprint(item)))
                .collect(),
        }
    }
}

/// Compare `spec` against a previously recorded baseline.
///
/// Items added since the baseline are accepted; changed or removed ones are not.
pub fn check_integrity(baseline: &Baseline, spec: &Spec) -> Vec<String> {
    let mut errors = Vec::new();
    if baseline.header != header_fingerprint(spec) {
        errors.push("spec header (project/branchName/description/constraints) changed".to_string());
    }

    let current: HashMap<&str, &WorkItem> =
        spec.items.iter().map(|item| (item.id.as_str(), item)).collect();
    for (id, fingerprint) in &baseline.items {
        match current.get(id.as_str()) {
            None => errors.push(format!("item '{id}' was removed")),
            Some(item) if &item_fingerprint(item) != fingerprint => {
                errors.push(format!("item '{id}' immutable fields changed"));
            }
            Some(_) => {}
        }
    }
    errors
}

fn item_fingerprint(item: &WorkItem) -> String {
    // Serialization of a struct is field-ordered, so this is stable.
    let view = item.immutable_view();
    digest(&serde_json::to_vec(&view).unwrap_or_default())
}

fn header_fingerprint(spec: &Spec) -> String {
    let header = Spec {
        items: Vec::new(),
        ..spec.clone()
    };
    digest(&serde_json::to_vec(&header).unwrap_or_default())
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{item, spec_with};

    #[test]
    fn allows_selected_item_execution_fields() {
        let prev = spec_with(vec![item("a", 0), item("b", 1)]);
        let mut next = prev.clone();
        next.items[0].passed = true;
        next.items[0].notes = "done".to_string();
        assert!(check_permitted_mutation(&prev, &next, "a").is_empty());
    }

    #[test]
    fn rejects_immutable_field_on_selected_item() {
        let prev = spec_with(vec![item("a", 0)]);
        let mut next = prev.clone();
        next.items[0].acceptance_criteria.push("sneaky".to_string());
        let errors = check_permitted_mutation(&prev, &next, "a");
        assert_eq!(
            errors,
            vec!["item 'a': immutable field 'acceptanceCriteria' changed".to_string()]
        );
    }

    #[test]
    fn rejects_touching_another_item() {
        let prev = spec_with(vec![item("a", 0), item("b", 1)]);
        let mut next = prev.clone();
        next.items[1].notes = "not yours".to_string();
        let errors = check_permitted_mutation(&prev, &next, "a");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("item 'b' changed"));
    }

    #[test]
    fn rejects_reordering_and_removal() {
        let prev = spec_with(vec![item("a", 0), item("b", 0)]);
        let mut reordered = prev.clone();
        reordered.items.swap(0, 1);
        assert!(
            check_permitted_mutation(&prev, &reordered, "a")[0].contains("item list changed")
        );

        let mut removed = prev.clone();
        removed.items.pop();
        assert!(!check_permitted_mutation(&prev, &removed, "a").is_empty());
    }

    #[test]
    fn integrity_ignores_execution_fields_and_new_items() {
        let spec = spec_with(vec![item("a", 0)]);
        let baseline = Baseline::from_spec(&spec);

        let mut later = spec.clone();
        later.items[0].passed = true;
        later.items[0].notes = "ok".to_string();
        later.items.push(item("b", 1));
        assert!(check_integrity(&baseline, &later).is_empty());
    }

    #[test]
    fn integrity_reports_changed_and_removed_items() {
        let spec = spec_with(vec![item("a", 0), item("b", 1)]);
        let baseline = Baseline::from_spec(&spec);

        let mut later = spec.clone();
        later.items[0].title = "retitled".to_string();
        later.items.pop();
        let errors = check_integrity(&baseline, &later);
        assert!(errors.contains(&"item 'a' immutable fields changed".to_string()));
        assert!(errors.contains(&"item 'b' was removed".to_string()));
    }

    #[test]
    fn integrity_reports_header_change() {
        let spec = spec_with(vec![item("a", 0)]);
        let baseline = Baseline::from_spec(&spec);
        let mut later = spec.clone();
        later.branch_name = "elsewhere".to_string();
        assert_eq!(check_integrity(&baseline, &later).len(), 1);
    }
}
