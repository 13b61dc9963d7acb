//! Deterministic selection logic for the work-item list.

use crate::spec::{Spec, WorkItem};

/// Lowest-priority item with `passed=false`; ties go to the earlier declaration.
///
/// Returns `None` when every item passes or the list is empty.
pub fn select_next(spec: &Spec) -> Option<&WorkItem> {
    spec.ordered_items().into_iter().find(|item| !item.passed)
}

/// An item is exhausted when its attempts reached the limit without passing.
pub fn is_exhausted(item: &WorkItem, attempts: u32, max_attempts: u32) -> bool {
    !item.passed && attempts >= max_attempts
}
