use serde::{Deserialize, Serialize};

/// Work-item list plus project metadata, as stored in the spec file.
///
/// Items keep their declaration order; selection order is derived from
/// `(priority, declaration index)` and never written back.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub project: String,
    pub branch_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    #[serde(alias = "userStories")]
    pub items: Vec<WorkItem>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: i64,
    #[serde(default, alias = "passes")]
    pub passed: bool,
    #[serde(default)]
    pub notes: String,
}

impl Spec {
    pub fn item(&self, id: &str) -> Option<&WorkItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Items in execution order: priority, then declaration order.
    pub fn ordered_items(&self) -> Vec<&WorkItem> {
        let mut items: Vec<(usize, &WorkItem)> = self.items.iter().enumerate().collect();
        items.sort_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then_with(|| ia.cmp(ib)));
        items.into_iter().map(|(_, item)| item).collect()
    }
}

impl WorkItem {
    /// Copy of the item with execution fields reset, i.e. only the immutable part.
    pub fn immutable_view(&self) -> WorkItem {
        WorkItem {
            passed: false,
            notes: String::new(),
            ..self.clone()
        }
    }
}
