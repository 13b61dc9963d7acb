//! Prompt payload builder for the agent.
//!
//! The payload is self-contained: the selected item, the spec's global
//! constraints and a tail of the learnings ledger. Nothing else from the run
//! leaks into it, so a retry sees the same payload as the first attempt.

use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::append_only::tail;
use crate::spec::WorkItem;

const WORK_ITEM_TEMPLATE: &str = include_str!("prompts/work_item.md");

/// Learnings shorter than this are dropped rather than truncated.
const MIN_LEARNINGS_BYTES: usize = 64;
const SECTION_SEPARATOR: &str = "\n\n";

/// Selected item as seen by the template.
#[derive(Debug, Clone, Serialize)]
struct ItemContext {
    id: String,
    title: String,
    description: String,
    acceptance_criteria: Vec<String>,
    priority: i64,
}

impl ItemContext {
    fn from_item(item: &WorkItem) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            description: item.description.trim().to_string(),
            acceptance_criteria: item.acceptance_criteria.clone(),
            priority: item.priority,
        }
    }
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("work_item", WORK_ITEM_TEMPLATE)
            .context("load work_item template")?;
        Ok(Self { env })
    }

    fn render(&self, input: &PromptInputs, learnings: &str) -> Result<String> {
        let template = self.env.get_template("work_item")?;
        let rendered = template.render(context! {
            project => input.project,
            spec_path => input.spec_path,
            ledger_path => input.ledger_path,
            item => ItemContext::from_item(&input.item),
            constraints => input.constraints,
            learnings => (!learnings.trim().is_empty()).then(|| learnings.trim_end()),
            done_marker => (!input.done_marker.is_empty()).then_some(input.done_marker.as_str()),
            allowed_paths => input.allowed_paths,
        })?;
        Ok(rendered)
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    /// Section identifier (e.g., "contract", "learnings").
    key: String,
    /// Whether this section is required (cannot be dropped).
    required: bool,
    /// Section content including header, excluding the marker.
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section marker regex is valid")
    });

    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                whole.start(),
                whole.end(),
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "required",
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, start, key, required)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map(|(next_start, ..)| *next_start)
            .unwrap_or(rendered.len());
        let content = rendered[*start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    let content: usize = sections.iter().map(|s| s.content.len()).sum();
    content + SECTION_SEPARATOR.len() * sections.len().saturating_sub(1)
}

/// Drop droppable sections in `drop_order` until the sections fit.
///
/// Required sections are never cut; if they alone exceed the budget the
/// payload cannot be built.
fn apply_budget_to_sections(
    sections: &mut Vec<ParsedSection>,
    budget: usize,
    drop_order: &[&str],
) -> Result<Vec<String>> {
    let mut dropped = Vec::new();
    for key in drop_order {
        if total_len(sections) <= budget {
            return Ok(dropped);
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
            dropped.push((*key).to_string());
        }
    }

    let total = total_len(sections);
    if total > budget {
        let keys: Vec<&str> = sections.iter().map(|s| s.key.as_str()).collect();
        bail!(
            "prompt budget of {budget} bytes is smaller than the required sections ({total} bytes: {})",
            keys.join(", ")
        );
    }
    Ok(dropped)
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR)
}

/// All inputs needed to build a payload.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub project: String,
    /// Spec file as the agent should refer to it (workdir-relative).
    pub spec_path: String,
    /// Ledger file as the agent should refer to it (workdir-relative).
    pub ledger_path: String,
    pub item: WorkItem,
    pub constraints: Vec<String>,
    /// Full ledger content; only a tail is used.
    pub ledger: String,
    pub done_marker: String,
    pub allowed_paths: Vec<String>,
}

/// Builds a payload within a byte budget, shrinking the learnings tail first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
    ledger_tail_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize, ledger_tail_bytes: usize) -> Self {
        Self {
            budget_bytes,
            ledger_tail_bytes,
        }
    }

    pub fn build(&self, input: &PromptInputs) -> Result<PromptPack> {
        let engine = PromptEngine::new()?;
        let mut learnings = tail(&input.ledger, self.ledger_tail_bytes);
        let mut sections = parse_sections(&engine.render(input, learnings)?);

        let over = total_len(&sections).saturating_sub(self.budget_bytes);
        if over > 0 && !learnings.is_empty() {
            let allowed = learnings.len().saturating_sub(over);
            learnings = if allowed >= MIN_LEARNINGS_BYTES {
                tail(learnings, allowed)
            } else {
                ""
            };
            debug!(learnings_bytes = learnings.len(), "shrunk learnings for budget");
            sections = parse_sections(&engine.render(input, learnings)?);
        }

        let mut dropped = apply_budget_to_sections(&mut sections, self.budget_bytes, &["learnings"])?;
        if learnings.is_empty() && !input.ledger.trim().is_empty() {
            dropped.insert(0, "learnings".to_string());
            dropped.dedup();
        }

        Ok(PromptPack {
            content: render_sections(&sections),
            dropped_sections: dropped,
        })
    }
}

/// A rendered payload ready to send to the agent.
#[derive(Debug, Clone)]
pub struct PromptPack {
    content: String,
    dropped_sections: Vec<String>,
}

impl PromptPack {
    pub fn as_str(&self) -> &str {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Sections removed to fit the budget, in drop order.
    pub fn dropped_sections(&self) -> &[String] {
        &self.dropped_sections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::item;

    fn inputs() -> PromptInputs {
        let mut work = item("US-001", 1);
        work.acceptance_criteria = vec!["returns 42".to_string(), "has a test".to_string()];
        PromptInputs {
            project: "demo".to_string(),
            spec_path: "prd.json".to_string(),
            ledger_path: "learnings.md".to_string(),
            item: work,
            constraints: vec!["no new dependencies".to_string()],
            ledger: "- tests live in tests/\n".to_string(),
            done_marker: "DONE".to_string(),
            allowed_paths: Vec::new(),
        }
    }

    #[test]
    fn sections_appear_in_stable_order() {
        let pack = PromptBuilder::new(10_000, 8_000).build(&inputs()).expect("build");
        let content = pack.as_str();

        let contract = content.find("### Contract").expect("contract");
        let work = content.find("### Work Item").expect("item");
        let constraints = content.find("### Constraints").expect("constraints");
        let learnings = content.find("### Learnings").expect("learnings");
        assert!(contract < work && work < constraints && constraints < learnings);

        assert!(content.contains("id: US-001"));
        assert!(content.contains("- returns 42\n- has a test"));
        assert!(content.contains("- no new dependencies"));
        assert!(content.contains("exactly: DONE"));
        assert!(!content.contains("<!--"), "markers are stripped");
        assert!(pack.dropped_sections().is_empty());
    }

    #[test]
    fn optional_sections_are_omitted_when_empty() {
        let mut input = inputs();
        input.constraints.clear();
        input.ledger.clear();
        input.done_marker.clear();
        let pack = PromptBuilder::new(10_000, 8_000).build(&input).expect("build");
        let content = pack.as_str();
        assert!(!content.contains("### Constraints"));
        assert!(!content.contains("### Learnings"));
        assert!(!content.contains("DONE"));
    }

    #[test]
    fn learnings_shrink_to_newest_entries_first() {
        let mut input = inputs();
        input.ledger = (0..200).map(|i| format!("- fact {i}\n")).collect();
        let full = PromptBuilder::new(100_000, 100_000).build(&input).expect("full");
        let budget = full.len() - 500;

        let pack = PromptBuilder::new(budget, 100_000).build(&input).expect("build");
        assert!(pack.len() <= budget);
        assert!(pack.as_str().contains("- fact 199"));
        assert!(!pack.as_str().contains("- fact 0\n"));
        assert!(pack.as_str().contains("### Constraints"));
    }

    #[test]
    fn tight_budget_drops_learnings_but_keeps_item() {
        let mut input = inputs();
        input.ledger = "- lesson\n".repeat(500);
        let base = {
            let mut bare = input.clone();
            bare.ledger.clear();
            PromptBuilder::new(100_000, 100_000).build(&bare).expect("bare").len()
        };

        let pack = PromptBuilder::new(base + 10, 100_000).build(&input).expect("build");
        assert!(pack.len() <= base + 10);
        assert!(pack.as_str().contains("### Work Item"));
        assert!(!pack.as_str().contains("### Learnings"));
        assert_eq!(pack.dropped_sections(), ["learnings"]);
    }

    #[test]
    fn ledger_tail_limit_applies_before_budget() {
        let mut input = inputs();
        input.ledger = "- old\n".repeat(100) + "- newest\n";
        let pack = PromptBuilder::new(100_000, 20).build(&input).expect("build");
        assert!(pack.as_str().contains("- newest"));
        assert!(!pack.as_str().contains("- old\n- old"));
    }

    #[test]
    fn required_sections_over_budget_are_an_error_not_a_cut() {
        let mut input = inputs();
        input.constraints = vec!["keep every line of this constraint".repeat(50)];
        let required = {
            let mut bare = input.clone();
            bare.ledger.clear();
            PromptBuilder::new(100_000, 100_000).build(&bare).expect("bare").len()
        };

        let err = PromptBuilder::new(required - 1, 100_000)
            .build(&input)
            .expect_err("over budget");
        let message = format!("{err:#}");
        assert!(message.contains("smaller than the required sections"), "{message}");
        assert!(message.contains("constraints"), "{message}");
    }
}
