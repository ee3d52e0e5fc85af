//! Agent contracts: fixed role definitions and deterministic prompt packs.
//!
//! Each agent is a language-model invocation with a fixed role, goal, and
//! backstory. Prompts are rendered from embedded minijinja templates whose
//! sections carry `<!-- section:KEY required|droppable -->` markers; when a
//! pack exceeds the byte budget, droppable sections are removed in a fixed
//! order before anything is truncated.

pub mod runner;
pub mod tester;

use std::sync::LazyLock;

use minijinja::{context, Environment};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::requirements::Requirement;

const PRODUCT_TEMPLATE: &str = include_str!("prompts/product.md");
const AUDITOR_TEMPLATE: &str = include_str!("prompts/auditor.md");
const ARCHITECT_TEMPLATE: &str = include_str!("prompts/architect.md");
const DEVELOPER_TEMPLATE: &str = include_str!("prompts/developer.md");
const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");

/// Byte budget for one rendered prompt pack.
pub const PROMPT_BUDGET_BYTES: usize = 40_000;

/// Fixed identity of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSpec {
    pub role: &'static str,
    pub goal: &'static str,
    pub backstory: &'static str,
}

impl AgentSpec {
    /// The system prompt sent with every invocation of this agent.
    pub fn system_prompt(&self) -> String {
        format!("You are the {}. {} {}", self.role, self.goal, self.backstory)
    }
}

pub const PRODUCT_MANAGER: AgentSpec = AgentSpec {
    role: "Product Manager",
    goal: "Convert the issue into a clear user story with acceptance criteria.",
    backstory: "You are an expert agile PM. You clarify scope and define Done.",
};

pub const CONTEXT_AUDITOR: AgentSpec = AgentSpec {
    role: "Context Auditor",
    goal: "Verify that the bundled repository context contains everything later stages will reference.",
    backstory: "You trust only quoted evidence from the provided files, never assumptions.",
};

pub const ARCHITECT: AgentSpec = AgentSpec {
    role: "Software Architect",
    goal: "Create a minimal technical plan and identify the files to change.",
    backstory: "You favor small diffs, maintainability, and testability.",
};

pub const DEVELOPER: AgentSpec = AgentSpec {
    role: "Developer",
    goal: "Produce a single structured JSON change set implementing the issue.",
    backstory: "You write production-grade code and include tests when possible.",
};

pub const REVIEWER: AgentSpec = AgentSpec {
    role: "Code Reviewer",
    goal: "Catch bugs and integration gaps before anything is applied.",
    backstory: "You are strict but practical; you fail the gate when changes are needed.",
};

pub const TESTER: AgentSpec = AgentSpec {
    role: "QA Tester",
    goal: "Execute tests against the applied changes and report results truthfully.",
    backstory: "You run the project's own test commands and report exactly what they print.",
};

/// Inputs shared by every prompt pack of a run.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub issue_text: &'a str,
    pub context: &'a str,
    pub requirements: &'a [Requirement],
    pub allowlist_preview: &'a [String],
    pub canonical_files: &'a [String],
    pub forbidden_prefixes: &'a [&'static str],
    pub repo_kind: &'a str,
}

#[derive(Debug, Serialize)]
struct RequirementView {
    text: String,
}

/// Template engine over the embedded agent templates.
pub struct PromptEngine {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptEngine {
    pub fn new() -> Self {
        Self::with_budget(PROMPT_BUDGET_BYTES)
    }

    pub fn with_budget(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("product", PRODUCT_TEMPLATE)
            .expect("product template should be valid");
        env.add_template("auditor", AUDITOR_TEMPLATE)
            .expect("auditor template should be valid");
        env.add_template("architect", ARCHITECT_TEMPLATE)
            .expect("architect template should be valid");
        env.add_template("developer", DEVELOPER_TEMPLATE)
            .expect("developer template should be valid");
        env.add_template("reviewer", REVIEWER_TEMPLATE)
            .expect("reviewer template should be valid");
        Self { env, budget_bytes }
    }

    pub fn render_product(&self, inputs: &PromptInputs<'_>) -> String {
        let rendered = self
            .env
            .get_template("product")
            .expect("template registered")
            .render(context! {
                issue => inputs.issue_text.trim(),
                context => non_empty(inputs.context),
            })
            .expect("product template rendering should not fail");
        self.pack(rendered)
    }

    pub fn render_auditor(&self, inputs: &PromptInputs<'_>) -> String {
        let rendered = self
            .env
            .get_template("auditor")
            .expect("template registered")
            .render(context! {
                issue => inputs.issue_text.trim(),
                context => non_empty(inputs.context),
                canonical_files => inputs.canonical_files,
            })
            .expect("auditor template rendering should not fail");
        self.pack(rendered)
    }

    pub fn render_architect(
        &self,
        inputs: &PromptInputs<'_>,
        product: &str,
        audit: &str,
    ) -> String {
        let rendered = self
            .env
            .get_template("architect")
            .expect("template registered")
            .render(context! {
                issue => inputs.issue_text.trim(),
                context => non_empty(inputs.context),
                product => non_empty(product),
                audit => non_empty(audit),
                requirements => requirement_views(inputs.requirements),
                allowlist => inputs.allowlist_preview,
            })
            .expect("architect template rendering should not fail");
        self.pack(rendered)
    }

    pub fn render_developer(
        &self,
        inputs: &PromptInputs<'_>,
        plan: &str,
        retry_checklist: Option<&str>,
    ) -> String {
        let rendered = self
            .env
            .get_template("developer")
            .expect("template registered")
            .render(context! {
                issue => inputs.issue_text.trim(),
                context => non_empty(inputs.context),
                plan => non_empty(plan),
                allowlist => inputs.allowlist_preview,
                forbidden_prefixes => inputs.forbidden_prefixes,
                repo_kind => inputs.repo_kind,
                retry_checklist => retry_checklist.map(str::trim).filter(|s| !s.is_empty()),
            })
            .expect("developer template rendering should not fail");
        self.pack(rendered)
    }

    pub fn render_reviewer(
        &self,
        inputs: &PromptInputs<'_>,
        plan: &str,
        changes_raw: &str,
    ) -> String {
        let rendered = self
            .env
            .get_template("reviewer")
            .expect("template registered")
            .render(context! {
                requirements => requirement_views(inputs.requirements),
                plan => non_empty(plan),
                changes => changes_raw.trim(),
            })
            .expect("reviewer template rendering should not fail");
        self.pack(rendered)
    }

    fn pack(&self, rendered: String) -> String {
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        sections
            .iter()
            .map(|section| section.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn requirement_views(requirements: &[Requirement]) -> Vec<RequirementView> {
    requirements
        .iter()
        .map(|requirement| RequirementView {
            text: requirement.text.clone(),
        })
        .collect()
}

fn non_empty(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

static SECTION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section marker")
});

/// Sections dropped first when over budget.
const DROP_ORDER: &[&str] = &["context", "product", "audit", "allowlist", "plan"];

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_MARKER.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (index, caps) in markers.iter().enumerate() {
        let key = caps.get(1).expect("key group").as_str().to_string();
        let required = caps.get(2).expect("kind group").as_str() == "required";
        let start = caps.get(0).expect("full match").end();
        let end = markers
            .get(index + 1)
            .map(|next| next.get(0).expect("full match").start())
            .unwrap_or(rendered.len());
        let content = rendered[start..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(Section {
                key,
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |sections: &[Section]| -> usize {
        sections.iter().map(|section| section.content.len()).sum()
    };
    if total(sections) <= budget {
        return;
    }

    for key in DROP_ORDER {
        if total(sections) <= budget {
            break;
        }
        if let Some(index) = sections
            .iter()
            .position(|section| section.key == *key && !section.required)
        {
            debug!(section = key, "dropped section for budget");
            sections.remove(index);
        }
    }

    // Still over budget: truncate the last section.
    let total_len = total(sections);
    if total_len > budget {
        if let Some(last) = sections.last_mut() {
            let others = total_len - last.content.len();
            let allowed = budget.saturating_sub(others);
            if last.content.len() > allowed {
                let cut = allowed.saturating_sub(12);
                let boundary = floor_char_boundary(&last.content, cut);
                last.content.truncate(boundary);
                last.content.push_str("\n[truncated]");
            }
        }
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut boundary = index.min(text.len());
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    boundary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::requirements::extract_requirements;

    fn inputs<'a>(
        requirements: &'a [Requirement],
        allowlist: &'a [String],
        canonical: &'a [String],
    ) -> PromptInputs<'a> {
        PromptInputs {
            issue_text: "# Add a Clear button\n\nUsers need a quick reset.",
            context: "### app.js\n```\nfunction init() {}\n```",
            requirements,
            allowlist_preview: allowlist,
            canonical_files: canonical,
            forbidden_prefixes: crate::io::allowlist::FORBIDDEN_PREFIXES,
            repo_kind: "static frontend web app (no backend)",
        }
    }

    #[test]
    fn developer_prompt_carries_constraints_and_operations() {
        let requirements = extract_requirements("", "## AC\n- Add a clear button");
        let allowlist = vec!["app.js".to_string(), "index.html".to_string()];
        let canonical = vec!["app.js".to_string()];
        let engine = PromptEngine::new();
        let prompt = engine.render_developer(
            &inputs(&requirements, &allowlist, &canonical),
            "plan text",
            None,
        );

        assert!(prompt.contains("upsert_function_js"));
        assert!(prompt.contains("app.js"));
        assert!(prompt.contains("api/"));
        assert!(prompt.contains("diff --git"));
        assert!(!prompt.contains("retry"));
    }

    #[test]
    fn developer_prompt_appends_retry_checklist_when_present() {
        let requirements: Vec<Requirement> = Vec::new();
        let allowlist = vec!["app.js".to_string()];
        let canonical = vec!["app.js".to_string()];
        let engine = PromptEngine::new();
        let prompt = engine.render_developer(
            &inputs(&requirements, &allowlist, &canonical),
            "plan",
            Some("- Missing functions: handleClear"),
        );
        assert!(prompt.contains("previous attempt was incomplete"));
        assert!(prompt.contains("Missing functions: handleClear"));
    }

    #[test]
    fn sections_drop_in_fixed_order_under_budget_pressure() {
        let requirements: Vec<Requirement> = Vec::new();
        let allowlist = vec!["app.js".to_string()];
        let canonical = vec!["app.js".to_string()];
        let engine = PromptEngine::with_budget(900);

        let big_context = "x".repeat(2_000);
        let mut prompt_inputs = inputs(&requirements, &allowlist, &canonical);
        prompt_inputs.context = &big_context;

        let prompt = engine.render_developer(&prompt_inputs, "plan", None);
        assert!(
            !prompt.contains(&big_context),
            "context section should be dropped first"
        );
        assert!(prompt.contains("structured JSON"));
    }

    #[test]
    fn auditor_prompt_lists_canonical_files() {
        let requirements: Vec<Requirement> = Vec::new();
        let allowlist = vec!["app.js".to_string()];
        let canonical = vec!["index.html".to_string(), "app.js".to_string()];
        let engine = PromptEngine::new();
        let prompt = engine.render_auditor(&inputs(&requirements, &allowlist, &canonical));
        assert!(prompt.contains("index.html"));
        assert!(prompt.contains("canonical_files_present"));
    }

    #[test]
    fn reviewer_prompt_includes_requirements_and_changes() {
        let requirements = extract_requirements("", "## AC\n- Toast appears on save");
        let allowlist = vec!["app.js".to_string()];
        let canonical = vec!["app.js".to_string()];
        let engine = PromptEngine::new();
        let prompt = engine.render_reviewer(
            &inputs(&requirements, &allowlist, &canonical),
            "plan",
            "{\"changes\": []}",
        );
        assert!(prompt.contains("Toast appears on save"));
        assert!(prompt.contains("{\"changes\": []}"));
        assert!(prompt.contains("\"pass\""));
    }

    #[test]
    fn system_prompts_carry_role_identity() {
        assert!(PRODUCT_MANAGER.system_prompt().contains("Product Manager"));
        assert!(REVIEWER.system_prompt().contains("Code Reviewer"));
    }
}
