//! Architect plan parsing: which functions, selectors, and files the plan
//! commits the developer to.
//!
//! Extraction is deliberately narrow. CSS selectors are only taken from
//! backticks, fenced code blocks, or rule-header lines, never from plain
//! sentences, so the coverage gate cannot be tripped by prose.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

/// Requirements recovered from the architect's plan text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanRequirements {
    pub functions: Vec<String>,
    pub css_selectors: Vec<String>,
    pub test_files: Vec<String>,
    pub required_files: Vec<String>,
}

impl PlanRequirements {
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
            && self.css_selectors.is_empty()
            && self.test_files.is_empty()
            && self.required_files.is_empty()
    }
}

static FUNCTIONS_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)#{2,3}\s*New Functions[^#]*").expect("functions section pattern")
});

static FUNCTION_BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-*]\s*`?(\w+)\s*\([^)]*\)`?").expect("function bullet pattern"));

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```(?:css)?\s*([^`]+)```").expect("fenced block pattern")
});

static BLOCK_SELECTOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*([.#\[][\w\-]+(?:\s*[.#\[][\w\-]+)*)\s*\{?\s*$")
        .expect("block selector pattern")
});

static INLINE_SELECTOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"`((?:[.#][\w\-]+|\[[^\]]+\]))`").expect("inline selector pattern")
});

static RULE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*([.#\[][\w\-]+(?:\s+[.#\[][\w\-]+)*)\s*\{").expect("rule header pattern")
});

static TEST_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)Test Approach[^#]*").expect("test section pattern")
});

static TEST_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(tests?/[\w./\-]+\.(?:js|ts|py))").expect("test path pattern")
});

static FILES_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)#{2,3}\s*Files to Change[^#]*").expect("files section pattern")
});

static FILE_BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-*]\s*`([^`]+)`").expect("file bullet pattern"));

/// Parse plan requirements from the architect output.
pub fn parse_plan_requirements(plan: &str) -> PlanRequirements {
    let mut requirements = PlanRequirements::default();

    if let Some(section) = FUNCTIONS_SECTION.find(plan) {
        for caps in FUNCTION_BULLET.captures_iter(section.as_str()) {
            let name = caps[1].to_string();
            if name != "function" && !requirements.functions.contains(&name) {
                requirements.functions.push(name);
            }
        }
    }

    requirements.css_selectors = extract_css_selectors(plan);

    if let Some(section) = TEST_SECTION.find(plan) {
        for caps in TEST_PATH.captures_iter(section.as_str()) {
            let path = caps[1].to_string();
            if !requirements.test_files.contains(&path) {
                requirements.test_files.push(path);
            }
        }
    }

    if let Some(section) = FILES_SECTION.find(plan) {
        for caps in FILE_BULLET.captures_iter(section.as_str()) {
            let path = caps[1].trim().to_string();
            if is_plausible_path(&path) && !requirements.required_files.contains(&path) {
                requirements.required_files.push(path);
            }
        }
    }

    requirements
}

/// Selector extraction, sorted for deterministic output.
///
/// Sources, in order: fenced code blocks, inline backticks, and lines that
/// look like CSS rule headers. Only tokens starting with `.`, `#`, or `[`
/// qualify.
fn extract_css_selectors(plan: &str) -> Vec<String> {
    let mut selectors = BTreeSet::new();

    for block in FENCED_BLOCK.captures_iter(plan) {
        for caps in BLOCK_SELECTOR.captures_iter(&block[1]) {
            insert_selector(&mut selectors, &caps[1]);
        }
        for caps in RULE_HEADER.captures_iter(&block[1]) {
            insert_selector(&mut selectors, &caps[1]);
        }
    }

    for caps in INLINE_SELECTOR.captures_iter(plan) {
        insert_selector(&mut selectors, &caps[1]);
    }

    for caps in RULE_HEADER.captures_iter(plan) {
        insert_selector(&mut selectors, &caps[1]);
    }

    selectors.into_iter().collect()
}

fn insert_selector(selectors: &mut BTreeSet<String>, raw: &str) {
    let selector = raw.trim().trim_end_matches('{').trim().to_string();
    if selector.starts_with('.') || selector.starts_with('#') || selector.starts_with('[') {
        selectors.insert(selector);
    }
}

/// Reject bullets from "Files to Change" that are clearly not paths.
fn is_plausible_path(candidate: &str) -> bool {
    !candidate.is_empty()
        && !candidate.contains(char::is_whitespace)
        && candidate.contains('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_functions_from_new_functions_section() {
        let plan = "## New Functions\n- `openEditModal(sessionId)`\n- handleClear()\n\n## Other\n- `notAFunction`";
        let requirements = parse_plan_requirements(plan);
        assert_eq!(requirements.functions, ["openEditModal", "handleClear"]);
    }

    #[test]
    fn selectors_come_from_backticks_not_prose() {
        let plan = "Style the `.modal` and `#toast` elements. The modal overlay needs work.";
        let requirements = parse_plan_requirements(plan);
        assert_eq!(requirements.css_selectors, ["#toast", ".modal"]);
    }

    #[test]
    fn selectors_come_from_fenced_css_blocks() {
        let plan = "```css\n.session-row {\n  color: red;\n}\n#editModal {\n}\n```";
        let requirements = parse_plan_requirements(plan);
        assert_eq!(requirements.css_selectors, ["#editModal", ".session-row"]);
    }

    #[test]
    fn attribute_selectors_are_accepted() {
        let plan = "Use the `[data-id]` selector for rows.";
        let requirements = parse_plan_requirements(plan);
        assert_eq!(requirements.css_selectors, ["[data-id]"]);
    }

    #[test]
    fn plain_sentences_never_produce_selectors() {
        let plan = "The header gets a clear button. No styling mentioned otherwise.";
        let requirements = parse_plan_requirements(plan);
        assert!(requirements.css_selectors.is_empty());
    }

    #[test]
    fn test_files_require_a_test_approach_context() {
        let plan = "## Test Approach\nAdd `tests/clear_button.test.js` and run:\n```\nnpm test tests/clear_button.test.js\n```";
        let requirements = parse_plan_requirements(plan);
        assert_eq!(requirements.test_files, ["tests/clear_button.test.js"]);
    }

    #[test]
    fn required_files_come_from_files_to_change_bullets() {
        let plan = "## Files to Change\n- `app.js`\n- `styles.css`\n- `not a path`\n\n## Next\nignored";
        let requirements = parse_plan_requirements(plan);
        assert_eq!(requirements.required_files, ["app.js", "styles.css"]);
    }

    #[test]
    fn empty_plan_yields_empty_requirements() {
        assert!(parse_plan_requirements("").is_empty());
    }
}
