//! Acceptance-criteria extraction and keyword satisfaction checks.
//!
//! Requirements come out of the issue body under headings like "Acceptance
//! Criteria" or "Definition of Done". Satisfaction is a conservative keyword
//! overlap: a requirement may be reported unsatisfied when it actually is
//! satisfied, but never the reverse.

use std::sync::LazyLock;

use regex::Regex;

/// One extracted acceptance criterion with its derived keyword set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub text: String,
    pub keywords: Vec<String>,
}

impl Requirement {
    fn new(text: String) -> Self {
        let keywords = keywords_of(&text);
        Self { text, keywords }
    }
}

static SECTION_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^#{2,3}\s*(?:Acceptance\s+Criteria|Definition\s+of\s+Done|Requirements|AC|DoD|Done\s+when|Scope|Must\s+have|Done|Criteria)\s*$",
    )
    .expect("section heading pattern")
});

static BULLET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-*]\s*(?:\[\s*[xX]?\s*\]\s*)?(.+)$").expect("bullet pattern")
});

static NUMBERED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[.)]\s*(.+)$").expect("numbered pattern"));

/// Minimum characters for a bullet to count as a requirement.
const MIN_REQUIREMENT_LEN: usize = 4;
/// Cap for the unstructured-body fallback.
const FALLBACK_BULLET_CAP: usize = 15;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "to", "of", "and", "or", "in", "on", "for", "is", "be", "can", "that",
    "this", "with", "so", "when", "if", "as", "it", "are", "was", "should",
];

/// Extract requirements from an issue, in document order.
///
/// Headed sections win; without any, the first 15 bullets of the body are
/// used; without those, the title itself becomes a single requirement. Empty
/// input yields an empty list.
pub fn extract_requirements(title: &str, body: &str) -> Vec<Requirement> {
    let text = body.trim();
    let mut requirements: Vec<Requirement> = Vec::new();

    let mut boundaries: Vec<(usize, usize)> = SECTION_HEADING
        .find_iter(text)
        .map(|m| (m.start(), m.end()))
        .collect();
    boundaries.push((text.len(), text.len()));

    for window in boundaries.windows(2) {
        let section = &text[window[0].1..window[1].0];
        for line in section.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let item = BULLET
                .captures(line)
                .or_else(|| NUMBERED.captures(line))
                .map(|caps| caps[1].trim().to_string());
            if let Some(item) = item {
                if item.len() >= MIN_REQUIREMENT_LEN
                    && !requirements.iter().any(|r| r.text == item)
                {
                    requirements.push(Requirement::new(item));
                }
            }
        }
    }

    if requirements.is_empty() && !text.is_empty() {
        for line in text.lines() {
            let line = line.trim();
            if let Some(caps) = BULLET.captures(line) {
                let item = caps[1].trim().to_string();
                if item.len() > MIN_REQUIREMENT_LEN && !requirements.iter().any(|r| r.text == item)
                {
                    requirements.push(Requirement::new(item));
                    if requirements.len() >= FALLBACK_BULLET_CAP {
                        break;
                    }
                }
            }
        }
    }

    if requirements.is_empty() && title.trim().len() > MIN_REQUIREMENT_LEN {
        requirements.push(Requirement::new(title.trim().to_string()));
    }

    requirements
}

/// Requirements whose keyword sets do not sufficiently overlap `corpus`.
///
/// A requirement is satisfied when at least half of its keywords (never fewer
/// than two, unless it has fewer) occur in the lowercased corpus.
pub fn unsatisfied_requirements(requirements: &[Requirement], corpus: &str) -> Vec<String> {
    let corpus_lower = corpus.to_lowercase();
    let mut unsatisfied = Vec::new();

    for requirement in requirements {
        if requirement.keywords.is_empty() {
            if !corpus_lower.contains(&requirement.text.to_lowercase()) {
                unsatisfied.push(requirement.text.clone());
            }
            continue;
        }
        let total = requirement.keywords.len();
        let needed = required_overlap(total);
        let found = requirement
            .keywords
            .iter()
            .filter(|keyword| corpus_lower.contains(keyword.as_str()))
            .count();
        if found < needed {
            unsatisfied.push(requirement.text.clone());
        }
    }

    unsatisfied
}

/// Half the keywords rounded up, floored at two when the set allows it.
fn required_overlap(total: usize) -> usize {
    let half = total.div_ceil(2);
    half.max(2.min(total))
}

fn keywords_of(text: &str) -> Vec<String> {
    static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z0-9_]+").expect("word"));
    let mut keywords = Vec::new();
    for word in WORD.find_iter(text) {
        let lower = word.as_str().to_lowercase();
        if lower.len() > 1 && !STOPWORDS.contains(&lower.as_str()) && !keywords.contains(&lower) {
            keywords.push(lower);
        }
    }
    keywords
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bullets_under_acceptance_criteria() {
        let body = "Intro text.\n\n## Acceptance Criteria\n- Add a 'Clear' button to the header\n- [ ] Toast appears on save\n\n## Notes\nIgnored prose.";
        let requirements = extract_requirements("Title", body);
        assert_eq!(requirements.len(), 2);
        assert_eq!(requirements[0].text, "Add a 'Clear' button to the header");
        assert_eq!(requirements[1].text, "Toast appears on save");
    }

    #[test]
    fn collects_numbered_items_and_multiple_sections() {
        let body = "## Definition of Done\n1. Sessions persist across reloads\n2) Modal closes on escape\n\n### Requirements\n- Keyboard navigation works";
        let requirements = extract_requirements("", body);
        let texts: Vec<&str> = requirements.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(
            texts,
            [
                "Sessions persist across reloads",
                "Modal closes on escape",
                "Keyboard navigation works",
            ]
        );
    }

    #[test]
    fn falls_back_to_leading_bullets_without_sections() {
        let body = "- first requirement here\n- second requirement here\nplain prose line";
        let requirements = extract_requirements("", body);
        assert_eq!(requirements.len(), 2);
    }

    #[test]
    fn fallback_caps_at_fifteen_bullets() {
        let body: String = (0..30)
            .map(|i| format!("- requirement number {i} listed\n"))
            .collect();
        let requirements = extract_requirements("", &body);
        assert_eq!(requirements.len(), FALLBACK_BULLET_CAP);
    }

    #[test]
    fn title_becomes_requirement_when_body_has_none() {
        let requirements = extract_requirements("Fix the session timer drift", "Just prose.");
        assert_eq!(requirements.len(), 1);
        assert_eq!(requirements[0].text, "Fix the session timer drift");
    }

    #[test]
    fn empty_input_yields_empty_list() {
        assert!(extract_requirements("", "").is_empty());
    }

    #[test]
    fn ordering_is_deterministic_and_deduplicated() {
        let body = "## AC\n- same item\n- same item\n- other item";
        let requirements = extract_requirements("", body);
        let texts: Vec<&str> = requirements.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, ["same item", "other item"]);
    }

    #[test]
    fn keywords_drop_stopwords_and_lowercase() {
        let requirements = extract_requirements("", "## AC\n- Add a 'Clear' button to the header");
        assert_eq!(requirements[0].keywords, ["add", "clear", "button", "header"]);
    }

    #[test]
    fn satisfied_requirement_is_not_reported() {
        let requirements = extract_requirements("", "## AC\n- Add a 'Clear' button to the header");
        let corpus = "The plan adds a clear button in the header region.";
        assert!(unsatisfied_requirements(&requirements, corpus).is_empty());
    }

    #[test]
    fn unrelated_corpus_leaves_requirement_unsatisfied() {
        let requirements = extract_requirements("", "## AC\n- Add a 'Clear' button to the header");
        let corpus = "Completely different text about parsing.";
        assert_eq!(
            unsatisfied_requirements(&requirements, corpus),
            ["Add a 'Clear' button to the header"]
        );
    }

    #[test]
    fn overlap_threshold_requires_at_least_two_keywords() {
        // 4 keywords: "add", "clear", "button", "header"; one hit is not enough.
        let requirements = extract_requirements("", "## AC\n- Add a 'Clear' button to the header");
        let corpus = "button";
        assert_eq!(unsatisfied_requirements(&requirements, corpus).len(), 1);
    }

    #[test]
    fn single_keyword_requirement_needs_only_that_keyword() {
        let requirements = vec![Requirement::new("Undo".to_string())];
        assert!(unsatisfied_requirements(&requirements, "supports undo now").is_empty());
    }
}
