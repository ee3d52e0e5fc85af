//! Typed records for the auditor and reviewer gate outputs.
//!
//! Both agents emit JSON. The records are schema-validated at the boundary,
//! then consulted as plain data; the orchestrator never string-searches agent
//! output after this point.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const CONTEXT_AUDIT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/context_audit.schema.json"
));
const REVIEW_VERDICT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/review_verdict.schema.json"
));

/// Evidence line quoted by the context auditor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvidence {
    pub identifier: String,
    pub quote: String,
    pub file: String,
}

/// Context auditor output: proof that the bundled context contains what the
/// later stages will reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextAudit {
    pub canonical_files_present: BTreeMap<String, bool>,
    #[serde(default)]
    pub dom_ids: Vec<String>,
    #[serde(default)]
    pub css_selectors: Vec<String>,
    #[serde(default)]
    pub js_functions_or_anchors: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<AuditEvidence>,
    #[serde(default)]
    pub missing: Vec<String>,
}

impl ContextAudit {
    /// Valid iff nothing is missing and every canonical file was confirmed.
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.canonical_files_present.values().all(|present| *present)
    }

    /// Canonical files the auditor could not confirm.
    pub fn absent_canonical_files(&self) -> Vec<&str> {
        self.canonical_files_present
            .iter()
            .filter(|(_, present)| !**present)
            .map(|(path, _)| path.as_str())
            .collect()
    }
}

/// Reviewer output gating change application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub pass: bool,
    #[serde(default)]
    pub failed_requirements: Vec<String>,
    #[serde(default)]
    pub failed_integration_checks: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

/// Parse a [`ContextAudit`] from raw agent text.
pub fn parse_context_audit(text: &str) -> Result<ContextAudit, Vec<String>> {
    parse_validated(text, &AUDIT_VALIDATOR, "context audit")
}

/// Parse a [`ReviewVerdict`] from raw agent text.
pub fn parse_review_verdict(text: &str) -> Result<ReviewVerdict, Vec<String>> {
    parse_validated(text, &REVIEW_VALIDATOR, "review verdict")
}

static AUDIT_VALIDATOR: LazyLock<jsonschema::Validator> =
    LazyLock::new(|| compile(CONTEXT_AUDIT_SCHEMA));
static REVIEW_VALIDATOR: LazyLock<jsonschema::Validator> =
    LazyLock::new(|| compile(REVIEW_VERDICT_SCHEMA));

fn compile(schema_text: &str) -> jsonschema::Validator {
    let schema: Value = serde_json::from_str(schema_text).expect("embedded schema parses");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("embedded schema compiles")
}

fn parse_validated<T: serde::de::DeserializeOwned>(
    text: &str,
    validator: &jsonschema::Validator,
    label: &str,
) -> Result<T, Vec<String>> {
    let json_text = extract_object(text)
        .ok_or_else(|| vec![format!("no {label} JSON found in agent output")])?;
    let value: Value = serde_json::from_str(&json_text)
        .map_err(|e| vec![format!("invalid {label} JSON: {e}")])?;

    let errors: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| format!("{err} at {}", err.instance_path))
        .collect();
    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value(value).map_err(|e| vec![format!("{label} shape rejected: {e}")])
}

/// Outermost JSON object in the text, fenced or bare.
fn extract_object(text: &str) -> Option<String> {
    use regex::Regex;
    static FENCED: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced pattern")
    });
    if let Some(caps) = FENCED.captures(text) {
        return Some(caps[1].to_string());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| text[start..=end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_audit_json() -> String {
        r#"{
          "canonical_files_present": {"index.html": true, "app.js": true},
          "dom_ids": ["editModal"],
          "css_selectors": [".toast"],
          "js_functions_or_anchors": ["init"],
          "evidence": [{"identifier": "init", "quote": "function init() {", "file": "app.js"}],
          "missing": []
        }"#
        .to_string()
    }

    #[test]
    fn clean_audit_parses_and_reports_clean() {
        let audit = parse_context_audit(&clean_audit_json()).expect("parse");
        assert!(audit.is_clean());
        assert!(audit.absent_canonical_files().is_empty());
    }

    #[test]
    fn audit_with_missing_items_is_not_clean() {
        let text = r##"{"canonical_files_present": {"app.js": true}, "missing": ["#saveButton"]}"##;
        let audit = parse_context_audit(text).expect("parse");
        assert!(!audit.is_clean());
    }

    #[test]
    fn audit_with_absent_canonical_file_is_not_clean() {
        let text = r#"{"canonical_files_present": {"app.js": false}, "missing": []}"#;
        let audit = parse_context_audit(text).expect("parse");
        assert!(!audit.is_clean());
        assert_eq!(audit.absent_canonical_files(), ["app.js"]);
    }

    #[test]
    fn audit_requires_the_mandatory_keys() {
        let errors = parse_context_audit(r#"{"dom_ids": []}"#).unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn review_verdict_round_trips_from_fenced_block() {
        let text = "Verdict:\n```json\n{\"pass\": false, \"failed_requirements\": [\"toast missing\"], \"notes\": \"needs work\"}\n```";
        let verdict = parse_review_verdict(text).expect("parse");
        assert!(!verdict.pass);
        assert_eq!(verdict.failed_requirements, ["toast missing"]);
        assert_eq!(verdict.notes, "needs work");
    }

    #[test]
    fn review_verdict_defaults_optional_lists() {
        let verdict = parse_review_verdict(r#"{"pass": true}"#).expect("parse");
        assert!(verdict.pass);
        assert!(verdict.failed_requirements.is_empty());
        assert!(verdict.failed_integration_checks.is_empty());
    }

    #[test]
    fn prose_without_json_is_an_error() {
        let errors = parse_review_verdict("looks good to me!").unwrap_err();
        assert!(errors[0].contains("no review verdict JSON"));
    }
}
