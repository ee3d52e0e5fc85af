//! Typed change sets: the developer agent's wire format, parsed once at the
//! boundary and never re-inspected by string search afterwards.
//!
//! The agent emits a single JSON object. Extraction tolerates fenced code
//! blocks and surrounding prose; validation happens against an embedded JSON
//! Schema before the typed parse, so malformed shapes surface as precise
//! error strings instead of serde noise.

use std::sync::LazyLock;

use jsonschema::Draft;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const CHANGE_SET_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/change_set.schema.json"
));

/// Unified-diff markers that must never appear in content fields. Agents that
/// emit diffs instead of structured changes are rejected outright.
pub const DIFF_MARKERS: &[&str] = &["diff --git", "--- a/", "+++ b/", "@@"];

/// One find/replace pair for the `edit` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindReplace {
    pub find: String,
    pub replace: String,
}

/// A single typed repository mutation.
///
/// The `file` key is accepted as an alias of `path` on input and never
/// re-emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Change {
    Create {
        #[serde(alias = "file")]
        path: String,
        content: String,
    },
    #[serde(rename = "replace_file", alias = "replace")]
    ReplaceFile {
        #[serde(alias = "file")]
        path: String,
        content: String,
    },
    UpsertFunctionJs {
        #[serde(alias = "file")]
        path: String,
        function_name: String,
        content: String,
    },
    UpsertCssSelector {
        #[serde(alias = "file")]
        path: String,
        selector: String,
        content: String,
    },
    InsertAfterAnchor {
        #[serde(alias = "file")]
        path: String,
        anchor: String,
        content: String,
        #[serde(default)]
        use_regex: bool,
    },
    InsertBeforeAnchor {
        #[serde(alias = "file")]
        path: String,
        anchor: String,
        content: String,
        #[serde(default)]
        use_regex: bool,
    },
    AppendIfMissing {
        #[serde(alias = "file")]
        path: String,
        signature: String,
        content: String,
    },
    Edit {
        #[serde(alias = "file")]
        path: String,
        edits: Vec<FindReplace>,
    },
    Delete {
        #[serde(alias = "file")]
        path: String,
    },
}

impl Change {
    pub fn path(&self) -> &str {
        match self {
            Self::Create { path, .. }
            | Self::ReplaceFile { path, .. }
            | Self::UpsertFunctionJs { path, .. }
            | Self::UpsertCssSelector { path, .. }
            | Self::InsertAfterAnchor { path, .. }
            | Self::InsertBeforeAnchor { path, .. }
            | Self::AppendIfMissing { path, .. }
            | Self::Edit { path, .. }
            | Self::Delete { path } => path,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::ReplaceFile { .. } => "replace_file",
            Self::UpsertFunctionJs { .. } => "upsert_function_js",
            Self::UpsertCssSelector { .. } => "upsert_css_selector",
            Self::InsertAfterAnchor { .. } => "insert_after_anchor",
            Self::InsertBeforeAnchor { .. } => "insert_before_anchor",
            Self::AppendIfMissing { .. } => "append_if_missing",
            Self::Edit { .. } => "edit",
            Self::Delete { .. } => "delete",
        }
    }

    /// Whether this operation targets a file that must already exist.
    pub fn requires_existing_file(&self) -> bool {
        !matches!(self, Self::Create { .. })
    }

    /// Content-bearing fields subject to placeholder scanning.
    pub fn content_fields(&self) -> Vec<&str> {
        match self {
            Self::Create { content, .. }
            | Self::ReplaceFile { content, .. }
            | Self::UpsertFunctionJs { content, .. }
            | Self::UpsertCssSelector { content, .. }
            | Self::InsertAfterAnchor { content, .. }
            | Self::InsertBeforeAnchor { content, .. }
            | Self::AppendIfMissing { content, .. } => vec![content],
            Self::Edit { edits, .. } => edits.iter().map(|e| e.replace.as_str()).collect(),
            Self::Delete { .. } => Vec::new(),
        }
    }
}

/// The developer's complete output: ordered changes plus free-form notes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced json pattern")
});

/// Extract the JSON object from agent text.
///
/// Prefers a fenced code block; falls back to the outermost braces around a
/// `"changes"` key.
pub fn extract_json_object(text: &str) -> Option<String> {
    if let Some(caps) = FENCED_JSON.captures(text) {
        return Some(caps[1].to_string());
    }
    let key = text.find("\"changes\"")?;
    let start = text[..key].rfind('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(text[start..=end].to_string())
    } else {
        None
    }
}

/// Parse and schema-validate a change set from raw agent text.
///
/// Returns the typed set, or the list of validation error strings that feed
/// the validation gate.
pub fn parse_change_set(text: &str) -> Result<ChangeSet, Vec<String>> {
    let json_text = extract_json_object(text)
        .ok_or_else(|| vec!["no structured changes JSON found in agent output".to_string()])?;

    let value: Value = serde_json::from_str(&json_text)
        .map_err(|e| vec![format!("invalid changes JSON: {e}")])?;

    let schema_errors = validate_against_schema(&value);
    if !schema_errors.is_empty() {
        return Err(schema_errors);
    }

    let diff_errors = scan_diff_markers(&value);
    if !diff_errors.is_empty() {
        return Err(diff_errors);
    }

    serde_json::from_value(value).map_err(|e| vec![format!("change set shape rejected: {e}")])
}

fn validate_against_schema(value: &Value) -> Vec<String> {
    static SCHEMA: LazyLock<Value> = LazyLock::new(|| {
        serde_json::from_str(CHANGE_SET_SCHEMA).expect("embedded change set schema parses")
    });
    static COMPILED: LazyLock<jsonschema::Validator> = LazyLock::new(|| {
        jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&SCHEMA)
            .expect("embedded change set schema compiles")
    });

    COMPILED
        .iter_errors(value)
        .map(|err| format!("{err} at {}", err.instance_path))
        .collect()
}

/// Reject unified-diff markers in content-like fields of the raw value.
///
/// Only `content`, `before`, and `after` string values are scanned, never the
/// stringified record, so an `edit` targeting a line that merely mentions a
/// marker in `find` is not a false positive.
pub fn scan_diff_markers(value: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(changes) = value.get("changes").and_then(Value::as_array) else {
        return errors;
    };
    for (index, change) in changes.iter().enumerate() {
        for field in ["content", "before", "after"] {
            let Some(text) = change.get(field).and_then(Value::as_str) else {
                continue;
            };
            let lower = text.to_lowercase();
            if let Some(marker) = DIFF_MARKERS.iter().find(|m| lower.contains(&m.to_lowercase()))
            {
                errors.push(format!(
                    "change {index}: diff-like content in '{field}' (found marker '{marker}'); emit structured changes, not diffs"
                ));
                break;
            }
        }
    }
    errors
}
