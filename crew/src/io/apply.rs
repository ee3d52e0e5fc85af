//! Structured change applier: validate everything, then mutate the tree.
//!
//! Validation is all-or-nothing; no byte is written until the whole change
//! set passes. Application takes a content snapshot of every targeted path
//! first and rolls the tree back atomically if any operation fails, so a
//! half-applied change set can never leak into later gates.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::changes::{Change, ChangeSet};
use crate::core::edits::{
    append_if_missing, apply_find_replace, insert_after_anchor, insert_before_anchor,
    upsert_css_rule, upsert_js_function, EditOutcome,
};
use crate::io::allowlist::{check_path_safety, forbidden_prefix, PathAllowlist};

/// Substrings that mark a change as unfinished work. Case-insensitive.
pub const FORBIDDEN_PLACEHOLDERS: &[&str] =
    &["todo", "placeholder", "logic to ", "tbd", "replace_me", "fill in"];

/// Backend-dependency references that must never appear in a pure-frontend
/// repository. Case-insensitive.
pub const FORBIDDEN_DEPENDENCIES: &[&str] = &[
    "require('express",
    "require(\"express",
    "from 'express'",
    "from \"express\"",
    "mongoose",
    "app.listen(",
];

/// First forbidden placeholder occurring in `text`, if any.
pub fn placeholder_hit(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    FORBIDDEN_PLACEHOLDERS
        .iter()
        .copied()
        .find(|placeholder| lower.contains(placeholder))
}

/// First forbidden dependency reference occurring in `text`, if any.
pub fn dependency_hit(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    FORBIDDEN_DEPENDENCIES
        .iter()
        .copied()
        .find(|marker| lower.contains(marker))
}

/// Result of applying a validated change set.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Files whose bytes differ from their pre-apply state, sorted.
    pub changed_files: Vec<String>,
    /// Per-change application errors. Non-empty means the tree was rolled
    /// back and nothing changed.
    pub errors: Vec<String>,
    /// Pre-apply content of every targeted path, kept so later gates can
    /// still roll the attempt back.
    snapshot: BTreeMap<String, Option<String>>,
}

impl ApplyOutcome {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Applies a [`ChangeSet`] to a working tree under allowlist discipline.
pub struct Applier<'a> {
    root: &'a Path,
    allowlist: &'a PathAllowlist,
    canonical: &'a [String],
}

impl<'a> Applier<'a> {
    pub fn new(root: &'a Path, allowlist: &'a PathAllowlist, canonical: &'a [String]) -> Self {
        Self {
            root,
            allowlist,
            canonical,
        }
    }

    /// Validation phase. Returns every violation; an empty list is the only
    /// green light for [`Self::apply`].
    #[instrument(skip_all, fields(changes = set.changes.len()))]
    pub fn validate(&self, set: &ChangeSet) -> Vec<String> {
        let mut errors = Vec::new();

        for (index, change) in set.changes.iter().enumerate() {
            let path = change.path();

            if let Err(message) = check_path_safety(path, self.root) {
                errors.push(format!("change {index}: {message}"));
                continue;
            }

            for content in change.content_fields() {
                if let Some(placeholder) = placeholder_hit(content) {
                    errors.push(format!(
                        "change {index}: forbidden placeholder '{placeholder}' in content for '{path}'"
                    ));
                }
                if let Some(dependency) = dependency_hit(content) {
                    errors.push(format!(
                        "change {index}: forbidden dependency reference '{dependency}' in content for '{path}' (this repo has no backend)"
                    ));
                }
            }

            if change.requires_existing_file() {
                let known = self.allowlist.contains(path)
                    || self.canonical.iter().any(|c| c == path)
                    || self.root.join(path).exists();
                if !known {
                    if let Some(similar) = self.allowlist.find_case_insensitive(path) {
                        errors.push(format!(
                            "change {index}: file '{path}' not found, but a similar file exists: {similar}"
                        ));
                    } else if let Some(prefix) = forbidden_prefix(path) {
                        errors.push(format!(
                            "change {index}: file '{path}' does not exist and matches the forbidden prefix '{prefix}'; only modify existing files in this repo"
                        ));
                    } else {
                        errors.push(format!(
                            "change {index}: file '{path}' does not exist (for {} operation); only modify existing files in this repo",
                            change.operation()
                        ));
                    }
                }
            } else if let Some(prefix) = forbidden_prefix(path) {
                errors.push(format!(
                    "change {index}: refusing to create '{path}' under forbidden prefix '{prefix}'"
                ));
            } else if self.root.join(path).exists() {
                // Creation never overwrites, not even under test directories;
                // an existing target must be reached with replace_file/edit.
                errors.push(format!(
                    "change {index}: file '{path}' already exists (create operation)"
                ));
            }
        }

        if !errors.is_empty() {
            warn!(count = errors.len(), "change set failed validation");
        }
        errors
    }

    /// Application phase. Assumes [`Self::validate`] returned no errors.
    ///
    /// Operations run in input order. On any failure the pre-captured
    /// snapshot is restored and the outcome carries the per-change errors.
    #[instrument(skip_all, fields(changes = set.changes.len()))]
    pub fn apply(&self, set: &ChangeSet) -> Result<ApplyOutcome> {
        let snapshot = self.capture_snapshot(set)?;
        let mut errors = Vec::new();

        for (index, change) in set.changes.iter().enumerate() {
            if let Err(message) = self.apply_one(change) {
                errors.push(format!("change {index} ({}): {message}", change.path()));
            }
        }

        if !errors.is_empty() {
            self.restore_snapshot(&snapshot)?;
            return Ok(ApplyOutcome {
                changed_files: Vec::new(),
                errors,
                snapshot,
            });
        }

        let mut changed = BTreeSet::new();
        for (path, before) in &snapshot {
            let after = self.read_optional(path)?;
            if &after != before {
                changed.insert(path.clone());
            }
        }
        debug!(changed = changed.len(), "change set applied");
        Ok(ApplyOutcome {
            changed_files: changed.into_iter().collect(),
            errors,
            snapshot,
        })
    }

    /// Undo a successful application, restoring every targeted path to its
    /// pre-apply content. Used when a later gate fails the attempt.
    pub fn rollback(&self, outcome: &ApplyOutcome) -> Result<()> {
        self.restore_snapshot(&outcome.snapshot)
    }

    /// Post-apply scan: every written file re-checked for placeholders.
    pub fn scan_written_files(&self, files: &[String]) -> Vec<String> {
        let mut hits = Vec::new();
        for rel in files {
            let Ok(contents) = std::fs::read_to_string(self.root.join(rel)) else {
                continue;
            };
            if let Some(placeholder) = placeholder_hit(&contents) {
                hits.push(format!(
                    "written file '{rel}' contains forbidden placeholder '{placeholder}'"
                ));
            }
        }
        hits
    }

    fn apply_one(&self, change: &Change) -> Result<(), String> {
        let rel = change.path();
        let full = self.root.join(rel);

        match change {
            Change::Create { content, .. } => {
                if full.exists() {
                    return Err("file already exists (create)".to_string());
                }
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                }
                std::fs::write(&full, content).map_err(|e| e.to_string())
            }
            Change::ReplaceFile { content, .. } => {
                let current = self.read_required(&full)?;
                if &current == content {
                    return Ok(());
                }
                std::fs::write(&full, content).map_err(|e| e.to_string())
            }
            Change::UpsertFunctionJs {
                function_name,
                content,
                ..
            } => {
                let current = self.read_required(&full)?;
                self.write_outcome(&full, upsert_js_function(&current, function_name, content))
            }
            Change::UpsertCssSelector {
                selector, content, ..
            } => {
                let current = self.read_required(&full)?;
                self.write_outcome(&full, upsert_css_rule(&current, selector, content))
            }
            Change::InsertAfterAnchor {
                anchor,
                content,
                use_regex,
                ..
            } => {
                let current = self.read_required(&full)?;
                let outcome = insert_after_anchor(&current, anchor, content, *use_regex)?;
                self.write_outcome(&full, outcome)
            }
            Change::InsertBeforeAnchor {
                anchor,
                content,
                use_regex,
                ..
            } => {
                let current = self.read_required(&full)?;
                let outcome = insert_before_anchor(&current, anchor, content, *use_regex)?;
                self.write_outcome(&full, outcome)
            }
            Change::AppendIfMissing {
                signature, content, ..
            } => {
                let current = self.read_required(&full)?;
                self.write_outcome(&full, append_if_missing(&current, signature, content))
            }
            Change::Edit { edits, .. } => {
                let mut current = self.read_required(&full)?;
                for edit in edits {
                    current = apply_find_replace(&current, &edit.find, &edit.replace)?
                        .into_text(&current);
                }
                std::fs::write(&full, current).map_err(|e| e.to_string())
            }
            Change::Delete { .. } => {
                if !full.exists() {
                    return Err("file not found (delete)".to_string());
                }
                std::fs::remove_file(&full).map_err(|e| e.to_string())
            }
        }
    }

    fn write_outcome(&self, full: &Path, outcome: EditOutcome) -> Result<(), String> {
        match outcome {
            EditOutcome::Unchanged => Ok(()),
            EditOutcome::Changed(text) => std::fs::write(full, text).map_err(|e| e.to_string()),
        }
    }

    fn read_required(&self, full: &Path) -> Result<String, String> {
        std::fs::read_to_string(full).map_err(|_| "file not found".to_string())
    }

    fn capture_snapshot(&self, set: &ChangeSet) -> Result<BTreeMap<String, Option<String>>> {
        let mut snapshot = BTreeMap::new();
        for change in &set.changes {
            let rel = change.path().to_string();
            if !snapshot.contains_key(&rel) {
                let before = self.read_optional(&rel)?;
                snapshot.insert(rel, before);
            }
        }
        Ok(snapshot)
    }

    fn read_optional(&self, rel: &str) -> Result<Option<String>> {
        let full = self.root.join(rel);
        if !full.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(&full).with_context(|| {
            format!("read {}", full.display())
        })?))
    }

    fn restore_snapshot(&self, snapshot: &BTreeMap<String, Option<String>>) -> Result<()> {
        for (rel, before) in snapshot {
            let full = self.root.join(rel);
            match before {
                Some(contents) => {
                    if let Some(parent) = full.parent() {
                        std::fs::create_dir_all(parent)
                            .with_context(|| format!("create {}", parent.display()))?;
                    }
                    std::fs::write(&full, contents)
                        .with_context(|| format!("restore {}", full.display()))?;
                }
                None => {
                    if full.exists() {
                        std::fs::remove_file(&full)
                            .with_context(|| format!("remove {}", full.display()))?;
                    }
                }
            }
        }
        warn!(files = snapshot.len(), "rolled back partial application");
        Ok(())
    }
}
