//! Run state: the single source of truth for gate cascade outcomes.
//!
//! `RunState` is owned by the orchestrator and mutated only through the
//! forward-only `mark_*` methods: a flag that has become `true` can never
//! revert. The summary emitter keys every claim it makes to one of these
//! booleans.

use serde::Serialize;

/// Categorized missing-item record populated by failed gates.
///
/// Feeds both the retry payload handed back to the developer agent and the
/// terminal "incomplete" report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MissingItems {
    pub functions: Vec<String>,
    pub css_selectors: Vec<String>,
    pub test_files: Vec<String>,
    pub required_files: Vec<String>,
    pub validation_errors: Vec<String>,
    pub unsatisfied_requirements: Vec<String>,
    /// Machine-readable reason for the failure, e.g. `validation_failed`.
    pub failure_reason: Option<String>,
    /// One-line human summary of the failure.
    pub failure_summary: Option<String>,
}

impl MissingItems {
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
            && self.css_selectors.is_empty()
            && self.test_files.is_empty()
            && self.required_files.is_empty()
            && self.validation_errors.is_empty()
            && self.unsatisfied_requirements.is_empty()
            && self.failure_reason.is_none()
    }

    pub fn set_failure(&mut self, reason: &str, summary: String) {
        self.failure_reason = Some(reason.to_string());
        self.failure_summary = Some(summary);
    }

    /// Render the missing items as the human-readable checklist appended to
    /// the developer task on retry.
    pub fn checklist(&self) -> String {
        let mut lines = Vec::new();
        push_category(&mut lines, "Missing functions", &self.functions);
        push_category(&mut lines, "Missing CSS selectors", &self.css_selectors);
        push_category(&mut lines, "Missing test files", &self.test_files);
        push_category(&mut lines, "Missing required files", &self.required_files);
        push_category(&mut lines, "Validation errors", &self.validation_errors);
        push_category(
            &mut lines,
            "Unsatisfied requirements",
            &self.unsatisfied_requirements,
        );
        if lines.is_empty() {
            if let Some(summary) = &self.failure_summary {
                lines.push(format!("- {summary}"));
            }
        }
        lines.join("\n")
    }

    /// Reset per-attempt categories while keeping nothing stale across
    /// retries. Called by the orchestrator before re-running the developer.
    pub fn clear_for_retry(&mut self) {
        *self = Self::default();
    }
}

fn push_category(lines: &mut Vec<String>, label: &str, items: &[String]) {
    if !items.is_empty() {
        lines.push(format!("- {label}: {}", items.join(", ")));
    }
}

/// Per-run bookkeeping read by post-apply actions and the summary emitter.
///
/// Lifecycle: created at pipeline start; boolean fields transition only
/// false→true; `errors` is append-only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunState {
    applied_ok: bool,
    coverage_ok: bool,
    did_commit: bool,
    did_push: bool,
    did_move_done: bool,
    errors: Vec<String>,
    pub current_branch: Option<String>,
    pub head_sha_before: Option<String>,
    pub head_sha_after: Option<String>,
    pub missing: MissingItems,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied_ok(&self) -> bool {
        self.applied_ok
    }

    pub fn coverage_ok(&self) -> bool {
        self.coverage_ok
    }

    pub fn did_commit(&self) -> bool {
        self.did_commit
    }

    pub fn did_push(&self) -> bool {
        self.did_push
    }

    pub fn did_move_done(&self) -> bool {
        self.did_move_done
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn mark_applied(&mut self) {
        self.applied_ok = true;
    }

    /// Master "complete" flag: set only when every gate has passed.
    pub fn mark_coverage_ok(&mut self) {
        self.coverage_ok = true;
    }

    pub fn mark_committed(&mut self) {
        self.did_commit = true;
    }

    pub fn mark_pushed(&mut self) {
        self.did_push = true;
    }

    pub fn mark_moved_done(&mut self) {
        self.did_move_done = true;
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn record_errors<I, S>(&mut self, errors: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for error in errors {
            self.errors.push(error.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_false_and_only_move_forward() {
        let mut state = RunState::new();
        assert!(!state.applied_ok());
        assert!(!state.coverage_ok());
        assert!(!state.did_commit());
        assert!(!state.did_push());
        assert!(!state.did_move_done());

        state.mark_applied();
        state.mark_coverage_ok();
        state.mark_committed();
        state.mark_pushed();
        state.mark_moved_done();

        // There is no API to unset a flag; marking again is a no-op.
        state.mark_coverage_ok();
        assert!(state.applied_ok());
        assert!(state.coverage_ok());
        assert!(state.did_commit());
        assert!(state.did_push());
        assert!(state.did_move_done());
    }

    #[test]
    fn errors_are_append_only() {
        let mut state = RunState::new();
        state.record_error("first");
        state.record_errors(vec!["second", "third"]);
        assert_eq!(state.errors(), ["first", "second", "third"]);
    }

    #[test]
    fn checklist_lists_each_populated_category() {
        let mut missing = MissingItems::default();
        missing.functions.push("handleClear".to_string());
        missing.css_selectors.push(".toast".to_string());
        missing
            .unsatisfied_requirements
            .push("Add a Clear button".to_string());

        let checklist = missing.checklist();
        assert!(checklist.contains("Missing functions: handleClear"));
        assert!(checklist.contains("Missing CSS selectors: .toast"));
        assert!(checklist.contains("Unsatisfied requirements: Add a Clear button"));
        assert!(!checklist.contains("Missing test files"));
    }

    #[test]
    fn checklist_falls_back_to_failure_summary() {
        let mut missing = MissingItems::default();
        missing.set_failure("parse_failed", "no structured changes found".to_string());
        assert_eq!(missing.checklist(), "- no structured changes found");
        assert!(!missing.is_empty());
    }

    #[test]
    fn empty_missing_items_report_empty() {
        assert!(MissingItems::default().is_empty());
        assert_eq!(MissingItems::default().checklist(), "");
    }
}
