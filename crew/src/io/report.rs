//! Plan-file artifact: the durable, human-readable record of one run.
//!
//! Written to `<work_dir>/implementations/issue_<N>_plan.md` for every run
//! that got past the context gate, complete or not. Contains the full agent
//! outputs, the structured change record, gate outcomes, and the patch when
//! one exists.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::debug;

use crate::core::run_state::RunState;
use crate::core::types::RunStatus;

/// Everything that lands in the plan file.
#[derive(Debug, Clone)]
pub struct PlanReport<'a> {
    pub issue_number: u64,
    pub issue_title: &'a str,
    pub status: RunStatus,
    pub attempts: u32,
    pub product: Option<&'a str>,
    pub audit_raw: Option<&'a str>,
    pub plan: Option<&'a str>,
    /// Pretty-printed structured change record after normalization.
    pub changes_json: Option<String>,
    pub review_raw: Option<&'a str>,
    pub run_state: &'a RunState,
    pub patch: Option<&'a str>,
    pub test_report: Option<&'a str>,
}

/// Conventional plan-file path for an issue.
pub fn plan_file_path(work_dir: &Path, issue_number: u64) -> PathBuf {
    work_dir
        .join("implementations")
        .join(format!("issue_{issue_number}_plan.md"))
}

/// Write the plan file, replacing any previous run's record.
pub fn write_plan_file(work_dir: &Path, report: &PlanReport<'_>) -> Result<PathBuf> {
    let path = plan_file_path(work_dir, report.issue_number);
    let parent = path.parent().expect("plan file path has a parent");
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create directory {}", parent.display()))?;

    let mut buf = String::new();
    buf.push_str(&format!(
        "# Implementation Plan for Issue #{}\n\n",
        report.issue_number
    ));
    buf.push_str(&format!("**Title:** {}\n\n", report.issue_title));
    buf.push_str(&format!("**Generated:** {}\n\n", Local::now().to_rfc3339()));
    buf.push_str(&format!(
        "**Run status:** {} after {} attempt(s)\n",
        match report.status {
            RunStatus::Complete => "complete",
            RunStatus::Incomplete => "incomplete",
        },
        report.attempts
    ));

    push_section(&mut buf, "User Story", report.product);
    push_section(&mut buf, "Context Audit", report.audit_raw);
    push_section(&mut buf, "Implementation Plan", report.plan);
    if let Some(changes) = &report.changes_json {
        buf.push_str("\n## Structured Changes\n\n```json\n");
        buf.push_str(changes);
        buf.push_str("\n```\n");
    }
    push_section(&mut buf, "Code Review", report.review_raw);

    buf.push_str("\n## Gate Outcomes\n\n```json\n");
    buf.push_str(
        &serde_json::to_string_pretty(report.run_state).context("serialize run state")?,
    );
    buf.push_str("\n```\n");

    if let Some(test_report) = report.test_report {
        push_section(&mut buf, "Test Results", Some(test_report));
    }

    if let Some(patch) = report.patch {
        buf.push_str("\n## Generated Patch\n\nDerived from the git working tree.\n\n```diff\n");
        buf.push_str(patch);
        buf.push_str("\n```\n");
    }

    std::fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
    debug!(path = %path.display(), "plan file written");
    Ok(path)
}

fn push_section(buf: &mut String, title: &str, body: Option<&str>) {
    if let Some(body) = body {
        if !body.trim().is_empty() {
            buf.push_str(&format!("\n## {title}\n\n{}\n", body.trim()));
        }
    }
}
