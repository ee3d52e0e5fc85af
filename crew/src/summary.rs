//! Two-section run summary.
//!
//! Section one covers the local implementation and testing; section two
//! covers git and board operations. Every claim is keyed to a boolean in
//! `RunState`; the emitter never reports success on assumption.

use crate::config::Config;
use crate::core::types::RunStatus;
use crate::pipeline::RunReport;

/// Print the run summary to stdout.
pub fn print_summary(config: &Config, report: &RunReport) {
    let state = &report.run_state;
    let rule = "=".repeat(70);

    println!("\n{rule}");
    println!(
        "LOCAL IMPLEMENTATION & TESTING - Issue #{}",
        report.issue_number
    );
    println!("{rule}");

    match report.status {
        RunStatus::Complete => {
            if state.applied_ok() {
                println!(
                    "applied: yes ({} file(s) changed)",
                    report.changed_files.len()
                );
                for file in &report.changed_files {
                    println!("  - {file}");
                }
            } else {
                println!("applied: no changes needed (tree already satisfied the plan)");
            }
        }
        RunStatus::Incomplete => {
            println!("applied: no (run incomplete)");
            if let Some(gate) = report.failed_gate {
                println!("failed gate: {}", gate.label());
            }
            let checklist = state.missing.checklist();
            if !checklist.is_empty() {
                println!("missing items:\n{checklist}");
            }
        }
    }
    if let Some(plan_path) = &report.plan_path {
        println!("plan file: {}", plan_path.display());
    }
    if let Some(patch_path) = &report.patch_path {
        println!("patch file: {}", patch_path.display());
    }
    println!("attempts: {}", report.attempts);

    println!("\n{rule}");
    println!("GIT / BOARD OPERATIONS - Issue #{}", report.issue_number);
    println!("{rule}");
    if let Some(branch) = &state.current_branch {
        println!("branch: {branch}");
    }
    if let Some(sha) = &state.head_sha_before {
        println!("head before: {sha}");
    }
    match (state.did_commit(), &state.head_sha_after) {
        (true, Some(sha)) => println!("committed: yes ({sha})"),
        (true, None) => println!("committed: yes"),
        (false, _) => println!("committed: no"),
    }
    if state.did_commit() {
        if state.did_push() {
            println!("pushed: yes");
        } else if config.auto_push {
            println!("pushed: no (push failed; run remains complete locally)");
        } else {
            println!("pushed: no (AUTO_PUSH disabled)");
        }
    }
    if config.move_in_pipeline {
        println!(
            "board: {}",
            if state.did_move_done() {
                format!("moved to '{}'", config.done_column)
            } else {
                "not moved to done".to_string()
            }
        );
    }

    if !state.errors().is_empty() {
        println!("\nwarnings/errors:");
        for error in state.errors() {
            println!("  - {error}");
        }
    }
    println!("{rule}\n");
}
