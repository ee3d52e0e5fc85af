//! The pipeline orchestrator: one issue, seven gates, bounded retries.
//!
//! Stage order is fixed: context gate, agent sequence, branch safety,
//! validate/apply, post-apply scan, coverage, requirements, then post-apply
//! actions (patch, commit, push, board). A gate failure between validation
//! and requirements rolls the tree back and re-invokes the developer with a
//! missing-item checklist, at most twice. Everything observable is keyed to
//! `RunState`; the orchestrator owns every mutation of it.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::agents::runner::{AgentRunner, PassOutcome, RetryOutputs};
use crate::agents::tester::{detect_test_command, run_tests};
use crate::agents::PromptInputs;
use crate::config::Config;
use crate::core::changes::{parse_change_set, ChangeSet};
use crate::core::plan::parse_plan_requirements;
use crate::core::requirements::{extract_requirements, unsatisfied_requirements, Requirement};
use crate::core::run_state::RunState;
use crate::core::types::{GateId, RunStatus};
use crate::io::allowlist::{PathAllowlist, FORBIDDEN_PREFIXES};
use crate::io::apply::{Applier, ApplyOutcome};
use crate::io::bundle::{bundle_context, BundleOptions};
use crate::io::coverage::check_coverage;
use crate::io::forge::{Forge, Issue};
use crate::io::git::Git;
use crate::io::model::ModelClient;
use crate::io::report::{write_plan_file, PlanReport};

/// Total developer passes per run (one initial plus two retries).
pub const MAX_ATTEMPTS: u32 = 3;

/// Base-branch preference for patch generation.
const BASE_BRANCHES: &[&str] = &["development", "main", "master"];

/// Name of the patch artifact written next to the working tree.
pub const PATCH_ARTIFACT: &str = "crew_patch.diff";

const REPO_KIND: &str = "static frontend web app (no backend)";

/// Outcome of one pipeline run, consumed by the summary emitter and batch
/// driver.
#[derive(Debug)]
pub struct RunReport {
    pub issue_number: u64,
    pub issue_title: String,
    pub status: RunStatus,
    pub failed_gate: Option<GateId>,
    pub attempts: u32,
    pub run_state: RunState,
    pub changed_files: Vec<String>,
    pub plan_path: Option<PathBuf>,
    pub patch_path: Option<PathBuf>,
}

impl RunReport {
    /// Incomplete run. `gate` is `None` for failures outside the cascade
    /// (agent transport exhaustion), which must never be reported as a gate.
    fn incomplete(issue: &Issue, gate: Option<GateId>, attempts: u32, run_state: RunState) -> Self {
        Self {
            issue_number: issue.number,
            issue_title: issue.title.clone(),
            status: RunStatus::Incomplete,
            failed_gate: gate,
            attempts,
            run_state,
            changed_files: Vec::new(),
            plan_path: None,
            patch_path: None,
        }
    }
}

/// Result of one developer attempt against the gate cascade.
enum AttemptOutcome {
    Passed {
        parsed: ChangeSet,
        applied: ApplyOutcome,
    },
    Failed(GateId),
}

/// Run the full pipeline for one issue.
///
/// `extra_context` carries concatenated sub-issue context under the
/// `include` strategy. Returns `Err` only for fatal configuration problems
/// (unusable working tree, branch safety failure); every gate failure ends in
/// an orderly `Incomplete` report.
#[instrument(skip_all, fields(issue = issue.number))]
pub fn run_issue(
    config: &Config,
    model: &dyn ModelClient,
    forge: &dyn Forge,
    repo: &str,
    issue: &Issue,
    extra_context: Option<&str>,
) -> Result<RunReport> {
    let work_dir = config.work_dir.as_path();
    let mut run_state = RunState::new();

    info!(title = %issue.title, "processing issue");
    if config.move_in_pipeline {
        if let Err(err) = forge.move_issue(repo, issue.number, &config.in_progress_column) {
            warn!(%err, "board move to in-progress failed");
        }
    }

    // Gate 1: canonical files must be present and non-empty before any agent
    // runs. Fatal manifest errors are a misconfigured tree, not retryable.
    let allowlist = PathAllowlist::build(work_dir);
    let bundle = bundle_context(work_dir, &allowlist, &bundle_options(config))?;
    if bundle.manifest.is_fatal() {
        run_state.record_errors(bundle.manifest.fatal_errors.clone());
        run_state.missing.required_files = bundle.manifest.fatal_errors.clone();
        run_state.missing.set_failure(
            "context_gate_failed",
            format!(
                "{} required file problem(s); no agent was invoked",
                bundle.manifest.fatal_errors.len()
            ),
        );
        return Ok(RunReport::incomplete(
            issue,
            Some(GateId::Context),
            0,
            run_state,
        ));
    }

    let requirements = extract_requirements(&issue.title, &issue.body);
    let issue_text = match extra_context {
        Some(extra) if !extra.trim().is_empty() => {
            format!("{}\n\n{}", issue.as_prompt_text(), extra.trim())
        }
        _ => issue.as_prompt_text(),
    };
    let preview = allowlist.preview(&config.canonical_files, 20);
    let inputs = PromptInputs {
        issue_text: &issue_text,
        context: &bundle.context_text,
        requirements: &requirements,
        allowlist_preview: &preview,
        canonical_files: &config.canonical_files,
        forbidden_prefixes: FORBIDDEN_PREFIXES,
        repo_kind: REPO_KIND,
    };

    let runner = AgentRunner::with_backoff(model, config.transport_backoff);
    let first_pass = match runner.run_first_pass(&inputs) {
        Ok(outcome) => outcome,
        // Transport exhaustion is not a gate failure: the error names the
        // stage that gave out, and no gate is claimed.
        Err(err) => {
            run_state.record_error(format!("{err:#}"));
            run_state
                .missing
                .set_failure("agent_transport_failed", format!("{err}"));
            return Ok(RunReport::incomplete(issue, None, 0, run_state));
        }
    };

    // Gate 2: the auditor must confirm the context before any write.
    let mut outputs = match first_pass {
        PassOutcome::Completed(outputs) => *outputs,
        PassOutcome::AuditBlocked {
            product,
            audit_raw,
            problems,
        } => {
            run_state.record_errors(problems.iter().cloned());
            run_state.missing.validation_errors = problems.clone();
            run_state.missing.set_failure(
                "context_audit_failed",
                format!("context audit reported {} problem(s)", problems.len()),
            );
            let mut report =
                RunReport::incomplete(issue, Some(GateId::ContextAudit), 0, run_state);
            let plan_path = write_plan(
                work_dir,
                issue,
                &report,
                Some(&product),
                Some(&audit_raw),
                None,
                None,
                None,
                None,
                None,
            );
            report.plan_path = plan_path;
            return Ok(report);
        }
    };

    // Branch safety: no write while on a protected branch. Failures here are
    // fatal configuration errors, not gate failures.
    let git = Git::new(work_dir, config.git_timeout);
    if !git.is_repo() {
        return Err(anyhow!(
            "working directory {} is not a git repository",
            work_dir.display()
        ));
    }
    let branch = ensure_feature_branch(&git, config, issue.number, &mut run_state)?;
    run_state.head_sha_before = Some(git.head_sha().context("read HEAD before apply")?);

    let canonical = config.canonical_files.clone();
    let applier = Applier::new(work_dir, &allowlist, &canonical);
    let script_files = files_with_extension(&canonical, ".js");
    let styles_files = files_with_extension(&canonical, ".css");

    let mut attempts = 0u32;
    let mut parsed_record: Option<ChangeSet> = None;
    let mut applied_record: Option<ApplyOutcome> = None;
    let mut final_gate: Option<GateId> = None;

    loop {
        attempts += 1;
        run_state.missing.clear_for_retry();
        debug!(attempt = attempts, "evaluating attempt");

        // Gate 3: the reviewer verdict blocks application outright; review
        // failures are not retried with a checklist, they end the run.
        if !outputs.review.pass {
            run_state
                .missing
                .unsatisfied_requirements
                .extend(outputs.review.failed_requirements.iter().cloned());
            run_state
                .missing
                .validation_errors
                .extend(outputs.review.failed_integration_checks.iter().cloned());
            run_state.record_error(format!(
                "review gate failed: {}",
                summarize(&outputs.review.notes)
            ));
            run_state
                .missing
                .set_failure("review_failed", "reviewer rejected the change set".to_string());
            final_gate = Some(GateId::Review);
            break;
        }

        let attempt = evaluate_attempt(
            &applier,
            work_dir,
            &outputs.plan,
            &outputs.changes_raw,
            &requirements,
            &script_files,
            &styles_files,
            &mut run_state,
        )?;

        match attempt {
            AttemptOutcome::Passed { parsed, applied } => {
                parsed_record = Some(parsed);
                applied_record = Some(applied);
                break;
            }
            AttemptOutcome::Failed(gate) => {
                info!(gate = gate.label(), attempt = attempts, "gate failed");
                if attempts >= MAX_ATTEMPTS || !gate.is_retryable() {
                    final_gate = Some(gate);
                    break;
                }
                let checklist = run_state.missing.checklist();
                match runner.run_retry_pass(&inputs, &outputs.plan, &checklist) {
                    Ok(RetryOutputs {
                        changes_raw,
                        review_raw,
                        review,
                    }) => {
                        outputs.changes_raw = changes_raw;
                        outputs.review_raw = review_raw;
                        outputs.review = review;
                    }
                    Err(err) => {
                        run_state.record_error(format!("retry stage failed: {err:#}"));
                        final_gate = Some(gate);
                        break;
                    }
                }
            }
        }
    }

    let changes_json = parsed_record
        .as_ref()
        .and_then(|set| serde_json::to_string_pretty(set).ok());

    if let Some(gate) = final_gate {
        let mut report = RunReport::incomplete(issue, Some(gate), attempts, run_state);
        let plan_path = write_plan(
            work_dir,
            issue,
            &report,
            Some(&outputs.product),
            Some(&outputs.audit_raw),
            Some(&outputs.plan),
            changes_json,
            Some(&outputs.review_raw),
            None,
            None,
        );
        report.plan_path = plan_path;
        return Ok(report);
    }

    // All seven gates passed.
    run_state.mark_coverage_ok();
    let applied = applied_record.expect("passed attempt recorded an application");
    let git_changed = git.changed_files().context("read git status after apply")?;
    if !applied.changed_files.is_empty() && !git_changed.is_empty() {
        run_state.mark_applied();
    }

    // Patch before commit, from the git tree, never from agent text.
    let mut patch_path = None;
    let mut patch_text = None;
    if run_state.applied_ok() {
        let base = git
            .first_existing_branch(&base_branch_candidates())?
            .unwrap_or_else(|| run_state.head_sha_before.clone().expect("head recorded"));
        let patch = git.diff_against(&base).context("generate patch")?;
        if !patch.trim().is_empty() {
            let path = work_dir.join(PATCH_ARTIFACT);
            std::fs::write(&path, &patch)
                .with_context(|| format!("write {}", path.display()))?;
            patch_path = Some(path);
            patch_text = Some(patch);
        }
    }

    // Tester consumes the post-apply tree; its report never gates the run.
    let mut test_report = None;
    if config.enable_testing && run_state.applied_ok() {
        match detect_test_command(work_dir) {
            Some(command) => match run_tests(work_dir, &command, config.git_timeout) {
                Ok(report) => test_report = Some(report),
                Err(err) => warn!(%err, "test execution failed"),
            },
            None => debug!("no test command detected; skipping tester"),
        }
    }

    if run_state.applied_ok() {
        git.add_changed().context("stage changes")?;
        if git
            .commit_staged(&commit_message(issue))
            .context("commit changes")?
        {
            run_state.mark_committed();
            run_state.head_sha_after = Some(git.head_sha().context("read HEAD after commit")?);
        }
    }

    // Push failures leave the run complete; the summary reports the truth.
    if config.auto_push && run_state.did_commit() {
        match git.push_branch(&branch) {
            Ok(()) => run_state.mark_pushed(),
            Err(err) => {
                warn!(%err, "push failed; run stays complete locally");
                run_state.record_error(format!("push failed: {err}"));
            }
        }
    }

    if config.move_in_pipeline {
        match forge.move_issue(repo, issue.number, &config.done_column) {
            Ok(()) => run_state.mark_moved_done(),
            Err(err) => warn!(%err, "board move to done failed"),
        }
    }

    let mut report = RunReport {
        issue_number: issue.number,
        issue_title: issue.title.clone(),
        status: RunStatus::Complete,
        failed_gate: None,
        attempts,
        run_state,
        changed_files: applied.changed_files,
        plan_path: None,
        patch_path,
    };
    let plan_path = write_plan(
        work_dir,
        issue,
        &report,
        Some(&outputs.product),
        Some(&outputs.audit_raw),
        Some(&outputs.plan),
        changes_json,
        Some(&outputs.review_raw),
        test_report.as_deref(),
        patch_text.as_deref(),
    );
    report.plan_path = plan_path;
    info!(issue = issue.number, "run complete");
    Ok(report)
}

/// Gates 4 through 7 for one developer attempt. Missing items land in
/// `run_state.missing`; the tree is left unmodified whenever a gate fails.
#[allow(clippy::too_many_arguments)]
fn evaluate_attempt(
    applier: &Applier<'_>,
    work_dir: &Path,
    plan: &str,
    changes_raw: &str,
    requirements: &[Requirement],
    script_files: &[String],
    styles_files: &[String],
    run_state: &mut RunState,
) -> Result<AttemptOutcome> {
    // Gate 4: schema, path safety, diff markers, placeholders.
    let parsed = match parse_change_set(changes_raw) {
        Ok(parsed) => parsed,
        Err(errors) => {
            fail_validation(run_state, errors, "parse_failed");
            return Ok(AttemptOutcome::Failed(GateId::Validation));
        }
    };
    let validation_errors = applier.validate(&parsed);
    if !validation_errors.is_empty() {
        fail_validation(run_state, validation_errors, "validation_failed");
        return Ok(AttemptOutcome::Failed(GateId::Validation));
    }

    let applied = applier.apply(&parsed).context("apply change set")?;
    if !applied.succeeded() {
        fail_validation(run_state, applied.errors.clone(), "apply_failed");
        return Ok(AttemptOutcome::Failed(GateId::Validation));
    }

    // Gate 5: no placeholders may survive in written files.
    let placeholder_hits = applier.scan_written_files(&applied.changed_files);
    if !placeholder_hits.is_empty() {
        applier.rollback(&applied).context("roll back attempt")?;
        fail_validation(run_state, placeholder_hits, "post_apply_scan_failed");
        return Ok(AttemptOutcome::Failed(GateId::PostApply));
    }

    // Gate 6: the tree must contain what the plan promised.
    let plan_requirements = parse_plan_requirements(plan);
    let coverage = check_coverage(&plan_requirements, work_dir, script_files, styles_files);
    if !coverage.is_complete() {
        applier.rollback(&applied).context("roll back attempt")?;
        run_state.missing.functions = coverage.missing_functions;
        run_state.missing.css_selectors = coverage.missing_css_selectors;
        run_state.missing.test_files = coverage.missing_test_files;
        run_state.missing.required_files = coverage.missing_required_files;
        run_state
            .missing
            .set_failure("coverage_failed", "plan requirements missing from tree".to_string());
        run_state.record_error("coverage gate failed".to_string());
        return Ok(AttemptOutcome::Failed(GateId::Coverage));
    }

    // Gate 7: every acceptance criterion must be addressed.
    let mut corpus = plan.to_string();
    for rel in &applied.changed_files {
        if let Ok(contents) = std::fs::read_to_string(work_dir.join(rel)) {
            corpus.push('\n');
            corpus.push_str(&contents);
        }
    }
    let unsatisfied = unsatisfied_requirements(requirements, &corpus);
    if !unsatisfied.is_empty() {
        applier.rollback(&applied).context("roll back attempt")?;
        run_state.missing.unsatisfied_requirements = unsatisfied;
        run_state.missing.set_failure(
            "requirements_failed",
            "acceptance criteria not demonstrably satisfied".to_string(),
        );
        run_state.record_error("requirements gate failed".to_string());
        return Ok(AttemptOutcome::Failed(GateId::Requirements));
    }

    Ok(AttemptOutcome::Passed { parsed, applied })
}

fn fail_validation(run_state: &mut RunState, errors: Vec<String>, reason: &str) {
    run_state.record_errors(errors.iter().cloned());
    run_state.missing.validation_errors.extend(errors);
    run_state.missing.set_failure(
        reason,
        format!(
            "{} validation error(s); changes not kept",
            run_state.missing.validation_errors.len()
        ),
    );
}

/// Move off protected branches before any write. Checkout failure aborts the
/// run as a fatal configuration error.
fn ensure_feature_branch(
    git: &Git,
    config: &Config,
    issue_number: u64,
    run_state: &mut RunState,
) -> Result<String> {
    let current = git.current_branch().context("determine current branch")?;
    run_state.current_branch = Some(current.clone());

    if !config.protected_branches.iter().any(|b| b == &current) {
        return Ok(current);
    }

    if git.has_changes().context("check working tree")? {
        return Err(anyhow!(
            "uncommitted changes on protected branch '{current}'; commit or stash them first"
        ));
    }

    let feature = format!("feature/issue-{issue_number}");
    if git.branch_exists(&feature)? {
        git.checkout_branch(&feature)
            .with_context(|| format!("checkout {feature}"))?;
    } else {
        git.checkout_new_branch(&feature)
            .with_context(|| format!("create {feature}"))?;
    }
    let now = git.current_branch()?;
    if now != feature {
        return Err(anyhow!(
            "branch checkout failed: expected '{feature}', got '{now}'"
        ));
    }
    info!(branch = %feature, "switched off protected branch");
    run_state.current_branch = Some(feature.clone());
    Ok(feature)
}

fn commit_message(issue: &Issue) -> String {
    format!(
        "feat: implement solution for issue #{}: {}\n\nCloses #{}",
        issue.number, issue.title, issue.number
    )
}

fn bundle_options(config: &Config) -> BundleOptions {
    BundleOptions {
        canonical_files: config.canonical_files.clone(),
        ..BundleOptions::default()
    }
}

fn base_branch_candidates() -> Vec<String> {
    BASE_BRANCHES.iter().map(|b| b.to_string()).collect()
}

fn files_with_extension(canonical: &[String], extension: &str) -> Vec<String> {
    canonical
        .iter()
        .filter(|path| path.ends_with(extension))
        .cloned()
        .collect()
}

fn summarize(notes: &str) -> String {
    let trimmed = notes.trim();
    if trimmed.is_empty() {
        "no notes".to_string()
    } else {
        trimmed.chars().take(120).collect()
    }
}

#[allow(clippy::too_many_arguments)]
fn write_plan(
    work_dir: &Path,
    issue: &Issue,
    report: &RunReport,
    product: Option<&str>,
    audit_raw: Option<&str>,
    plan: Option<&str>,
    changes_json: Option<String>,
    review_raw: Option<&str>,
    test_report: Option<&str>,
    patch: Option<&str>,
) -> Option<PathBuf> {
    let plan_report = PlanReport {
        issue_number: issue.number,
        issue_title: &issue.title,
        status: report.status,
        attempts: report.attempts,
        product,
        audit_raw,
        plan,
        changes_json,
        review_raw,
        run_state: &report.run_state,
        patch,
        test_report,
    };
    match write_plan_file(work_dir, &plan_report) {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(%err, "plan file could not be written");
            None
        }
    }
}
