//! Sequential agent driver.
//!
//! Stages run strictly in order because each consumes the previous stage's
//! text verbatim: product manager, context auditor, architect, developer,
//! reviewer. The runner owns per-stage transport retries; gate decisions on
//! the parsed outputs belong to the orchestrator, except the audit gate,
//! which blocks here before any later agent spends tokens.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::agents::{
    AgentSpec, PromptEngine, PromptInputs, ARCHITECT, CONTEXT_AUDITOR, DEVELOPER,
    PRODUCT_MANAGER, REVIEWER,
};
use crate::core::verdict::{
    parse_context_audit, parse_review_verdict, ContextAudit, ReviewVerdict,
};
use crate::io::model::ModelClient;

/// Transport retries per stage, beyond the first attempt.
const TRANSPORT_RETRIES: u32 = 2;
/// Base backoff between transport retries; doubles per attempt.
const TRANSPORT_BACKOFF: Duration = Duration::from_secs(5);

/// Raw and parsed outputs of a completed first pass.
#[derive(Debug, Clone)]
pub struct AgentOutputs {
    pub product: String,
    pub audit_raw: String,
    pub audit: ContextAudit,
    pub plan: String,
    pub changes_raw: String,
    pub review_raw: String,
    pub review: ReviewVerdict,
}

/// Outputs of one retry pass (developer and reviewer only).
#[derive(Debug, Clone)]
pub struct RetryOutputs {
    pub changes_raw: String,
    pub review_raw: String,
    pub review: ReviewVerdict,
}

/// Result of the first agent pass.
#[derive(Debug, Clone)]
pub enum PassOutcome {
    /// All five stages produced output; the reviewer verdict may still fail
    /// the review gate.
    Completed(Box<AgentOutputs>),
    /// The context audit blocked the run before any file-writing stage.
    AuditBlocked {
        product: String,
        audit_raw: String,
        problems: Vec<String>,
    },
}

/// Drives the agent sequence over a [`ModelClient`].
pub struct AgentRunner<'a> {
    model: &'a dyn ModelClient,
    engine: PromptEngine,
    backoff: Duration,
}

impl<'a> AgentRunner<'a> {
    pub fn new(model: &'a dyn ModelClient) -> Self {
        Self::with_backoff(model, TRANSPORT_BACKOFF)
    }

    /// Explicit base backoff between transport retries.
    pub fn with_backoff(model: &'a dyn ModelClient, backoff: Duration) -> Self {
        Self {
            model,
            engine: PromptEngine::new(),
            backoff,
        }
    }

    /// Zero backoff between transport retries; used by tests.
    pub fn without_backoff(model: &'a dyn ModelClient) -> Self {
        Self::with_backoff(model, Duration::ZERO)
    }

    /// Run PM, auditor, architect, developer, and reviewer in order.
    #[instrument(skip_all)]
    pub fn run_first_pass(&self, inputs: &PromptInputs<'_>) -> Result<PassOutcome> {
        let product = self.invoke_stage(&PRODUCT_MANAGER, &self.engine.render_product(inputs))?;

        let audit_raw =
            self.invoke_stage(&CONTEXT_AUDITOR, &self.engine.render_auditor(inputs))?;
        let audit = match parse_context_audit(&audit_raw) {
            Ok(audit) => {
                if !audit.is_clean() {
                    let mut problems: Vec<String> =
                        audit.missing.iter().cloned().collect();
                    problems.extend(
                        audit
                            .absent_canonical_files()
                            .iter()
                            .map(|path| format!("canonical file not confirmed: {path}")),
                    );
                    info!(problems = problems.len(), "context audit blocked the run");
                    return Ok(PassOutcome::AuditBlocked {
                        product,
                        audit_raw,
                        problems,
                    });
                }
                audit
            }
            Err(errors) => {
                warn!(errors = errors.len(), "context audit output unparseable");
                return Ok(PassOutcome::AuditBlocked {
                    product,
                    audit_raw,
                    problems: errors,
                });
            }
        };

        let plan = self.invoke_stage(
            &ARCHITECT,
            &self.engine.render_architect(inputs, &product, &audit_raw),
        )?;

        let changes_raw = self.invoke_stage(
            &DEVELOPER,
            &self.engine.render_developer(inputs, &plan, None),
        )?;

        let (review_raw, review) = self.review_stage(inputs, &plan, &changes_raw)?;

        Ok(PassOutcome::Completed(Box::new(AgentOutputs {
            product,
            audit_raw,
            audit,
            plan,
            changes_raw,
            review_raw,
            review,
        })))
    }

    /// Re-run developer and reviewer with the missing-item checklist.
    #[instrument(skip_all)]
    pub fn run_retry_pass(
        &self,
        inputs: &PromptInputs<'_>,
        plan: &str,
        checklist: &str,
    ) -> Result<RetryOutputs> {
        let changes_raw = self.invoke_stage(
            &DEVELOPER,
            &self.engine.render_developer(inputs, plan, Some(checklist)),
        )?;
        let (review_raw, review) = self.review_stage(inputs, plan, &changes_raw)?;
        Ok(RetryOutputs {
            changes_raw,
            review_raw,
            review,
        })
    }

    fn review_stage(
        &self,
        inputs: &PromptInputs<'_>,
        plan: &str,
        changes_raw: &str,
    ) -> Result<(String, ReviewVerdict)> {
        let review_raw = self.invoke_stage(
            &REVIEWER,
            &self.engine.render_reviewer(inputs, plan, changes_raw),
        )?;
        let review = match parse_review_verdict(&review_raw) {
            Ok(verdict) => verdict,
            // An unparseable verdict cannot approve anything.
            Err(errors) => ReviewVerdict {
                pass: false,
                failed_requirements: Vec::new(),
                failed_integration_checks: errors,
                notes: "reviewer output was not valid verdict JSON".to_string(),
            },
        };
        Ok((review_raw, review))
    }

    fn invoke_stage(&self, spec: &AgentSpec, user_prompt: &str) -> Result<String> {
        let system = spec.system_prompt();
        let mut attempt = 0u32;
        loop {
            match self.model.invoke(&system, user_prompt) {
                Ok(text) => {
                    info!(role = spec.role, chars = text.len(), "stage completed");
                    return Ok(text);
                }
                Err(err) if attempt < TRANSPORT_RETRIES => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt);
                    warn!(role = spec.role, attempt, %err, "stage transport failure; backing off");
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("{} stage failed after {attempt} retries", spec.role)
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::requirements::Requirement;
    use crate::test_support::{clean_audit_json, passing_review_json, ScriptedModel};

    fn inputs<'a>(
        requirements: &'a [Requirement],
        allowlist: &'a [String],
        canonical: &'a [String],
    ) -> PromptInputs<'a> {
        PromptInputs {
            issue_text: "# Add clear button",
            context: "### app.js\n```\nfunction init() {}\n```",
            requirements,
            allowlist_preview: allowlist,
            canonical_files: canonical,
            forbidden_prefixes: crate::io::allowlist::FORBIDDEN_PREFIXES,
            repo_kind: "static frontend web app",
        }
    }

    fn fixture() -> (Vec<Requirement>, Vec<String>, Vec<String>) {
        (
            Vec::new(),
            vec!["app.js".to_string()],
            vec!["app.js".to_string()],
        )
    }

    #[test]
    fn first_pass_runs_all_five_stages_in_order() {
        let (reqs, allow, canon) = fixture();
        let model = ScriptedModel::new([
            "user story".to_string(),
            clean_audit_json(),
            "plan".to_string(),
            r#"{"changes": []}"#.to_string(),
            passing_review_json(),
        ]);
        let runner = AgentRunner::without_backoff(&model);

        let outcome = runner
            .run_first_pass(&inputs(&reqs, &allow, &canon))
            .expect("pass");
        let PassOutcome::Completed(outputs) = outcome else {
            panic!("expected completed pass");
        };
        assert_eq!(outputs.product, "user story");
        assert_eq!(outputs.plan, "plan");
        assert!(outputs.review.pass);

        let roles = model.invocations();
        assert_eq!(roles.len(), 5);
        assert!(roles[0].contains("Product Manager"));
        assert!(roles[1].contains("Context Auditor"));
        assert!(roles[2].contains("Software Architect"));
        assert!(roles[3].contains("Developer"));
        assert!(roles[4].contains("Code Reviewer"));
    }

    #[test]
    fn dirty_audit_blocks_before_architect_runs() {
        let (reqs, allow, canon) = fixture();
        let model = ScriptedModel::new([
            "user story".to_string(),
            r##"{"canonical_files_present": {"app.js": true}, "missing": ["#saveButton"]}"##
                .to_string(),
        ]);
        let runner = AgentRunner::without_backoff(&model);

        let outcome = runner
            .run_first_pass(&inputs(&reqs, &allow, &canon))
            .expect("pass");
        let PassOutcome::AuditBlocked { problems, .. } = outcome else {
            panic!("expected audit block");
        };
        assert_eq!(problems, ["#saveButton"]);
        // Only PM and auditor were invoked.
        assert_eq!(model.invocations().len(), 2);
    }

    #[test]
    fn unparseable_audit_blocks_with_parse_errors() {
        let (reqs, allow, canon) = fixture();
        let model = ScriptedModel::new(["user story".to_string(), "not json".to_string()]);
        let runner = AgentRunner::without_backoff(&model);

        let outcome = runner
            .run_first_pass(&inputs(&reqs, &allow, &canon))
            .expect("pass");
        let PassOutcome::AuditBlocked { problems, .. } = outcome else {
            panic!("expected audit block");
        };
        assert!(problems[0].contains("no context audit JSON"));
    }

    #[test]
    fn unparseable_review_fails_the_verdict() {
        let (reqs, allow, canon) = fixture();
        let model = ScriptedModel::new([
            "user story".to_string(),
            clean_audit_json(),
            "plan".to_string(),
            r#"{"changes": []}"#.to_string(),
            "looks fine to me".to_string(),
        ]);
        let runner = AgentRunner::without_backoff(&model);

        let PassOutcome::Completed(outputs) = runner
            .run_first_pass(&inputs(&reqs, &allow, &canon))
            .expect("pass")
        else {
            panic!("expected completed pass");
        };
        assert!(!outputs.review.pass);
        assert!(!outputs.review.failed_integration_checks.is_empty());
    }

    #[test]
    fn transport_errors_are_retried_within_the_bound() {
        let (reqs, allow, canon) = fixture();
        let model = ScriptedModel::with_outcomes(vec![
            Err("connection reset".to_string()),
            Err("connection reset".to_string()),
            Ok("user story".to_string()),
            Ok(clean_audit_json()),
            Ok("plan".to_string()),
            Ok(r#"{"changes": []}"#.to_string()),
            Ok(passing_review_json()),
        ]);
        let runner = AgentRunner::without_backoff(&model);

        let outcome = runner
            .run_first_pass(&inputs(&reqs, &allow, &canon))
            .expect("pass");
        assert!(matches!(outcome, PassOutcome::Completed(_)));
        // Two failures plus five successes.
        assert_eq!(model.invocations().len(), 7);
    }

    #[test]
    fn transport_exhaustion_fails_the_stage() {
        let (reqs, allow, canon) = fixture();
        let model = ScriptedModel::with_outcomes(vec![
            Err("down".to_string()),
            Err("down".to_string()),
            Err("down".to_string()),
        ]);
        let runner = AgentRunner::without_backoff(&model);

        let err = runner
            .run_first_pass(&inputs(&reqs, &allow, &canon))
            .unwrap_err();
        assert!(err.to_string().contains("Product Manager stage failed"));
        assert_eq!(model.invocations().len(), 3);
    }

    #[test]
    fn retry_pass_reinvokes_developer_and_reviewer_only() {
        let (reqs, allow, canon) = fixture();
        let model = ScriptedModel::new([
            r#"{"changes": []}"#.to_string(),
            passing_review_json(),
        ]);
        let runner = AgentRunner::without_backoff(&model);

        let retry = runner
            .run_retry_pass(
                &inputs(&reqs, &allow, &canon),
                "plan",
                "- Missing functions: handleClear",
            )
            .expect("retry");
        assert!(retry.review.pass);
        assert_eq!(model.count_role("Developer"), 1);
        assert_eq!(model.count_role("Code Reviewer"), 1);
        assert_eq!(model.invocations().len(), 2);
    }
}
