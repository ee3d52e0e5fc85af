//! Issue selection and batch processing.
//!
//! Issues are processed strictly one at a time: every run mutates the shared
//! working tree and git index, so there is no concurrency between issues.
//! Batch mode consults the persistent processed set; single-issue mode
//! bypasses it (the requested issue runs even if already processed) but still
//! records completion.

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::config::{Config, SubIssueStrategy};
use crate::core::types::RunStatus;
use crate::io::forge::{Forge, Issue};
use crate::io::model::ModelClient;
use crate::io::processed::ProcessedIssues;
use crate::pipeline::{run_issue, RunReport};
use crate::summary::print_summary;

/// Outcome of a batch or single-issue invocation.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub completed: u32,
    pub incomplete: u32,
}

impl BatchOutcome {
    pub fn all_complete(&self) -> bool {
        self.incomplete == 0
    }

    fn absorb(&mut self, status: RunStatus) {
        match status {
            RunStatus::Complete => self.completed += 1,
            RunStatus::Incomplete => self.incomplete += 1,
        }
    }
}

/// Process one specific issue, bypassing the processed set.
#[instrument(skip_all, fields(repo, issue_number))]
pub fn run_single(
    config: &Config,
    model: &dyn ModelClient,
    forge: &dyn Forge,
    repo: &str,
    issue_number: u64,
) -> Result<BatchOutcome> {
    let mut processed = ProcessedIssues::load(ProcessedIssues::default_path(&config.work_dir))?;
    let issue = forge
        .issue(repo, issue_number)
        .with_context(|| format!("fetch issue #{issue_number} from {repo}"))?;

    let mut outcome = BatchOutcome::default();
    process_one(config, model, forge, repo, &issue, &mut processed, &mut outcome)?;
    Ok(outcome)
}

/// Process up to `max_issues` unprocessed open issues.
#[instrument(skip_all, fields(repo, max_issues))]
pub fn run_batch(
    config: &Config,
    model: &dyn ModelClient,
    forge: &dyn Forge,
    repo: &str,
    max_issues: u32,
) -> Result<BatchOutcome> {
    let mut processed = ProcessedIssues::load(ProcessedIssues::default_path(&config.work_dir))?;
    let mut outcome = BatchOutcome::default();
    let mut handled = 0u32;

    while handled < max_issues {
        let Some(issue) = next_unprocessed(forge, repo, &processed)? else {
            info!("no more unprocessed issues");
            break;
        };
        if let Err(err) =
            process_one(config, model, forge, repo, &issue, &mut processed, &mut outcome)
        {
            // Mark anyway so a persistently failing issue cannot wedge the
            // batch loop forever.
            warn!(issue = issue.number, %err, "issue failed; marking processed");
            processed.mark(issue.number)?;
            outcome.incomplete += 1;
        }
        handled += 1;
    }
    Ok(outcome)
}

fn next_unprocessed(
    forge: &dyn Forge,
    repo: &str,
    processed: &ProcessedIssues,
) -> Result<Option<Issue>> {
    let open = forge.open_issues(repo).context("list open issues")?;
    Ok(open
        .into_iter()
        .find(|issue| !processed.contains(issue.number)))
}

/// Run one issue (and, depending on strategy, its sub-issues), emit the
/// summary, and update the processed set.
fn process_one(
    config: &Config,
    model: &dyn ModelClient,
    forge: &dyn Forge,
    repo: &str,
    issue: &Issue,
    processed: &mut ProcessedIssues,
    outcome: &mut BatchOutcome,
) -> Result<()> {
    let sub_issues = if config.process_sub_issues
        && config.sub_issue_strategy != SubIssueStrategy::Skip
    {
        forge.sub_issues(repo, issue.number).unwrap_or_else(|err| {
            warn!(issue = issue.number, %err, "sub-issue lookup failed");
            Vec::new()
        })
    } else {
        Vec::new()
    };

    let extra_context = match config.sub_issue_strategy {
        SubIssueStrategy::Include if !sub_issues.is_empty() => {
            Some(include_context(&sub_issues))
        }
        _ => None,
    };

    let report = run_issue(config, model, forge, repo, issue, extra_context.as_deref())?;
    finish_run(&report, processed)?;
    print_summary(config, &report);
    outcome.absorb(report.status);

    if config.sub_issue_strategy == SubIssueStrategy::Sequential {
        for sub_issue in &sub_issues {
            info!(parent = issue.number, sub = sub_issue.number, "processing sub-issue");
            let sub_report = run_issue(config, model, forge, repo, sub_issue, None)?;
            finish_run(&sub_report, processed)?;
            print_summary(config, &sub_report);
            outcome.absorb(sub_report.status);
        }
    }
    Ok(())
}

fn finish_run(report: &RunReport, processed: &mut ProcessedIssues) -> Result<()> {
    if report.status.is_complete() {
        processed.mark(report.issue_number)?;
    }
    Ok(())
}

/// Sub-issue context appended to the parent issue text under the `include`
/// strategy.
fn include_context(sub_issues: &[Issue]) -> String {
    let mut text = String::from(
        "## Sub-Issues\nThis issue has the following sub-issues to consider:\n\n",
    );
    for sub_issue in sub_issues {
        text.push_str(&format!("- **#{}**: {}\n", sub_issue.number, sub_issue.title));
        let body = sub_issue.body.trim();
        if !body.is_empty() {
            let head: String = body.chars().take(200).collect();
            text.push_str(&format!("  {head}\n"));
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(number: u64, title: &str, body: &str) -> Issue {
        Issue {
            number,
            title: title.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn include_context_lists_numbers_titles_and_body_heads() {
        let subs = vec![
            sub(2, "Add modal", "Modal must trap focus."),
            sub(3, "Add toast", ""),
        ];
        let text = include_context(&subs);
        assert!(text.contains("- **#2**: Add modal"));
        assert!(text.contains("  Modal must trap focus."));
        assert!(text.contains("- **#3**: Add toast"));
    }

    #[test]
    fn include_context_truncates_long_bodies() {
        let subs = vec![sub(2, "Big", &"x".repeat(500))];
        let text = include_context(&subs);
        assert!(text.contains(&"x".repeat(200)));
        assert!(!text.contains(&"x".repeat(201)));
    }

    #[test]
    fn batch_outcome_tracks_completion() {
        let mut outcome = BatchOutcome::default();
        outcome.absorb(RunStatus::Complete);
        outcome.absorb(RunStatus::Incomplete);
        assert_eq!(outcome.completed, 1);
        assert_eq!(outcome.incomplete, 1);
        assert!(!outcome.all_complete());
    }
}
