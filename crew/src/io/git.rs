//! Git adapter for the pipeline.
//!
//! Branch safety and commit truthfulness both hinge on git state, so the
//! wrapper stays small and explicit: every operation is a single subprocess
//! invocation with a per-call timeout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, instrument, warn};

use crate::io::process::{run_with_timeout, Captured};

const GIT_OUTPUT_LIMIT: usize = 4_000_000;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn is_repo(&self) -> bool {
        self.workdir.join(".git").exists()
    }

    /// Current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refusing to continue)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full HEAD SHA.
    pub fn head_sha(&self) -> Result<String> {
        Ok(self.capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Abbreviated HEAD SHA.
    pub fn head_short_sha(&self) -> Result<String> {
        Ok(self
            .capture(&["rev-parse", "--short", "HEAD"])?
            .trim()
            .to_string())
    }

    /// Parent SHA of a commit, if it has one.
    pub fn parent_sha(&self, sha: &str) -> Result<Option<String>> {
        let spec = format!("{sha}^");
        let out = self.run(&["rev-parse", &spec])?;
        if out.success() {
            Ok(Some(out.stdout_text().trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Paths with any uncommitted modification, excluding pipeline artifacts.
    pub fn changed_files(&self) -> Result<Vec<String>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .filter(|path| !is_pipeline_artifact(path))
            .collect())
    }

    pub fn has_changes(&self) -> Result<bool> {
        Ok(!self.changed_files()?.is_empty())
    }

    /// Whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let spec = format!("refs/heads/{branch}");
        Ok(self
            .run(&["show-ref", "--verify", "--quiet", &spec])?
            .status
            .success())
    }

    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.checked(&["checkout", branch])?;
        Ok(())
    }

    /// Stage every change except pipeline artifacts.
    pub fn add_changed(&self) -> Result<()> {
        for path in self.changed_files()? {
            self.checked(&["add", "--", &path])?;
        }
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!out.stdout_text().trim().is_empty())
    }

    /// Commit staged changes. Returns Ok(false) when nothing is staged.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Unified diff of the working tree against `base` (uncommitted changes
    /// included). The patch artifact is derived from here, never from agent
    /// text.
    pub fn diff_against(&self, base: &str) -> Result<String> {
        Ok(self.capture(&["diff", base])?)
    }

    /// Push the branch to origin with an upstream. Failures surface as errors
    /// for the caller to downgrade; the push timeout is the per-call timeout.
    #[instrument(skip_all, fields(branch))]
    pub fn push_branch(&self, branch: &str) -> Result<()> {
        let out = self.run(&["push", "-u", "origin", branch])?;
        if out.timed_out {
            return Err(anyhow!("git push timed out"));
        }
        if !out.success() {
            return Err(anyhow!("git push failed: {}", out.stderr_text().trim()));
        }
        Ok(())
    }

    /// First existing branch from `candidates`, in order.
    pub fn first_existing_branch(&self, candidates: &[String]) -> Result<Option<String>> {
        for branch in candidates {
            if self.branch_exists(branch)? {
                return Ok(Some(branch.clone()));
            }
        }
        Ok(None)
    }

    fn capture(&self, args: &[&str]) -> Result<String> {
        Ok(self.checked(args)?.stdout_text())
    }

    fn checked(&self, args: &[&str]) -> Result<Captured> {
        let out = self.run(args)?;
        if out.timed_out {
            return Err(anyhow!("git {} timed out", args.join(" ")));
        }
        if !out.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                out.stderr_text().trim()
            ));
        }
        Ok(out)
    }

    fn run(&self, args: &[&str]) -> Result<Captured> {
        run_with_timeout(
            "git",
            args,
            &self.workdir,
            None,
            self.timeout,
            GIT_OUTPUT_LIMIT,
        )
        .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Local artifacts the pipeline writes but never commits.
pub fn is_pipeline_artifact(path: &str) -> bool {
    path.ends_with("_patch.diff")
        || path.starts_with("implementations/")
        || path.starts_with("data/")
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, renamed)) = path.split_once("->") {
        path = renamed.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
