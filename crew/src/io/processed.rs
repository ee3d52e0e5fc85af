//! Persistent set of issue numbers that already completed a run.
//!
//! Consulted in batch mode to pick the next issue; bypassed (but still
//! updated) in single-issue mode. Writes are atomic (temp file + rename).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Issue numbers already handled, backed by `data/processed_issues.json`.
#[derive(Debug)]
pub struct ProcessedIssues {
    path: PathBuf,
    numbers: BTreeSet<u64>,
}

impl ProcessedIssues {
    /// Conventional location under a working directory.
    pub fn default_path(work_dir: &Path) -> PathBuf {
        work_dir.join("data").join("processed_issues.json")
    }

    /// Load the set, treating a missing file as empty.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let numbers = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str::<Vec<u64>>(&contents)
                .with_context(|| format!("parse {}", path.display()))?
                .into_iter()
                .collect()
        } else {
            BTreeSet::new()
        };
        debug!(count = numbers.len(), "processed issues loaded");
        Ok(Self { path, numbers })
    }

    pub fn contains(&self, number: u64) -> bool {
        self.numbers.contains(&number)
    }

    /// Record a processed issue and persist immediately.
    pub fn mark(&mut self, number: u64) -> Result<()> {
        if self.numbers.insert(number) {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .with_context(|| format!("no parent for {}", self.path.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;

        let list: Vec<u64> = self.numbers.iter().copied().collect();
        let mut buf = serde_json::to_string(&list).context("serialize processed issues")?;
        buf.push('\n');

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, buf).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}
