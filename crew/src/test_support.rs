//! Test-only helpers: temporary git repositories and scripted backends.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tempfile::TempDir;

use crate::config::{Config, ModelProvider, SubIssueStrategy};
use crate::io::forge::{Forge, Issue};
use crate::io::git::Git;
use crate::io::model::ModelClient;

/// Temporary git repository seeded with the reference canonical files.
pub struct TestRepo {
    temp: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let repo = Self::bare();
        repo.seed_canonical_files();
        repo.commit_all("chore: seed canonical files");
        repo
    }

    /// Initialized git repository with a single README commit on `main` and
    /// no canonical files.
    pub fn bare() -> Self {
        let temp = TempDir::new().expect("tempdir");
        let repo = Self { temp };
        repo.run_git(&["init", "-b", "main"]);
        repo.run_git(&["config", "user.email", "test@example.com"]);
        repo.run_git(&["config", "user.name", "test"]);
        std::fs::write(repo.root().join("README.md"), "# test app\n").expect("write README");
        repo.commit_all("chore: init");
        repo
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.root(), Duration::from_secs(30))
    }

    pub fn seed_canonical_files(&self) {
        self.write(
            "index.html",
            "<!doctype html>\n<html>\n<body>\n<header></header>\n<main id=\"sessions\"></main>\n<script src=\"app.js\"></script>\n</body>\n</html>\n",
        );
        self.write(
            "app.js",
            "// session tracker\nfunction init() {\n  render();\n}\n\nfunction render() {\n  document.title = 'sessions';\n}\n",
        );
        self.write(
            "styles.css",
            ".header {\n  display: flex;\n}\n\n.session-row {\n  padding: 4px;\n}\n",
        );
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(path, contents).expect("write file");
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.root().join(rel)).expect("read file")
    }

    pub fn commit_all(&self, message: &str) {
        self.run_git(&["add", "-A"]);
        self.run_git(&["commit", "-m", message, "--allow-empty"]);
    }

    fn run_git(&self, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .expect("run git");
        assert!(
            status.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&status.stderr)
        );
    }
}

/// Model client that replays scripted responses in order.
///
/// Running out of responses is an error, which doubles as a guard against
/// unexpected extra agent invocations.
pub struct ScriptedModel {
    responses: RefCell<VecDeque<Result<String, String>>>,
    invocations: RefCell<Vec<(String, String)>>,
}

impl ScriptedModel {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: RefCell::new(responses.into_iter().map(|s| Ok(s.into())).collect()),
            invocations: RefCell::new(Vec::new()),
        }
    }

    /// Scripted sequence mixing successes and transport errors.
    pub fn with_outcomes(outcomes: Vec<Result<String, String>>) -> Self {
        Self {
            responses: RefCell::new(outcomes.into()),
            invocations: RefCell::new(Vec::new()),
        }
    }

    /// System prompts seen so far, in order.
    pub fn invocations(&self) -> Vec<String> {
        self.invocations
            .borrow()
            .iter()
            .map(|(system, _)| system.clone())
            .collect()
    }

    /// User prompts seen so far, in order.
    pub fn user_prompts(&self) -> Vec<String> {
        self.invocations
            .borrow()
            .iter()
            .map(|(_, user)| user.clone())
            .collect()
    }

    /// Invocations whose system prompt mentions `role`.
    pub fn count_role(&self, role: &str) -> usize {
        self.invocations
            .borrow()
            .iter()
            .filter(|(system, _)| system.contains(role))
            .count()
    }
}

impl ModelClient for ScriptedModel {
    fn invoke(&self, system: &str, user: &str) -> Result<String> {
        self.invocations
            .borrow_mut()
            .push((system.to_string(), user.to_string()));
        match self.responses.borrow_mut().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted model exhausted")),
        }
    }

    fn describe(&self) -> String {
        "scripted model".to_string()
    }
}

/// Forge fake with canned issues and recorded board moves.
#[derive(Default)]
pub struct ScriptedForge {
    issues: BTreeMap<u64, Issue>,
    subs: BTreeMap<u64, Vec<u64>>,
    moves: RefCell<Vec<(u64, String)>>,
    fail_moves: bool,
}

impl ScriptedForge {
    pub fn new(issues: Vec<Issue>) -> Self {
        Self {
            issues: issues.into_iter().map(|i| (i.number, i)).collect(),
            ..Self::default()
        }
    }

    pub fn with_sub_issues(mut self, parent: u64, children: Vec<u64>) -> Self {
        self.subs.insert(parent, children);
        self
    }

    pub fn failing_board(mut self) -> Self {
        self.fail_moves = true;
        self
    }

    pub fn moves(&self) -> Vec<(u64, String)> {
        self.moves.borrow().clone()
    }
}

impl Forge for ScriptedForge {
    fn issue(&self, _repo: &str, number: u64) -> Result<Issue> {
        self.issues
            .get(&number)
            .cloned()
            .ok_or_else(|| anyhow!("issue #{number} not found"))
    }

    fn open_issues(&self, _repo: &str) -> Result<Vec<Issue>> {
        Ok(self.issues.values().cloned().collect())
    }

    fn sub_issues(&self, repo: &str, number: u64) -> Result<Vec<Issue>> {
        let mut subs = Vec::new();
        for child in self.subs.get(&number).cloned().unwrap_or_default() {
            subs.push(self.issue(repo, child)?);
        }
        Ok(subs)
    }

    fn move_issue(&self, _repo: &str, number: u64, column: &str) -> Result<()> {
        if self.fail_moves {
            return Err(anyhow!("board unavailable"));
        }
        self.moves.borrow_mut().push((number, column.to_string()));
        Ok(())
    }
}

/// Pipeline configuration pointed at a test repository. Board moves are on
/// (ScriptedForge records them); pushing and testing are off.
pub fn test_config(work_dir: &Path) -> Config {
    Config {
        forge_token: "test-token".to_string(),
        default_repo: None,
        work_dir: work_dir.to_path_buf(),
        provider: ModelProvider::Local {
            base_url: "http://localhost:11434".to_string(),
            model: "test-model".to_string(),
        },
        model_timeout: Duration::from_secs(60),
        transport_backoff: Duration::ZERO,
        git_timeout: Duration::from_secs(30),
        forge_timeout: Duration::from_secs(5),
        auto_push: false,
        move_in_pipeline: true,
        in_progress_column: "In Progress".to_string(),
        done_column: "Done".to_string(),
        process_sub_issues: false,
        sub_issue_strategy: SubIssueStrategy::Include,
        enable_testing: false,
        canonical_files: vec![
            "index.html".to_string(),
            "app.js".to_string(),
            "styles.css".to_string(),
        ],
        protected_branches: vec![
            "main".to_string(),
            "master".to_string(),
            "development".to_string(),
        ],
    }
}

/// Minimal clean context-audit JSON for scripted auditor stages.
pub fn clean_audit_json() -> String {
    r#"{"canonical_files_present": {"index.html": true, "app.js": true, "styles.css": true}, "dom_ids": [], "css_selectors": [], "js_functions_or_anchors": ["init"], "evidence": [], "missing": []}"#
        .to_string()
}

/// Passing review-verdict JSON for scripted reviewer stages.
pub fn passing_review_json() -> String {
    r#"{"pass": true, "failed_requirements": [], "failed_integration_checks": [], "notes": "ok"}"#
        .to_string()
}
