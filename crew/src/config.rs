//! Pipeline configuration assembled from the process environment.
//!
//! A single [`Config`] value is constructed at startup and passed explicitly
//! to every component. Only the environment variables read here are
//! recognized; there is no config file and no global mutable state.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};

/// How sub-issues of a parent issue are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubIssueStrategy {
    /// Sub-issue bodies are concatenated into the parent issue context.
    Include,
    /// Sub-issues are processed as separate runs after the parent.
    Sequential,
    /// Sub-issues are ignored.
    Skip,
}

impl SubIssueStrategy {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "include" => Ok(Self::Include),
            "sequential" => Ok(Self::Sequential),
            "skip" => Ok(Self::Skip),
            other => Err(anyhow!(
                "SUB_ISSUE_STRATEGY must be include, sequential, or skip (got '{other}')"
            )),
        }
    }
}

/// Which model backend serves agent invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelProvider {
    /// Local OpenAI-compatible endpoint (default).
    Local { base_url: String, model: String },
    /// Remote provider selected by `--openai` or `FORCE_OPENAI=true`.
    OpenAi {
        base_url: String,
        model: String,
        api_key: String,
    },
}

impl ModelProvider {
    pub fn describe(&self) -> String {
        match self {
            Self::Local { base_url, model } => format!("local {model} at {base_url}"),
            Self::OpenAi { model, .. } => format!("openai {model}"),
        }
    }
}

/// Pipeline configuration. Constructed once, never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    /// Forge API token (required).
    pub forge_token: String,
    /// Default `owner/repo` when the CLI omits one.
    pub default_repo: Option<String>,
    /// Working tree of the target repository.
    pub work_dir: PathBuf,
    /// Model backend for agent invocations.
    pub provider: ModelProvider,
    /// Wall-clock budget per model invocation.
    pub model_timeout: Duration,
    /// Base delay between agent transport retries; doubles per retry.
    pub transport_backoff: Duration,
    /// Budget per git invocation.
    pub git_timeout: Duration,
    /// Budget per forge/board HTTP call.
    pub forge_timeout: Duration,
    /// Push the feature branch after a complete run.
    pub auto_push: bool,
    /// Move issues across project-board columns.
    pub move_in_pipeline: bool,
    pub in_progress_column: String,
    pub done_column: String,
    /// Fetch and consider sub-issues of the target issue.
    pub process_sub_issues: bool,
    pub sub_issue_strategy: SubIssueStrategy,
    /// Run the tester agent after a successful apply.
    pub enable_testing: bool,
    /// Files whose absence or emptiness is a fatal configuration error.
    pub canonical_files: Vec<String>,
    /// Branches that must never receive direct writes.
    pub protected_branches: Vec<String>,
}

impl Config {
    /// Assemble configuration from the environment.
    ///
    /// `force_openai` reflects the `--openai` CLI flag; `FORCE_OPENAI=true`
    /// has the same effect. A missing forge token is a fatal configuration
    /// error, reported before any agent or network activity.
    pub fn from_env(force_openai: bool) -> Result<Self> {
        let forge_token = env::var("GITHUB_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("GITHUB_TOKEN is not set (required)"))?;

        let work_dir = match env::var("WORK_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => env::current_dir()?,
        };

        let use_openai = force_openai || env_flag("FORCE_OPENAI", false);
        let provider = if use_openai {
            let api_key = env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| anyhow!("OPENAI_API_KEY is required with --openai"))?;
            ModelProvider::OpenAi {
                base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com"),
                model: env_or("OPENAI_MODEL", "gpt-4o-mini"),
                api_key,
            }
        } else {
            ModelProvider::Local {
                base_url: env_or("OLLAMA_BASE_URL", "http://localhost:11434"),
                model: env_or("OLLAMA_MODEL", "qwen2.5-coder:3b"),
            }
        };

        let model_timeout_secs = env_u64("OLLAMA_TIMEOUT", 20 * 60)?;
        let sub_issue_strategy = match env::var("SUB_ISSUE_STRATEGY") {
            Ok(value) => SubIssueStrategy::parse(&value)?,
            Err(_) => SubIssueStrategy::Include,
        };

        let config = Self {
            forge_token,
            default_repo: env::var("GITHUB_REPO").ok().filter(|r| !r.is_empty()),
            work_dir,
            provider,
            model_timeout: Duration::from_secs(model_timeout_secs),
            transport_backoff: Duration::from_secs(5),
            git_timeout: Duration::from_secs(60),
            forge_timeout: Duration::from_secs(30),
            auto_push: env_flag("AUTO_PUSH", false),
            move_in_pipeline: env_flag("MOVE_IN_PIPELINE", true),
            in_progress_column: env_or("PIPELINE_IN_PROGRESS_COLUMN", "In Progress"),
            done_column: env_or("PIPELINE_DONE_COLUMN", "Done"),
            process_sub_issues: env_flag("PROCESS_SUB_ISSUES", true),
            sub_issue_strategy,
            enable_testing: env_flag("ENABLE_TESTING", true),
            canonical_files: default_canonical_files(),
            protected_branches: default_protected_branches(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.forge_token.trim().is_empty() {
            return Err(anyhow!("forge token must be non-empty"));
        }
        if self.model_timeout.is_zero() {
            return Err(anyhow!("model timeout must be > 0"));
        }
        if self.canonical_files.is_empty() {
            return Err(anyhow!("canonical file list must be non-empty"));
        }
        if self.protected_branches.is_empty() {
            return Err(anyhow!("protected branch list must be non-empty"));
        }
        Ok(())
    }

    /// Disable the OTel SDK unless explicitly re-enabled, so runs never stall
    /// on an unreachable telemetry endpoint.
    pub fn export_telemetry_guard() {
        if env::var("OTEL_SDK_DISABLED").is_err() {
            env::set_var("OTEL_SDK_DISABLED", "true");
        }
    }
}

fn default_canonical_files() -> Vec<String> {
    ["index.html", "app.js", "styles.css"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_protected_branches() -> Vec<String> {
    ["main", "master", "development"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        ),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| anyhow!("{key} must be an integer (got '{value}')")),
        Err(_) => Ok(default),
    }
}
