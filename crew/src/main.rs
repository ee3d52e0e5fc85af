//! `crew` binary: process tracker issues through the agent pipeline.
//!
//! Usage: `crew <owner/repo> [<max_issues> [<issue_number>]] [--openai]`

use anyhow::{anyhow, Result};
use clap::Parser;

use crew::batch::{run_batch, run_single, BatchOutcome};
use crew::config::Config;
use crew::exit_codes;
use crew::io::forge::GitHubForge;
use crew::io::model::HttpModel;

#[derive(Parser)]
#[command(
    name = "crew",
    version,
    about = "Deterministic multi-agent pipeline from tracker issue to verified repository change"
)]
struct Cli {
    /// Target repository as owner/repo (falls back to GITHUB_REPO).
    repository: Option<String>,

    /// Batch mode: process up to this many unprocessed issues.
    #[arg(default_value_t = 1)]
    max_issues: u32,

    /// Single-issue mode: with max_issues = 1, process exactly this issue,
    /// bypassing the processed set.
    issue_number: Option<u64>,

    /// Use the remote model provider instead of the local one.
    #[arg(long, visible_alias = "force-openai")]
    openai: bool,
}

fn main() {
    crew::logging::init();
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();
    Config::export_telemetry_guard();

    let config = match Config::from_env(cli.openai) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return exit_codes::CONFIG;
        }
    };

    let outcome = match dispatch(&cli, &config) {
        Ok(outcome) => outcome,
        Err(err) => {
            eprintln!("{err:#}");
            return exit_codes::CONFIG;
        }
    };

    if outcome.all_complete() {
        exit_codes::OK
    } else {
        exit_codes::INCOMPLETE
    }
}

fn dispatch(cli: &Cli, config: &Config) -> Result<BatchOutcome> {
    let repo = cli
        .repository
        .clone()
        .or_else(|| config.default_repo.clone())
        .ok_or_else(|| anyhow!("no repository given and GITHUB_REPO is not set"))?;
    if !repo.contains('/') {
        return Err(anyhow!("repository must be owner/repo (got '{repo}')"));
    }

    let model = HttpModel::new(&config.provider, config.model_timeout)?;
    let forge = GitHubForge::new(config.forge_token.clone(), config.forge_timeout)?;

    match cli.issue_number {
        Some(issue_number) => {
            if cli.max_issues != 1 {
                return Err(anyhow!(
                    "an explicit issue number requires max_issues = 1 (got {})",
                    cli.max_issues
                ));
            }
            run_single(config, &model, &forge, &repo, issue_number)
        }
        None => run_batch(config, &model, &forge, &repo, cli.max_issues),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_batch_invocation() {
        let cli = Cli::parse_from(["crew", "owner/repo", "5"]);
        assert_eq!(cli.repository.as_deref(), Some("owner/repo"));
        assert_eq!(cli.max_issues, 5);
        assert_eq!(cli.issue_number, None);
        assert!(!cli.openai);
    }

    #[test]
    fn parses_single_issue_invocation() {
        let cli = Cli::parse_from(["crew", "owner/repo", "1", "42"]);
        assert_eq!(cli.max_issues, 1);
        assert_eq!(cli.issue_number, Some(42));
    }

    #[test]
    fn parses_openai_flag_and_alias() {
        let cli = Cli::parse_from(["crew", "owner/repo", "--openai"]);
        assert!(cli.openai);
        let cli = Cli::parse_from(["crew", "owner/repo", "--force-openai"]);
        assert!(cli.openai);
    }

    #[test]
    fn max_issues_defaults_to_one() {
        let cli = Cli::parse_from(["crew", "owner/repo"]);
        assert_eq!(cli.max_issues, 1);
    }
}
