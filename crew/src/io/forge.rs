//! Forge and project-board access behind one trait.
//!
//! The pipeline consumes issues and moves them across board columns; it never
//! merges or comments. The GitHub implementation is deliberately thin: the
//! orchestrator owns all policy (timeouts, when board failures are warnings).

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

/// A tracker issue, immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
}

impl Issue {
    /// Issue rendered the way agents receive it.
    pub fn as_prompt_text(&self) -> String {
        let body = if self.body.trim().is_empty() {
            "No description"
        } else {
            self.body.trim()
        };
        format!("# {}\n\n{}", self.title, body)
    }
}

/// Issue-tracker and project-board operations the pipeline depends on.
pub trait Forge {
    fn issue(&self, repo: &str, number: u64) -> Result<Issue>;

    /// Open issues, most recently updated first.
    fn open_issues(&self, repo: &str) -> Result<Vec<Issue>>;

    /// Open sub-issues of a parent, native API first, `#N` body references as
    /// a fallback.
    fn sub_issues(&self, repo: &str, number: u64) -> Result<Vec<Issue>>;

    /// Move the issue to a project-board column.
    fn move_issue(&self, repo: &str, number: u64, column: &str) -> Result<()>;
}

/// `#N` references in an issue body, excluding the issue itself, first
/// occurrence wins.
pub fn parse_issue_refs(body: &str, own_number: u64) -> Vec<u64> {
    static ISSUE_REF: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"#(\d+)").expect("issue ref pattern"));
    let mut refs = Vec::new();
    for caps in ISSUE_REF.captures_iter(body) {
        if let Ok(number) = caps[1].parse::<u64>() {
            if number != own_number && !refs.contains(&number) {
                refs.push(number);
            }
        }
    }
    refs
}

/// GitHub REST + GraphQL client.
pub struct GitHubForge {
    token: String,
    api_base: String,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct RestIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

impl From<RestIssue> for Issue {
    fn from(raw: RestIssue) -> Self {
        Self {
            number: raw.number,
            title: raw.title,
            body: raw.body.unwrap_or_default(),
        }
    }
}

impl GitHubForge {
    pub fn new(token: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent("crew-pipeline")
            .build()
            .context("build forge client")?;
        Ok(Self {
            token,
            api_base: "https://api.github.com".to_string(),
            client,
        })
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response> {
        let url = format!("{}{path}", self.api_base);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .with_context(|| format!("GET {path}"))?;
        if response.status().is_server_error() {
            return Err(anyhow!("forge returned {} for {path}", response.status()));
        }
        Ok(response)
    }

    fn graphql(&self, query: &str, variables: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}/graphql", self.api_base))
            .bearer_auth(&self.token)
            .json(&json!({"query": query, "variables": variables}))
            .send()
            .context("POST /graphql")?;
        let value: serde_json::Value = response.json().context("parse graphql response")?;
        if let Some(errors) = value.get("errors") {
            if errors.as_array().map(|a| !a.is_empty()).unwrap_or(false) {
                return Err(anyhow!("graphql errors: {errors}"));
            }
        }
        Ok(value)
    }
}

impl Forge for GitHubForge {
    #[instrument(skip_all, fields(repo, number))]
    fn issue(&self, repo: &str, number: u64) -> Result<Issue> {
        let response = self.get(&format!("/repos/{repo}/issues/{number}"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(anyhow!("issue #{number} not found in {repo}"));
        }
        let raw: RestIssue = response.json().context("parse issue")?;
        if raw.pull_request.is_some() {
            return Err(anyhow!("#{number} is a pull request, not an issue"));
        }
        Ok(raw.into())
    }

    fn open_issues(&self, repo: &str) -> Result<Vec<Issue>> {
        let response =
            self.get(&format!("/repos/{repo}/issues?state=open&sort=updated&per_page=100"))?;
        let raw: Vec<RestIssue> = response.json().context("parse issue list")?;
        Ok(raw
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .map(Issue::from)
            .collect())
    }

    fn sub_issues(&self, repo: &str, number: u64) -> Result<Vec<Issue>> {
        // Native sub-issues endpoint when the forge supports it.
        if let Ok(response) = self.get(&format!("/repos/{repo}/issues/{number}/sub_issues")) {
            if response.status().is_success() {
                if let Ok(raw) = response.json::<Vec<RestIssue>>() {
                    let open: Vec<Issue> = raw
                        .into_iter()
                        .filter(|issue| issue.state.as_deref() == Some("open"))
                        .map(Issue::from)
                        .collect();
                    if !open.is_empty() {
                        return Ok(open);
                    }
                }
            }
        }

        // Fallback: linked `#N` references in the parent body.
        let parent = self.issue(repo, number)?;
        let mut subs = Vec::new();
        for reference in parse_issue_refs(&parent.body, number) {
            match self.issue(repo, reference) {
                Ok(sub) => subs.push(sub),
                Err(err) => debug!(reference, %err, "skipping unreadable issue reference"),
            }
        }
        Ok(subs)
    }

    /// Move the issue's project item to `column` via the ProjectsV2 status
    /// field. Looks at the first project the issue belongs to.
    #[instrument(skip_all, fields(repo, number, column))]
    fn move_issue(&self, repo: &str, number: u64, column: &str) -> Result<()> {
        let (owner, name) = repo
            .split_once('/')
            .ok_or_else(|| anyhow!("repository must be owner/repo (got '{repo}')"))?;

        let lookup = self.graphql(
            r#"query($owner: String!, $name: String!, $number: Int!) {
                repository(owner: $owner, name: $name) {
                    issue(number: $number) {
                        projectItems(first: 1) {
                            nodes {
                                id
                                project {
                                    id
                                    field(name: "Status") {
                                        ... on ProjectV2SingleSelectField {
                                            id
                                            options { id name }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }"#,
            json!({"owner": owner, "name": name, "number": number}),
        )?;

        let item = &lookup["data"]["repository"]["issue"]["projectItems"]["nodes"][0];
        if item.is_null() {
            warn!(number, "issue belongs to no project; skipping board move");
            return Ok(());
        }
        let item_id = item["id"]
            .as_str()
            .ok_or_else(|| anyhow!("project item id missing"))?;
        let project_id = item["project"]["id"]
            .as_str()
            .ok_or_else(|| anyhow!("project id missing"))?;
        let field = &item["project"]["field"];
        let field_id = field["id"]
            .as_str()
            .ok_or_else(|| anyhow!("status field missing"))?;
        let option_id = field["options"]
            .as_array()
            .and_then(|options| {
                options
                    .iter()
                    .find(|option| option["name"].as_str() == Some(column))
            })
            .and_then(|option| option["id"].as_str())
            .ok_or_else(|| anyhow!("board column '{column}' not found"))?;

        self.graphql(
            r#"mutation($project: ID!, $item: ID!, $field: ID!, $option: String!) {
                updateProjectV2ItemFieldValue(input: {
                    projectId: $project,
                    itemId: $item,
                    fieldId: $field,
                    value: { singleSelectOptionId: $option }
                }) { projectV2Item { id } }
            }"#,
            json!({"project": project_id, "item": item_id, "field": field_id, "option": option_id}),
        )?;
        debug!(number, column, "issue moved on board");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_refs_skip_self_and_deduplicate() {
        let body = "Depends on #12 and #13, see also #12 and #40.";
        assert_eq!(parse_issue_refs(body, 40), vec![12, 13]);
    }

    #[test]
    fn issue_refs_of_plain_body_are_empty() {
        assert!(parse_issue_refs("no references here", 1).is_empty());
    }

    #[test]
    fn prompt_text_includes_title_and_placeholder_body() {
        let issue = Issue {
            number: 9,
            title: "Add clear button".to_string(),
            body: String::new(),
        };
        assert_eq!(issue.as_prompt_text(), "# Add clear button\n\nNo description");
    }
}
