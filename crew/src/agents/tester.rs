//! Tester stage: detect the project's test command and run it against the
//! post-apply working tree.
//!
//! The report is informational; it is appended to the plan file but does not
//! gate the run. Detection covers the common frontend and scripting stacks
//! the pipeline targets.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::agents::TESTER;
use crate::io::process::run_with_timeout;

const TEST_OUTPUT_LIMIT: usize = 100_000;

/// A detected test invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommand {
    pub framework: String,
    pub command: Vec<String>,
}

/// Inspect the working tree for a runnable test command.
#[instrument(skip_all)]
pub fn detect_test_command(root: &Path) -> Option<TestCommand> {
    if let Ok(contents) = std::fs::read_to_string(root.join("package.json")) {
        if let Ok(pkg) = serde_json::from_str::<Value>(&contents) {
            let scripts = &pkg["scripts"];
            if scripts.get("test").is_some() {
                let framework = if scripts_mention(scripts, "jest") {
                    "jest"
                } else if scripts_mention(scripts, "vitest") {
                    "vitest"
                } else {
                    "npm"
                };
                return Some(TestCommand {
                    framework: framework.to_string(),
                    command: vec!["npm".to_string(), "test".to_string()],
                });
            }
        }
    }

    if root.join("pytest.ini").exists()
        || root.join("pyproject.toml").exists()
        || has_python_tests(root)
    {
        return Some(TestCommand {
            framework: "pytest".to_string(),
            command: vec!["pytest".to_string()],
        });
    }

    if root.join("go.mod").exists() {
        return Some(TestCommand {
            framework: "go".to_string(),
            command: vec!["go".to_string(), "test".to_string(), "./...".to_string()],
        });
    }

    debug!("no test command detected");
    None
}

fn scripts_mention(scripts: &Value, needle: &str) -> bool {
    scripts
        .as_object()
        .map(|map| {
            map.values()
                .filter_map(Value::as_str)
                .any(|script| script.contains(needle))
        })
        .unwrap_or(false)
}

fn has_python_tests(root: &Path) -> bool {
    for dir in ["tests", "test"] {
        let Ok(entries) = std::fs::read_dir(root.join(dir)) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if (name.starts_with("test_") || name.ends_with("_test.py")) && name.ends_with(".py") {
                return true;
            }
        }
    }
    false
}

/// Run the detected test command and format a truthful report.
#[instrument(skip_all, fields(framework = %command.framework))]
pub fn run_tests(root: &Path, command: &TestCommand, timeout: Duration) -> Result<String> {
    let args: Vec<&str> = command.command[1..].iter().map(String::as_str).collect();
    let captured = run_with_timeout(
        &command.command[0],
        &args,
        root,
        None,
        timeout,
        TEST_OUTPUT_LIMIT,
    )?;

    let status = if captured.timed_out {
        "TIMED OUT"
    } else if captured.status.success() {
        "PASSED"
    } else {
        "FAILED"
    };

    let mut report = String::new();
    report.push_str(&format!("Agent: {}\n", TESTER.role));
    report.push_str(&format!("Test framework: {}\n", command.framework));
    report.push_str(&format!("Command: {}\n", command.command.join(" ")));
    report.push_str(&format!(
        "Exit code: {}\n",
        captured
            .status
            .code()
            .map(|code| code.to_string())
            .unwrap_or_else(|| "killed".to_string())
    ));
    report.push_str(&format!("Status: {status}\n\n"));
    report.push_str(&captured.log_block("tests"));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn npm_test_script_is_detected() {
        let repo = TestRepo::new();
        repo.write(
            "package.json",
            r#"{"name": "app", "scripts": {"test": "jest"}}"#,
        );
        let command = detect_test_command(repo.root()).expect("command");
        assert_eq!(command.framework, "jest");
        assert_eq!(command.command, ["npm", "test"]);
    }

    #[test]
    fn python_test_files_select_pytest() {
        let repo = TestRepo::new();
        repo.write("tests/test_sessions.py", "def test_ok():\n    assert True\n");
        let command = detect_test_command(repo.root()).expect("command");
        assert_eq!(command.framework, "pytest");
    }

    #[test]
    fn repo_without_tests_detects_nothing() {
        let repo = TestRepo::new();
        assert_eq!(detect_test_command(repo.root()), None);
    }

    #[test]
    fn report_reflects_exit_status() {
        let repo = TestRepo::new();
        let command = TestCommand {
            framework: "sh".to_string(),
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo 1 passed; exit 0".to_string(),
            ],
        };
        let report = run_tests(repo.root(), &command, Duration::from_secs(10)).expect("run");
        assert!(report.contains("Status: PASSED"));
        assert!(report.contains("1 passed"));

        let failing = TestCommand {
            framework: "sh".to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), "exit 2".to_string()],
        };
        let report = run_tests(repo.root(), &failing, Duration::from_secs(10)).expect("run");
        assert!(report.contains("Status: FAILED"));
        assert!(report.contains("Exit code: 2"));
    }
}
