//! Path allowlist and path-safety checks.
//!
//! The allowlist is the set of repository-relative files that existed when
//! the pipeline started; the developer agent may only touch these (canonical
//! files are always allowed) plus fresh files under test directories. Path
//! safety is absolute: no absolute paths, no `..` segments, no symlink
//! escapes from the repository root.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::instrument;
use walkdir::WalkDir;

/// Directory names excluded from the filesystem walk.
const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "dist",
    "build",
    ".next",
    ".nuxt",
    "__pycache__",
    ".pytest_cache",
    ".venv",
    "venv",
    "env",
    "coverage",
    "target",
];

/// Path prefixes the developer must never reference in frontend-only
/// repositories. A missing file under one of these is almost always a
/// hallucinated backend.
pub const FORBIDDEN_PREFIXES: &[&str] = &[
    "api/",
    "routes/",
    "controllers/",
    "models/",
    "backend/",
    "server/",
];

/// Snapshot of repository files taken at pipeline start.
#[derive(Debug, Clone, Default)]
pub struct PathAllowlist {
    files: BTreeSet<String>,
}

impl PathAllowlist {
    /// Walk the working tree, skipping VCS/build directories and dotdirs.
    #[instrument(skip_all)]
    pub fn build(root: &Path) -> Self {
        let mut files = BTreeSet::new();
        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            if entry.depth() == 0 || entry.file_type().is_file() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !EXCLUDED_DIRS.contains(&name.as_ref()) && !name.starts_with('.')
        });
        for entry in walker.flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(root) {
                files.insert(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, rel: &str) -> bool {
        self.files.contains(rel)
    }

    /// Exact-modulo-case match, for "did you mean" hints.
    pub fn find_case_insensitive(&self, rel: &str) -> Option<&str> {
        let lower = rel.to_lowercase();
        self.files
            .iter()
            .find(|file| file.to_lowercase() == lower)
            .map(String::as_str)
    }

    /// Allowlist preview for prompts: canonical files first, then the rest,
    /// capped at `limit`.
    pub fn preview(&self, canonical: &[String], limit: usize) -> Vec<String> {
        let mut listed = Vec::new();
        for path in canonical {
            if self.contains(path) && !listed.contains(path) {
                listed.push(path.clone());
            }
        }
        for path in &self.files {
            if listed.len() >= limit {
                break;
            }
            if !listed.contains(path) {
                listed.push(path.clone());
            }
        }
        listed.truncate(limit);
        listed
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str)
    }
}

/// Matching forbidden prefix for a repository-relative path, if any.
pub fn forbidden_prefix(rel: &str) -> Option<&'static str> {
    let lower = rel.to_lowercase();
    FORBIDDEN_PREFIXES
        .iter()
        .copied()
        .find(|prefix| lower.starts_with(prefix) || lower.contains(&format!("/{prefix}")))
}

/// Validate one repository-relative path.
///
/// Rejects absolute paths, any `..` segment, and paths whose symlink-resolved
/// location falls outside the resolved repository root. Returns the error
/// message for the validation gate.
pub fn check_path_safety(rel: &str, root: &Path) -> Result<(), String> {
    let candidate = Path::new(rel);
    if candidate.is_absolute() {
        return Err(format!(
            "absolute path rejected: '{rel}' (use repository-relative paths)"
        ));
    }
    if candidate
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(format!(
            "path traversal rejected: '{rel}' ('..' segments are not allowed)"
        ));
    }

    let resolved_root = root
        .canonicalize()
        .map_err(|e| format!("repository root is not resolvable: {e}"))?;
    let resolved = resolve_within(&resolved_root, candidate)
        .map_err(|e| format!("invalid path '{rel}': {e}"))?;
    if !resolved.starts_with(&resolved_root) {
        return Err(format!(
            "path escapes repository root: '{rel}' resolves outside the repo"
        ));
    }
    Ok(())
}

/// Resolve `rel` under `root`, following symlinks in every existing ancestor.
///
/// The final component may not exist yet (create operations); its parent
/// decides containment.
fn resolve_within(root: &Path, rel: &Path) -> Result<PathBuf> {
    let joined = root.join(rel);
    if let Ok(resolved) = joined.canonicalize() {
        return Ok(resolved);
    }
    // Walk up to the deepest existing ancestor, resolve that, and re-append
    // the remaining components.
    let mut existing = joined.clone();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_owned());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut resolved = existing
        .canonicalize()
        .with_context(|| format!("resolve {}", existing.display()))?;
    for component in tail.into_iter().rev() {
        resolved.push(component);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn walk_collects_files_and_skips_excluded_dirs() {
        let repo = TestRepo::new();
        repo.write("node_modules/pkg/index.js", "ignored");
        repo.write(".hidden/secret.txt", "ignored");
        repo.write("js/util.js", "function util() {}\n");

        let allowlist = PathAllowlist::build(repo.root());
        assert!(allowlist.contains("app.js"));
        assert!(allowlist.contains("js/util.js"));
        assert!(!allowlist.contains("node_modules/pkg/index.js"));
        assert!(!allowlist.contains(".hidden/secret.txt"));
    }

    #[test]
    fn case_insensitive_lookup_finds_similar_file() {
        let repo = TestRepo::new();
        let allowlist = PathAllowlist::build(repo.root());
        assert_eq!(allowlist.find_case_insensitive("App.JS"), Some("app.js"));
        assert_eq!(allowlist.find_case_insensitive("nope.js"), None);
    }

    #[test]
    fn preview_lists_canonical_files_first() {
        let repo = TestRepo::new();
        let allowlist = PathAllowlist::build(repo.root());
        let canonical = vec!["app.js".to_string(), "styles.css".to_string()];
        let preview = allowlist.preview(&canonical, 3);
        assert_eq!(&preview[..2], ["app.js", "styles.css"]);
        assert_eq!(preview.len(), 3);
    }

    #[test]
    fn forbidden_prefixes_match_backend_paths() {
        assert_eq!(forbidden_prefix("api/users.js"), Some("api/"));
        assert_eq!(forbidden_prefix("src/server/index.js"), Some("server/"));
        assert_eq!(forbidden_prefix("app.js"), None);
    }

    #[test]
    fn absolute_paths_are_rejected() {
        let repo = TestRepo::new();
        let err = check_path_safety("/etc/hosts", repo.root()).unwrap_err();
        assert!(err.contains("absolute path rejected"));
    }

    #[test]
    fn parent_dir_segments_are_rejected() {
        let repo = TestRepo::new();
        let err = check_path_safety("../outside.txt", repo.root()).unwrap_err();
        assert!(err.contains("path traversal rejected"));
        let err = check_path_safety("js/../../outside.txt", repo.root()).unwrap_err();
        assert!(err.contains("path traversal rejected"));
    }

    #[test]
    fn symlink_escapes_are_rejected() {
        let repo = TestRepo::new();
        let outside = tempfile::tempdir().expect("outside dir");
        std::os::unix::fs::symlink(outside.path(), repo.root().join("linked"))
            .expect("create symlink");

        let err = check_path_safety("linked/payload.txt", repo.root()).unwrap_err();
        assert!(err.contains("escapes repository root"), "got: {err}");
    }

    #[test]
    fn relative_paths_inside_the_repo_pass() {
        let repo = TestRepo::new();
        check_path_safety("app.js", repo.root()).expect("existing file");
        check_path_safety("tests/new_file.test.js", repo.root()).expect("new file");
    }
}
