//! Context bundler: the repository snapshot agents reason about.
//!
//! Canonical files are loaded whole; a bounded sample of other text files
//! contributes heads and keyword snippets. If any required file is missing or
//! empty the manifest carries fatal errors and the pipeline stops before any
//! agent runs.

use std::path::Path;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::io::allowlist::PathAllowlist;

/// Vocabulary used to pull relevant snippets out of sampled files.
const SNIPPET_KEYWORDS: &[&str] = &["modal", "session", "toast", "header", "button"];

/// One file in the context manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    pub required: bool,
    pub bytes: usize,
    pub chars: usize,
    pub empty: bool,
}

/// Ordered manifest of everything the bundler looked at.
#[derive(Debug, Clone, Default)]
pub struct ContextManifest {
    pub entries: Vec<ManifestEntry>,
    /// Non-empty iff a required entry is missing or empty. Fatal: the
    /// pipeline must abort before any agent runs.
    pub fatal_errors: Vec<String>,
}

impl ContextManifest {
    pub fn is_fatal(&self) -> bool {
        !self.fatal_errors.is_empty()
    }
}

/// Bundled context: manifest plus the capped prompt slice.
#[derive(Debug, Clone)]
pub struct ContextBundle {
    pub manifest: ContextManifest,
    pub context_text: String,
}

/// Bundler limits. Defaults fit the reference static-frontend repository.
#[derive(Debug, Clone)]
pub struct BundleOptions {
    pub canonical_files: Vec<String>,
    /// Sampled (non-canonical) file cap.
    pub max_sampled_files: usize,
    /// Head bytes taken from each sampled file.
    pub sample_head_bytes: usize,
    /// Upper bound for the concatenated prompt slice.
    pub context_char_cap: usize,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            canonical_files: vec![
                "index.html".to_string(),
                "app.js".to_string(),
                "styles.css".to_string(),
            ],
            max_sampled_files: 5,
            sample_head_bytes: 1_000,
            context_char_cap: 10_000,
        }
    }
}

/// Load the canonical files and a sample of the rest into a prompt-ready
/// bundle.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn bundle_context(
    root: &Path,
    allowlist: &PathAllowlist,
    options: &BundleOptions,
) -> Result<ContextBundle> {
    let mut manifest = ContextManifest::default();
    let mut sections: Vec<String> = Vec::new();

    if let Ok(readme) = std::fs::read_to_string(root.join("README.md")) {
        let head: String = readme.chars().take(2_000).collect();
        sections.push(format!("## Project README\n{head}\n"));
    }

    for canonical in &options.canonical_files {
        let path = root.join(canonical);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let empty = contents.trim().is_empty();
                manifest.entries.push(ManifestEntry {
                    path: canonical.clone(),
                    required: true,
                    bytes: contents.len(),
                    chars: contents.chars().count(),
                    empty,
                });
                if empty {
                    manifest
                        .fatal_errors
                        .push(format!("required file is empty: {canonical}"));
                } else {
                    sections.push(format!("### {canonical}\n```\n{contents}\n```\n"));
                }
            }
            Err(_) => {
                manifest.entries.push(ManifestEntry {
                    path: canonical.clone(),
                    required: true,
                    bytes: 0,
                    chars: 0,
                    empty: true,
                });
                manifest
                    .fatal_errors
                    .push(format!("required file is missing: {canonical}"));
            }
        }
    }

    if manifest.is_fatal() {
        debug!(errors = manifest.fatal_errors.len(), "context bundle is fatal");
        return Ok(ContextBundle {
            manifest,
            context_text: String::new(),
        });
    }

    let mut sampled = 0usize;
    for rel in allowlist.iter() {
        if sampled >= options.max_sampled_files {
            break;
        }
        if options.canonical_files.iter().any(|c| c == rel) || !is_text_candidate(rel) {
            continue;
        }
        let Ok(contents) = std::fs::read_to_string(root.join(rel)) else {
            continue;
        };
        manifest.entries.push(ManifestEntry {
            path: rel.to_string(),
            required: false,
            bytes: contents.len(),
            chars: contents.chars().count(),
            empty: contents.trim().is_empty(),
        });

        let head: String = contents.chars().take(options.sample_head_bytes).collect();
        let mut section = format!("### {rel} (head)\n```\n{head}\n```\n");
        let snippets = keyword_snippets(&contents);
        if !snippets.is_empty() {
            section.push_str(&format!("Relevant lines:\n{}\n", snippets.join("\n")));
        }
        sections.push(section);
        sampled += 1;
    }

    let mut context_text = sections.join("\n");
    if context_text.chars().count() > options.context_char_cap {
        context_text = context_text
            .chars()
            .take(options.context_char_cap)
            .collect();
        context_text.push_str("\n[context truncated]");
    }

    debug!(
        entries = manifest.entries.len(),
        chars = context_text.len(),
        "context bundled"
    );
    Ok(ContextBundle {
        manifest,
        context_text,
    })
}

fn is_text_candidate(rel: &str) -> bool {
    const TEXT_EXTENSIONS: &[&str] = &[
        "js", "ts", "css", "html", "htm", "json", "md", "txt", "yml", "yaml", "toml",
    ];
    rel.rsplit('.')
        .next()
        .map(|ext| TEXT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Lines mentioning any snippet keyword, capped and prefixed for the prompt.
fn keyword_snippets(contents: &str) -> Vec<String> {
    let mut snippets = Vec::new();
    for line in contents.lines() {
        let lower = line.to_lowercase();
        if SNIPPET_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            snippets.push(format!("> {}", line.trim()));
            if snippets.len() >= 8 {
                break;
            }
        }
    }
    snippets
}
