//! Coverage gate: does the working tree actually contain what the plan
//! promised?
//!
//! Functions are grepped across the canonical JS files, selectors across the
//! styles files, test and required files by existence. Everything missing is
//! reported; nothing else is inferred.

use std::path::Path;

use tracing::{debug, instrument};

use crate::core::edits::{css_selector_present, declares_js_function};
use crate::core::plan::PlanRequirements;

/// Missing plan items found by the coverage walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageReport {
    pub missing_functions: Vec<String>,
    pub missing_css_selectors: Vec<String>,
    pub missing_test_files: Vec<String>,
    pub missing_required_files: Vec<String>,
}

impl CoverageReport {
    pub fn is_complete(&self) -> bool {
        self.missing_functions.is_empty()
            && self.missing_css_selectors.is_empty()
            && self.missing_test_files.is_empty()
            && self.missing_required_files.is_empty()
    }
}

/// Check the plan requirements against the working tree.
///
/// `script_files` and `styles_files` are the canonical places functions and
/// selectors are expected to land (typically the canonical JS/CSS files).
#[instrument(skip_all)]
pub fn check_coverage(
    plan: &PlanRequirements,
    root: &Path,
    script_files: &[String],
    styles_files: &[String],
) -> CoverageReport {
    let mut report = CoverageReport::default();

    let scripts: Vec<String> = script_files
        .iter()
        .filter_map(|rel| std::fs::read_to_string(root.join(rel)).ok())
        .collect();
    for function in &plan.functions {
        if !scripts
            .iter()
            .any(|source| declares_js_function(source, function))
        {
            report.missing_functions.push(function.clone());
        }
    }

    let styles: Vec<String> = styles_files
        .iter()
        .filter_map(|rel| std::fs::read_to_string(root.join(rel)).ok())
        .collect();
    for selector in &plan.css_selectors {
        let found = !styles.is_empty()
            && styles
                .iter()
                .any(|source| css_selector_present(source, selector));
        if !found {
            report.missing_css_selectors.push(selector.clone());
        }
    }

    for test_file in &plan.test_files {
        if !root.join(test_file).exists() {
            report.missing_test_files.push(test_file.clone());
        }
    }

    for required in &plan.required_files {
        if !root.join(required).exists() {
            report.missing_required_files.push(required.clone());
        }
    }

    debug!(complete = report.is_complete(), "coverage checked");
    report
}
