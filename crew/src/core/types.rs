//! Shared deterministic types for pipeline core logic.

use serde::{Deserialize, Serialize};

/// Terminal status of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every gate passed; post-apply actions were reached.
    Complete,
    /// A gate failed and the retry budget is exhausted (or was never
    /// applicable).
    Incomplete,
}

impl RunStatus {
    pub fn is_complete(self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// The seven advancement gates, in cascade order.
///
/// A failed gate blocks every later gate; gates after a failure are not
/// evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateId {
    /// Required canonical files present and non-empty (pre-agent).
    Context,
    /// Context auditor reported nothing missing (pre-apply).
    ContextAudit,
    /// Reviewer passed the change set (pre-apply).
    Review,
    /// Schema, path, diff-marker, and placeholder validation (during apply).
    Validation,
    /// No placeholders in written files (post-apply).
    PostApply,
    /// Required functions/selectors/tests/files all present (post-apply).
    Coverage,
    /// Every acceptance criterion satisfied (post-apply).
    Requirements,
}

impl GateId {
    /// Gates whose failure is retryable with a missing-item payload.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Validation | Self::PostApply | Self::Coverage | Self::Requirements
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::ContextAudit => "context_audit",
            Self::Review => "review",
            Self::Validation => "validation",
            Self::PostApply => "post_apply",
            Self::Coverage => "coverage",
            Self::Requirements => "requirements",
        }
    }
}
