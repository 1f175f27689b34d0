//! Severity classification of final step failures.

use repoqa_shared::{ToolError, ToolErrorKind, ToolResult, codes};

/// How bad a failure is, in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Transient: network blips, rate limits, timeouts.
    Recoverable,
    /// Partial or unusable output; the run continues on a fallback.
    Degraded,
    /// The run cannot produce a trustworthy answer.
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recoverable => "recoverable",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }
}

/// What the orchestrator does about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    ContinueWithFallback,
    Abort,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub severity: Severity,
    pub action: RecoveryAction,
    pub reason: String,
}

/// Severity of a single error.
pub fn severity_of(error: &ToolError) -> Severity {
    if error.has_code(codes::MISSING_CREDENTIALS)
        || error.has_code(codes::BACKEND_UNAVAILABLE)
        || error.has_code(codes::INVALID_STATE)
    {
        return Severity::Critical;
    }

    match error.kind {
        ToolErrorKind::Network | ToolErrorKind::ApiLimit | ToolErrorKind::Timeout => {
            Severity::Recoverable
        }
        ToolErrorKind::Validation if error.has_code(codes::PARSE_ERROR) => Severity::Degraded,
        ToolErrorKind::Validation => Severity::Critical,
        ToolErrorKind::Execution => Severity::Degraded,
    }
}

/// Classify a failed result. The most severe error wins; a failure with no
/// errors is Degraded.
pub fn classify<T>(
    result: &ToolResult<T>,
    essential: bool,
    retries_exhausted: bool,
) -> Classification {
    let worst = result
        .errors
        .iter()
        .max_by_key(|e| severity_of(e));

    let (severity, reason) = match worst {
        Some(error) => (severity_of(error), format!("{}: {}", error.kind, error.message)),
        None => (Severity::Degraded, "step failed without error details".to_string()),
    };

    Classification {
        severity,
        action: resolve(severity, retries_exhausted, essential),
        reason,
    }
}

/// Fixed action per severity. Recoverable degrades once retries are spent;
/// Critical degrades for non-essential steps.
pub fn resolve(severity: Severity, retries_exhausted: bool, essential: bool) -> RecoveryAction {
    match severity {
        Severity::Recoverable if !retries_exhausted => RecoveryAction::Retry,
        Severity::Recoverable | Severity::Degraded => RecoveryAction::ContinueWithFallback,
        Severity::Critical if essential => RecoveryAction::Abort,
        Severity::Critical => RecoveryAction::ContinueWithFallback,
    }
}
