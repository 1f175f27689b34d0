//! Result, status and error data model shared by every pipeline step.
//!
//! These are plain data shapes: the only behaviour here is construction
//! helpers and the phase state machine.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known [`ToolError::code`] values.
pub mod codes {
    /// Step input did not match the declared input schema.
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
    /// A backend response did not parse into the step's output shape.
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
    /// The step's logic returned a fault.
    pub const STEP_FAULT: &str = "STEP_FAULT";
    /// The step's logic panicked.
    pub const STEP_PANIC: &str = "STEP_PANIC";
    /// The attempt exceeded the step's time ceiling.
    pub const TIME_CEILING: &str = "TIME_CEILING";
    /// Every target repository failed to answer a search.
    pub const ALL_REPOSITORIES_FAILED: &str = "ALL_REPOSITORIES_FAILED";
    /// Credentials for a backend are missing or rejected.
    pub const MISSING_CREDENTIALS: &str = "MISSING_CREDENTIALS";
    /// A backend is down or not configured.
    pub const BACKEND_UNAVAILABLE: &str = "BACKEND_UNAVAILABLE";
    /// A backend refused the request as malformed or unsupported.
    pub const REQUEST_REJECTED: &str = "REQUEST_REJECTED";
    /// The run's own bookkeeping is inconsistent.
    pub const INVALID_STATE: &str = "INVALID_STATE";
}

// ---------------------------------------------------------------------------
// ToolDescriptor
// ---------------------------------------------------------------------------

/// Static identity of a pipeline step.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Unique, stable step name (e.g. `relevance_checker`).
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Declared input shape (JSON Schema subset), validated before the step runs.
    pub input_schema: Value,
    /// Whether failed attempts may be retried.
    pub retryable: bool,
    /// Expected duration, used for progress estimates and the time ceiling.
    pub estimated_duration: Duration,
}

impl ToolDescriptor {
    /// Hard per-attempt ceiling: four times the estimated duration.
    pub fn time_ceiling(&self) -> Duration {
        self.estimated_duration * 4
    }
}

// ---------------------------------------------------------------------------
// ToolError
// ---------------------------------------------------------------------------

/// Error taxonomy for step failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Malformed input to a step. Never retried.
    Validation,
    /// The step's internal logic faulted.
    Execution,
    /// The step exceeded its time ceiling.
    Timeout,
    /// Transport-level failure talking to a collaborator.
    Network,
    /// Rate or quota exhaustion from a collaborator.
    ApiLimit,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::ApiLimit => "api_limit",
        }
    }
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failure reported by a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    #[serde(rename = "type")]
    pub kind: ToolErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub retryable: bool,
    /// Free-form diagnostics.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,
}

impl ToolError {
    /// Create a non-retryable error of the given kind.
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            retryable: false,
            context: BTreeMap::new(),
        }
    }

    /// Input validation failure (`INVALID_INPUT`, never retryable).
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Validation, message).with_code(codes::INVALID_INPUT)
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Whether this error carries the given code.
    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

// ---------------------------------------------------------------------------
// ToolResult
// ---------------------------------------------------------------------------

/// Execution metadata attached to every result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
}

/// Routing decision a step hands to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingSignal {
    /// Continue with the next step.
    #[default]
    None,
    /// Stop searching and answer conversationally.
    GeneralResponse,
    /// Existing context suffices; bypass the repository search.
    SkipSearch,
    /// Stop the run.
    Abort,
}

/// The only way a step communicates outward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult<T> {
    pub success: bool,
    /// Typed payload; `None` whenever `success` is false.
    pub data: Option<T>,
    /// One line, safe to show a user even on failure.
    pub short_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detailed_summary: Option<String>,
    /// Step-local confidence in `0.0..=1.0`.
    pub confidence: f64,
    #[serde(default)]
    pub metadata: ResultMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<RoutingSignal>,
    #[serde(default)]
    pub errors: Vec<ToolError>,
}

impl<T> ToolResult<T> {
    /// A successful result.
    pub fn ok(data: T, short_summary: impl Into<String>, confidence: f64) -> Self {
        Self {
            success: true,
            data: Some(data),
            short_summary: short_summary.into(),
            detailed_summary: None,
            confidence: confidence.clamp(0.0, 1.0),
            metadata: ResultMetadata::default(),
            next_action: None,
            errors: Vec::new(),
        }
    }

    /// A failed result carrying one error.
    pub fn failed(short_summary: impl Into<String>, error: ToolError) -> Self {
        Self {
            success: false,
            data: None,
            short_summary: short_summary.into(),
            detailed_summary: None,
            confidence: 0.0,
            metadata: ResultMetadata::default(),
            next_action: None,
            errors: vec![error],
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detailed_summary = Some(detail.into());
        self
    }

    pub fn with_next_action(mut self, signal: RoutingSignal) -> Self {
        self.next_action = Some(signal);
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.metadata.tokens_used = Some(tokens);
        self
    }

    pub fn with_cache_hit(mut self, hit: bool) -> Self {
        self.metadata.cache_hit = Some(hit);
        self
    }

    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.metadata.execution_time_ms = Some(ms);
        self
    }

    /// Whether at least one error allows a retry.
    pub fn has_retryable_error(&self) -> bool {
        self.errors.iter().any(|e| e.retryable)
    }

    /// The routing signal, defaulting to [`RoutingSignal::None`].
    pub fn routing(&self) -> RoutingSignal {
        self.next_action.unwrap_or_default()
    }

    /// Transform the payload, keeping everything else.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ToolResult<U> {
        ToolResult {
            success: self.success,
            data: self.data.map(f),
            short_summary: self.short_summary,
            detailed_summary: self.detailed_summary,
            confidence: self.confidence,
            metadata: self.metadata,
            next_action: self.next_action,
            errors: self.errors,
        }
    }
}

impl<T: Serialize> ToolResult<T> {
    /// Convert the payload to JSON, for run records and diagnostics.
    pub fn erase(self) -> ToolResult<Value> {
        self.map(|data| serde_json::to_value(data).unwrap_or(Value::Null))
    }
}

// ---------------------------------------------------------------------------
// ToolPhase / ToolStatus
// ---------------------------------------------------------------------------

/// Lifecycle phase of a step within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Starting,
    Executing,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl ToolPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Executing => "executing",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Failed -> Completed` is the fallback path.
    pub fn can_transition_to(&self, next: ToolPhase) -> bool {
        use ToolPhase::*;
        matches!(
            (self, next),
            (Starting, Executing)
                | (Executing, Processing | Completed | Failed)
                | (Processing, Processing | Completed | Failed)
                | (Failed, Retrying | Completed)
                | (Retrying, Executing)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ToolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A progress event for one step. Emitted, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStatus {
    pub tool: String,
    pub phase: ToolPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining_ms: Option<u64>,
}

impl ToolStatus {
    pub fn new(tool: impl Into<String>, phase: ToolPhase) -> Self {
        Self {
            tool: tool.into(),
            phase,
            progress: None,
            current_action: None,
            estimated_time_remaining_ms: None,
        }
    }

    /// Progress percentage, clamped to 100.
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.current_action = Some(action.into());
        self
    }

    pub fn with_eta_ms(mut self, ms: u64) -> Self {
        self.estimated_time_remaining_ms = Some(ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transitions_follow_state_machine() {
        use ToolPhase::*;
        assert!(Starting.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Failed.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Executing));
        assert!(Failed.can_transition_to(Completed));

        assert!(!Starting.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Executing));
        assert!(!Retrying.can_transition_to(Completed));
        assert!(!Executing.can_transition_to(Starting));
    }

    #[test]
    fn ok_result_clamps_confidence() {
        let result = ToolResult::ok(1u32, "done", 1.7);
        assert!(result.success);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.routing(), RoutingSignal::None);
    }

    #[test]
    fn failed_result_has_no_data() {
        let result: ToolResult<u32> = ToolResult::failed(
            "search failed",
            ToolError::new(ToolErrorKind::Network, "connection reset").retryable(true),
        );
        assert!(!result.success);
        assert!(result.data.is_none());
        assert!(result.has_retryable_error());
    }

    #[test]
    fn result_serializes_with_wire_names() {
        let result = ToolResult::ok("payload".to_string(), "ok", 0.9)
            .with_next_action(RoutingSignal::GeneralResponse)
            .with_execution_time(12);
        let json = serde_json::to_value(&result).expect("serialize");
        assert_eq!(json["shortSummary"], "ok");
        assert_eq!(json["nextAction"], "general_response");
        assert_eq!(json["metadata"]["executionTimeMs"], 12);

        let err = ToolError::new(ToolErrorKind::ApiLimit, "slow down").with_code("X");
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["type"], "api_limit");
        assert_eq!(json["code"], "X");
    }

    #[test]
    fn time_ceiling_is_four_times_estimate() {
        let descriptor = ToolDescriptor {
            name: "sample_step",
            description: "test",
            input_schema: Value::Null,
            retryable: true,
            estimated_duration: Duration::from_millis(250),
        };
        assert_eq!(descriptor.time_ceiling(), Duration::from_millis(1000));
    }
}
