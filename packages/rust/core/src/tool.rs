//! The step contract and the wrapper every step runs through.
//!
//! [`execute_tool`] validates input against the descriptor's schema, times
//! the step, and turns faults and panics into failed [`ToolResult`]s, so the
//! orchestrator only ever sees well-formed results.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use repoqa_shared::{
    BackendError, ToolDescriptor, ToolError, ToolErrorKind, ToolPhase, ToolResult, ToolStatus,
    codes,
};

use crate::schema;
use crate::sink::StatusReporter;

/// Fault raised by step logic. The wrapper converts it into an
/// `execution` error.
#[derive(Debug, thiserror::Error)]
pub enum ToolFault {
    #[error("{0}")]
    Logic(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Per-invocation context handed to a step.
#[derive(Clone, Copy)]
pub struct ToolContext<'a> {
    pub run_id: Uuid,
    pub reporter: StatusReporter<'a>,
}

impl<'a> ToolContext<'a> {
    pub fn new(run_id: Uuid, reporter: StatusReporter<'a>) -> Self {
        Self { run_id, reporter }
    }

    /// Emit a status event on behalf of the running step.
    pub async fn report(&self, status: ToolStatus) {
        self.reporter.status(&status).await;
    }
}

/// One pipeline step.
#[async_trait]
pub trait Tool: Send + Sync {
    type Input: Serialize + Sync;
    type Output: Serialize + Send;

    fn descriptor(&self) -> &ToolDescriptor;

    async fn run(
        &self,
        input: &Self::Input,
        ctx: &ToolContext<'_>,
    ) -> Result<ToolResult<Self::Output>, ToolFault>;
}

/// Run a step behind validation, timing and fault capture.
#[instrument(skip_all, fields(tool = tool.descriptor().name))]
pub async fn execute_tool<T>(
    tool: &T,
    input: &T::Input,
    ctx: &ToolContext<'_>,
) -> ToolResult<T::Output>
where
    T: Tool + ?Sized,
{
    let descriptor = tool.descriptor();
    ctx.report(ToolStatus::new(descriptor.name, ToolPhase::Executing))
        .await;

    let started = Instant::now();

    if let Err(message) = validate_input(descriptor, input) {
        debug!(%message, "input rejected");
        let result = ToolResult::failed(
            format!("{} received invalid input", descriptor.name),
            ToolError::invalid_input(message),
        )
        .with_execution_time(elapsed_ms(started));
        emit_outcome(descriptor, &result, ctx).await;
        return result;
    }

    let outcome = AssertUnwindSafe(tool.run(input, ctx)).catch_unwind().await;

    let mut result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(fault)) => {
            warn!(error = %fault, "step faulted");
            ToolResult::failed(
                format!("{} failed", descriptor.name),
                ToolError::new(ToolErrorKind::Execution, fault.to_string())
                    .with_code(codes::STEP_FAULT)
                    .retryable(descriptor.retryable),
            )
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(%message, "step panicked");
            ToolResult::failed(
                format!("{} failed", descriptor.name),
                ToolError::new(ToolErrorKind::Execution, message)
                    .with_code(codes::STEP_PANIC)
                    .retryable(descriptor.retryable),
            )
        }
    };

    if result.metadata.execution_time_ms.is_none() {
        result.metadata.execution_time_ms = Some(elapsed_ms(started));
    }
    if !result.success {
        result.data = None;
    }

    emit_outcome(descriptor, &result, ctx).await;
    result
}

fn validate_input<I: Serialize>(descriptor: &ToolDescriptor, input: &I) -> Result<(), String> {
    let value = serde_json::to_value(input).map_err(|e| format!("input not serializable: {e}"))?;
    schema::validate(&descriptor.input_schema, &value)
}

async fn emit_outcome<T>(descriptor: &ToolDescriptor, result: &ToolResult<T>, ctx: &ToolContext<'_>) {
    let phase = if result.success {
        ToolPhase::Completed
    } else {
        ToolPhase::Failed
    };
    ctx.report(ToolStatus::new(descriptor.name, phase).with_action(result.short_summary.clone()))
        .await;
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "step panicked".to_string()
    }
}
