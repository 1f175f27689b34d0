//! Streaming sink adapter.
//!
//! The caller hands the orchestrator a write-only [`StreamSink`]; the
//! [`StatusReporter`] formats step statuses into `{type, content}` lines and
//! writes them in the order transitions happen. Sink failures never reach the
//! pipeline: they are logged and dropped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use repoqa_shared::{RepoQaError, Result, ToolPhase, ToolStatus};

/// Kind of a streamed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Status,
    Progress,
    Result,
    Error,
    Done,
}

/// One line written to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub content: String,
}

impl StreamEvent {
    pub fn new(kind: EventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }
}

/// Append-only output channel owned by the caller.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn send(&self, event: StreamEvent) -> Result<()>;
}

/// Discards every event.
pub struct NullSink;

#[async_trait]
impl StreamSink for NullSink {
    async fn send(&self, _event: StreamEvent) -> Result<()> {
        Ok(())
    }
}

/// Forwards events over an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its owner drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StreamSink for ChannelSink {
    async fn send(&self, event: StreamEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| RepoQaError::Pipeline("stream receiver dropped".into()))
    }
}

/// Terminal state written as the final `done` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneState {
    Completed,
    Degraded,
    Failed,
    Aborted,
}

impl DoneState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

/// Formats pipeline events and writes them to a sink.
#[derive(Clone, Copy)]
pub struct StatusReporter<'a> {
    sink: &'a dyn StreamSink,
}

impl<'a> StatusReporter<'a> {
    pub fn new(sink: &'a dyn StreamSink) -> Self {
        Self { sink }
    }

    /// Emit a step status. `processing` statuses with a percentage go out as
    /// `progress` events, everything else as `status`.
    pub async fn status(&self, status: &ToolStatus) {
        let kind = match (status.phase, status.progress) {
            (ToolPhase::Processing, Some(_)) => EventKind::Progress,
            _ => EventKind::Status,
        };
        self.write(StreamEvent::new(kind, format_status(status))).await;
    }

    pub async fn result(&self, content: impl Into<String>) {
        self.write(StreamEvent::new(EventKind::Result, content)).await;
    }

    pub async fn error(&self, content: impl Into<String>) {
        self.write(StreamEvent::new(EventKind::Error, content)).await;
    }

    pub async fn done(&self, state: DoneState) {
        self.write(StreamEvent::new(EventKind::Done, state.as_str()))
            .await;
    }

    async fn write(&self, event: StreamEvent) {
        if let Err(e) = self.sink.send(event).await {
            debug!(error = %e, "stream write failed, event dropped");
        }
    }
}

/// `[tool] phase 40%: action (~1200ms left)`
pub fn format_status(status: &ToolStatus) -> String {
    let mut line = format!("[{}] {}", status.tool, status.phase);
    if let Some(progress) = status.progress {
        line.push_str(&format!(" {progress}%"));
    }
    if let Some(action) = &status.current_action {
        line.push_str(": ");
        line.push_str(action);
    }
    if let Some(eta) = status.estimated_time_remaining_ms {
        line.push_str(&format!(" (~{eta}ms left)"));
    }
    line
}

/// Records every event, for tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct CollectingSink {
    events: std::sync::Mutex<Vec<StreamEvent>>,
}

#[cfg(test)]
impl CollectingSink {
    pub(crate) fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().expect("sink lock").clone()
    }

    pub(crate) fn contents(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.content).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl StreamSink for CollectingSink {
    async fn send(&self, event: StreamEvent) -> Result<()> {
        self.events.lock().expect("sink lock").push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_as_type_and_content() {
        let event = StreamEvent::new(EventKind::Progress, "[repository_searcher] processing 50%");
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "progress");
        assert_eq!(json["content"], "[repository_searcher] processing 50%");
    }

    #[test]
    fn status_line_formatting() {
        let status = ToolStatus::new("query_analyzer", ToolPhase::Retrying).with_action("attempt 2 of 3");
        assert_eq!(format_status(&status), "[query_analyzer] retrying: attempt 2 of 3");

        let status = ToolStatus::new("repository_searcher", ToolPhase::Processing)
            .with_progress(66)
            .with_eta_ms(1700);
        assert_eq!(
            format_status(&status),
            "[repository_searcher] processing 66% (~1700ms left)"
        );
    }

    #[tokio::test]
    async fn reporter_routes_progress_events() {
        let sink = CollectingSink::default();
        let reporter = StatusReporter::new(&sink);

        reporter
            .status(&ToolStatus::new("relevance_checker", ToolPhase::Starting))
            .await;
        reporter
            .status(&ToolStatus::new("repository_searcher", ToolPhase::Processing).with_progress(50))
            .await;
        reporter.done(DoneState::Completed).await;

        let kinds: Vec<_> = sink.events().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Status, EventKind::Progress, EventKind::Done]
        );
    }

    #[tokio::test]
    async fn closed_channel_is_swallowed() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let reporter = StatusReporter::new(&sink);
        // Must not panic or propagate.
        reporter.result("answer").await;
        assert!(sink.send(StreamEvent::new(EventKind::Done, "x")).await.is_err());
    }
}
