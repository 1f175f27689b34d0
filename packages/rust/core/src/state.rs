//! Per-run state: step records and the typed shared context.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use repoqa_shared::{
    ContextAssessment, ConversationTurn, GeneratedResponse, QueryAnalysis, RankedDocument,
    RelevanceAssessment, RepoQaError, Result, SearchOutcome, ToolPhase, ToolResult,
};

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// The five pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    RelevanceChecker,
    QueryAnalyzer,
    ContextValidator,
    RepositorySearcher,
    ResponseGenerator,
}

impl StepKind {
    pub const ALL: [StepKind; 5] = [
        Self::RelevanceChecker,
        Self::QueryAnalyzer,
        Self::ContextValidator,
        Self::RepositorySearcher,
        Self::ResponseGenerator,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::RelevanceChecker => "relevance_checker",
            Self::QueryAnalyzer => "query_analyzer",
            Self::ContextValidator => "context_validator",
            Self::RepositorySearcher => "repository_searcher",
            Self::ResponseGenerator => "response_generator",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// A Critical failure of a non-essential step degrades instead of aborting.
    pub fn is_essential(&self) -> bool {
        !matches!(self, Self::RelevanceChecker)
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Named slot in the shared context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContextSlot {
    /// Prior conversation turns supplied by the caller.
    History,
    /// Documents retrieved by earlier turns.
    PriorResults,
    Step(StepKind),
}

/// A value stored in the shared context. The variant determines the slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "slot", content = "value", rename_all = "snake_case")]
pub enum ContextValue {
    History(Vec<ConversationTurn>),
    PriorResults(Vec<RankedDocument>),
    Relevance(RelevanceAssessment),
    Analysis(QueryAnalysis),
    ContextCheck(ContextAssessment),
    Search(SearchOutcome),
    Response(GeneratedResponse),
}

impl ContextValue {
    pub fn slot(&self) -> ContextSlot {
        match self {
            Self::History(_) => ContextSlot::History,
            Self::PriorResults(_) => ContextSlot::PriorResults,
            Self::Relevance(_) => ContextSlot::Step(StepKind::RelevanceChecker),
            Self::Analysis(_) => ContextSlot::Step(StepKind::QueryAnalyzer),
            Self::ContextCheck(_) => ContextSlot::Step(StepKind::ContextValidator),
            Self::Search(_) => ContextSlot::Step(StepKind::RepositorySearcher),
            Self::Response(_) => ContextSlot::Step(StepKind::ResponseGenerator),
        }
    }
}

/// Accumulating outputs of earlier steps. Entries are write-once.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    slots: BTreeMap<ContextSlot, ContextValue>,
}

impl SharedContext {
    /// Store a value under its slot. Fails if the slot is already filled.
    pub fn insert(&mut self, value: ContextValue) -> Result<()> {
        let slot = value.slot();
        if self.slots.contains_key(&slot) {
            return Err(RepoQaError::Pipeline(format!(
                "context slot {slot:?} is already filled"
            )));
        }
        self.slots.insert(slot, value);
        Ok(())
    }

    pub fn contains(&self, slot: ContextSlot) -> bool {
        self.slots.contains_key(&slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn step(&self, kind: StepKind) -> Option<&ContextValue> {
        self.slots.get(&ContextSlot::Step(kind))
    }

    pub fn history(&self) -> &[ConversationTurn] {
        match self.slots.get(&ContextSlot::History) {
            Some(ContextValue::History(turns)) => turns,
            _ => &[],
        }
    }

    pub fn prior_results(&self) -> &[RankedDocument] {
        match self.slots.get(&ContextSlot::PriorResults) {
            Some(ContextValue::PriorResults(docs)) => docs,
            _ => &[],
        }
    }

    pub fn relevance(&self) -> Option<&RelevanceAssessment> {
        match self.step(StepKind::RelevanceChecker) {
            Some(ContextValue::Relevance(v)) => Some(v),
            _ => None,
        }
    }

    pub fn analysis(&self) -> Option<&QueryAnalysis> {
        match self.step(StepKind::QueryAnalyzer) {
            Some(ContextValue::Analysis(v)) => Some(v),
            _ => None,
        }
    }

    pub fn context_check(&self) -> Option<&ContextAssessment> {
        match self.step(StepKind::ContextValidator) {
            Some(ContextValue::ContextCheck(v)) => Some(v),
            _ => None,
        }
    }

    pub fn search(&self) -> Option<&SearchOutcome> {
        match self.step(StepKind::RepositorySearcher) {
            Some(ContextValue::Search(v)) => Some(v),
            _ => None,
        }
    }

    pub fn response(&self) -> Option<&GeneratedResponse> {
        match self.step(StepKind::ResponseGenerator) {
            Some(ContextValue::Response(v)) => Some(v),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Step records
// ---------------------------------------------------------------------------

/// Bookkeeping for one step within a run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRecord {
    pub phase: Option<ToolPhase>,
    pub skipped: bool,
    pub last_result: Option<ToolResult<Value>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl ToolRecord {
    /// Move to `next`, enforcing the phase state machine.
    pub fn transition(&mut self, next: ToolPhase) -> Result<()> {
        let allowed = match self.phase {
            None => next == ToolPhase::Starting,
            Some(current) => current.can_transition_to(next),
        };
        if !allowed {
            return Err(RepoQaError::Pipeline(format!(
                "illegal phase transition {:?} -> {next}",
                self.phase
            )));
        }

        let now = Utc::now();
        match next {
            ToolPhase::Starting => self.started_at = Some(now),
            ToolPhase::Executing => self.attempts += 1,
            ToolPhase::Completed | ToolPhase::Failed => self.finished_at = Some(now),
            _ => {}
        }
        self.phase = Some(next);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// State of one pipeline run. Owned by a single orchestrator invocation.
#[derive(Debug)]
pub struct RunState {
    pub id: Uuid,
    pub user_id: String,
    pub original_query: String,
    current_step_index: usize,
    pub total_steps: usize,
    pub records: BTreeMap<StepKind, ToolRecord>,
    pub context: SharedContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(user_id: impl Into<String>, query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            user_id: user_id.into(),
            original_query: query.into(),
            current_step_index: 0,
            total_steps: StepKind::ALL.len(),
            records: StepKind::ALL
                .iter()
                .map(|k| (*k, ToolRecord::default()))
                .collect(),
            context: SharedContext::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    /// Move the cursor forward. Moving backwards is an invalid state.
    pub fn advance_to(&mut self, index: usize) -> Result<()> {
        if index < self.current_step_index {
            return Err(RepoQaError::Pipeline(format!(
                "step index cannot move backwards ({} -> {index})",
                self.current_step_index
            )));
        }
        self.current_step_index = index.min(self.total_steps);
        self.touch();
        Ok(())
    }

    pub fn record(&self, kind: StepKind) -> &ToolRecord {
        // Every step has a record from construction.
        &self.records[&kind]
    }

    pub fn transition(&mut self, kind: StepKind, next: ToolPhase) -> Result<()> {
        let record = self.records.entry(kind).or_default();
        record.transition(next)?;
        self.touch();
        Ok(())
    }

    pub fn mark_skipped(&mut self, kind: StepKind) {
        self.records.entry(kind).or_default().skipped = true;
        self.touch();
    }

    pub fn store_result(&mut self, kind: StepKind, result: ToolResult<Value>) {
        self.records.entry(kind).or_default().last_result = Some(result);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
