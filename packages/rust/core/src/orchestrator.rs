//! The orchestrator: runs the five steps in order for one query.
//!
//! Relevance check → query analysis → context validation → repository
//! search → response generation. Each step goes through [`execute_tool`]
//! under a per-attempt time ceiling and the [`RetryPolicy`]; a final
//! failure is classified and either replaced by the step's fallback or
//! aborts the run. Routing signals from a step bypass later steps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use repoqa_shared::{
    ConversationTurn, DocumentCompressor, GeneratedResponse, LanguageBackend, PipelineConfig,
    RankedDocument, RepoQaError, RoutingSignal, SearchBackend, SearchParams, ToolError,
    ToolErrorKind, ToolPhase, ToolResult, ToolStatus, codes,
};

use crate::cache::ResultCache;
use crate::classifier::{RecoveryAction, classify};
use crate::retry::RetryPolicy;
use crate::sink::{DoneState, StatusReporter, StreamSink};
use crate::state::{ContextValue, RunState, StepKind, ToolRecord};
use crate::steps::{
    AnalyzerInput, AnswerMode, ContextValidator, GeneratorInput, GeneratorSettings,
    QueryAnalyzer, RelevanceChecker, RelevanceInput, RepositorySearcher, ResponseGenerator,
    SearcherInput, ValidatorInput,
};
use crate::tool::{Tool, ToolContext, execute_tool};

/// Shown to the user when a run aborts.
pub const ABORT_MESSAGE: &str = "Sorry, I could not complete your request.";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// External collaborators the steps call.
#[derive(Clone)]
pub struct Backends {
    pub language: Arc<dyn LanguageBackend>,
    pub search: Arc<dyn SearchBackend>,
    pub compressor: Arc<dyn DocumentCompressor>,
    pub cache: Option<Arc<dyn ResultCache>>,
}

/// One query to answer.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub query: String,
    pub user_id: String,
    pub history: Vec<ConversationTurn>,
    /// Documents retrieved by earlier turns of the conversation.
    pub prior_results: Vec<RankedDocument>,
    /// Overrides the configured repositories when non-empty.
    pub repositories: Vec<String>,
}

impl RunRequest {
    pub fn new(query: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user_id: user_id.into(),
            ..Self::default()
        }
    }
}

/// Cooperative cancellation, checked before each step and after each retry backoff.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    /// Completed, but at least one step ran on its fallback.
    Degraded,
    /// A Critical failure stopped the run.
    Aborted,
    Cancelled,
}

/// A wait before a retry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRecord {
    pub tool: String,
    /// The attempt that failed, 1-based.
    pub attempt: u32,
    pub delay_ms: u64,
}

/// What the caller gets back. Never an error: failures are described here.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub success: bool,
    pub short_summary: String,
    pub answer: Option<GeneratedResponse>,
    /// Best answer available when the run aborted.
    pub partial_answer: Option<String>,
    pub tools_executed: Vec<String>,
    pub degraded_steps: Vec<String>,
    pub error_message: Option<String>,
    pub attempts: BTreeMap<String, u32>,
    pub retry_delays: Vec<RetryRecord>,
    pub records: BTreeMap<String, ToolRecord>,
}

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

/// Why a run stopped early.
#[derive(Debug)]
enum Halt {
    Abort {
        step: Option<StepKind>,
        reason: String,
    },
    Cancelled {
        at: StepKind,
        /// Cancelled between attempts rather than before the step started.
        retrying: bool,
    },
}

impl From<RepoQaError> for Halt {
    fn from(e: RepoQaError) -> Self {
        Halt::Abort {
            step: None,
            reason: format!("{}: {e}", codes::INVALID_STATE),
        }
    }
}

/// Routing decisions accumulated during a run.
#[derive(Debug, Default, Clone, Copy)]
struct Route {
    general: bool,
    skip_search: bool,
}

impl Route {
    fn apply(&mut self, signal: RoutingSignal, step: StepKind) -> Result<(), Halt> {
        match signal {
            RoutingSignal::None => {}
            RoutingSignal::GeneralResponse => self.general = true,
            RoutingSignal::SkipSearch => self.skip_search = true,
            RoutingSignal::Abort => {
                return Err(Halt::Abort {
                    step: Some(step),
                    reason: format!("{step} requested abort"),
                });
            }
        }
        Ok(())
    }

    fn bypasses(&self, kind: StepKind) -> bool {
        match kind {
            StepKind::RelevanceChecker | StepKind::ResponseGenerator => false,
            StepKind::QueryAnalyzer | StepKind::ContextValidator => self.general,
            StepKind::RepositorySearcher => self.general || self.skip_search,
        }
    }
}

struct Run<'a> {
    state: RunState,
    reporter: StatusReporter<'a>,
    cancel: &'a CancellationFlag,
    route: Route,
    tools_executed: Vec<String>,
    degraded: Vec<String>,
    retry_delays: Vec<RetryRecord>,
}

impl Run<'_> {
    /// Cancellation check and cursor move before a step.
    fn enter(&mut self, kind: StepKind) -> Result<(), Halt> {
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled {
                at: kind,
                retrying: false,
            });
        }
        self.state.advance_to(kind.index())?;
        Ok(())
    }

    fn skip(&mut self, kind: StepKind) -> Result<(), Halt> {
        debug!(step = %kind, "step bypassed");
        self.state.mark_skipped(kind);
        self.state.advance_to(kind.index() + 1)?;
        Ok(())
    }

    fn leave(&mut self, kind: StepKind) -> Result<(), Halt> {
        self.state.advance_to(kind.index() + 1)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: PipelineConfig,
    retry: RetryPolicy,
    search: Arc<dyn SearchBackend>,
    relevance: RelevanceChecker,
    analyzer: QueryAnalyzer,
    validator: ContextValidator,
    searcher: RepositorySearcher,
    generator: ResponseGenerator,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, backends: Backends) -> Self {
        let settings = GeneratorSettings {
            relevance_floor: config.relevance_floor,
            max_sources: config.max_sources,
            source_token_budget: config.source_token_budget,
        };
        Self {
            retry: RetryPolicy::from(&config.retry),
            search: backends.search.clone(),
            relevance: RelevanceChecker::new(backends.language.clone()),
            analyzer: QueryAnalyzer::new(backends.language.clone()),
            validator: ContextValidator::new(backends.language.clone()),
            searcher: RepositorySearcher::new(
                backends.search,
                backends.compressor.clone(),
                backends.cache,
                Duration::from_secs(config.cache_ttl_secs),
            ),
            generator: ResponseGenerator::new(backends.language, backends.compressor, settings),
            config,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Answer one query, streaming progress to `sink`.
    #[instrument(skip_all, fields(user = %request.user_id))]
    pub async fn run(
        &self,
        request: RunRequest,
        sink: &dyn StreamSink,
        cancel: &CancellationFlag,
    ) -> RunOutcome {
        let mut run = Run {
            state: RunState::new(request.user_id.clone(), request.query.clone()),
            reporter: StatusReporter::new(sink),
            cancel,
            route: Route::default(),
            tools_executed: Vec::new(),
            degraded: Vec::new(),
            retry_delays: Vec::new(),
        };
        info!(run_id = %run.state.id, "run started");

        let driven = self.drive(&mut run, &request).await;
        self.finish(run, driven).await
    }

    async fn drive(
        &self,
        run: &mut Run<'_>,
        request: &RunRequest,
    ) -> Result<GeneratedResponse, Halt> {
        run.state
            .context
            .insert(ContextValue::History(request.history.clone()))?;
        run.state
            .context
            .insert(ContextValue::PriorResults(request.prior_results.clone()))?;

        // --- Relevance ---
        let kind = StepKind::RelevanceChecker;
        run.enter(kind)?;
        let input = RelevanceInput {
            query: request.query.clone(),
            domain_description: self.config.domain_description.clone(),
            known_domains: self.config.domains.clone(),
        };
        let (relevance, signal) = self
            .step(run, kind, &self.relevance, &input, RelevanceChecker::fallback)
            .await?;
        run.state.context.insert(ContextValue::Relevance(relevance))?;
        run.route.apply(signal, kind)?;
        run.leave(kind)?;

        // --- Analysis ---
        let kind = StepKind::QueryAnalyzer;
        if run.route.bypasses(kind) {
            run.skip(kind)?;
        } else {
            run.enter(kind)?;
            let input = AnalyzerInput {
                query: request.query.clone(),
                relevance: run.state.context.relevance().cloned(),
                available_repositories: self.available_repositories(request).await,
            };
            let (analysis, signal) = self
                .step(run, kind, &self.analyzer, &input, || QueryAnalyzer::fallback(&input))
                .await?;
            run.state.context.insert(ContextValue::Analysis(analysis))?;
            run.route.apply(signal, kind)?;
            run.leave(kind)?;
        }

        // --- Context validation ---
        let kind = StepKind::ContextValidator;
        if run.route.bypasses(kind) {
            run.skip(kind)?;
        } else {
            run.enter(kind)?;
            let analysis = run
                .state
                .context
                .analysis()
                .cloned()
                .ok_or_else(|| RepoQaError::Pipeline("query analysis missing".into()))?;
            let input = ValidatorInput {
                query: request.query.clone(),
                analysis,
                history: run.state.context.history().to_vec(),
                prior_results: run.state.context.prior_results().to_vec(),
            };
            let (assessment, signal) = self
                .step(run, kind, &self.validator, &input, ContextValidator::fallback)
                .await?;
            run.state.context.insert(ContextValue::ContextCheck(assessment))?;
            run.route.apply(signal, kind)?;
            run.leave(kind)?;
        }

        // --- Search ---
        let kind = StepKind::RepositorySearcher;
        if run.route.bypasses(kind) {
            run.skip(kind)?;
        } else {
            run.enter(kind)?;
            let analysis = run
                .state
                .context
                .analysis()
                .cloned()
                .ok_or_else(|| RepoQaError::Pipeline("query analysis missing".into()))?;
            let input = SearcherInput {
                query: request.query.clone(),
                user_id: request.user_id.clone(),
                strategy: analysis.strategy,
                repositories: analysis.repositories,
                keywords: analysis.keywords,
                params: SearchParams {
                    max_results: self.config.max_results,
                    min_similarity: self.config.min_similarity,
                },
            };
            let (outcome, signal) = self
                .step(run, kind, &self.searcher, &input, || RepositorySearcher::fallback(&input))
                .await?;
            run.state.context.insert(ContextValue::Search(outcome))?;
            run.route.apply(signal, kind)?;
            run.leave(kind)?;
        }

        // --- Response ---
        let kind = StepKind::ResponseGenerator;
        run.enter(kind)?;
        let context = &run.state.context;
        let input = if run.route.general {
            GeneratorInput {
                query: request.query.clone(),
                mode: AnswerMode::General,
                documents: Vec::new(),
                suggested_response: None,
                analysis: None,
                history: context.history().to_vec(),
            }
        } else {
            let documents = match context.search() {
                Some(outcome) => outcome.results.clone(),
                None => context.prior_results().to_vec(),
            };
            GeneratorInput {
                query: request.query.clone(),
                mode: AnswerMode::Grounded,
                documents,
                suggested_response: context
                    .context_check()
                    .and_then(|c| c.suggested_response.clone()),
                analysis: context.analysis().cloned(),
                history: context.history().to_vec(),
            }
        };
        let (response, _) = self
            .step(run, kind, &self.generator, &input, || self.generator.fallback(&input))
            .await?;
        run.state
            .context
            .insert(ContextValue::Response(response.clone()))?;
        run.leave(kind)?;

        Ok(response)
    }

    /// Run one step to a usable output: retries, then classification.
    #[instrument(skip_all, fields(step = %kind))]
    async fn step<T>(
        &self,
        run: &mut Run<'_>,
        kind: StepKind,
        tool: &T,
        input: &T::Input,
        fallback: impl FnOnce() -> T::Output,
    ) -> Result<(T::Output, RoutingSignal), Halt>
    where
        T: Tool,
        T::Output: Clone,
    {
        let descriptor = tool.descriptor();
        let name = descriptor.name;
        let max_attempts = self.retry.max_attempts(descriptor);
        let estimate_ms = millis(descriptor.estimated_duration);

        run.state.transition(kind, ToolPhase::Starting)?;
        run.reporter
            .status(&ToolStatus::new(name, ToolPhase::Starting).with_eta_ms(estimate_ms))
            .await;
        run.tools_executed.push(name.to_string());

        let ctx = ToolContext::new(run.state.id, run.reporter);
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            run.state.transition(kind, ToolPhase::Executing)?;
            let result = self.attempt(tool, input, &ctx).await;

            if result.success && result.data.is_some() {
                run.state.transition(kind, ToolPhase::Completed)?;
                break result;
            }
            run.state.transition(kind, ToolPhase::Failed)?;

            if !self.retry.should_retry(descriptor, &result, attempt) {
                break result;
            }
            let delay = self.retry.delay_for(attempt);
            let delay_ms = millis(delay);
            warn!(attempt, max_attempts, delay_ms, summary = %result.short_summary, "attempt failed, retrying");
            run.retry_delays.push(RetryRecord {
                tool: name.to_string(),
                attempt,
                delay_ms,
            });
            run.state.store_result(kind, result.erase());
            run.state.transition(kind, ToolPhase::Retrying)?;
            run.reporter
                .status(
                    &ToolStatus::new(name, ToolPhase::Retrying)
                        .with_action(format!("attempt {} of {max_attempts}", attempt + 1))
                        .with_eta_ms(delay_ms + estimate_ms),
                )
                .await;
            tokio::time::sleep(delay).await;
            if run.cancel.is_cancelled() {
                return Err(Halt::Cancelled {
                    at: kind,
                    retrying: true,
                });
            }
        };

        let signal = result.routing();
        if let (true, Some(data)) = (result.success, result.data.clone()) {
            debug!(attempts = attempt, "step completed");
            run.state.store_result(kind, result.erase());
            return Ok((data, signal));
        }

        let classification = classify(&result, kind.is_essential(), true);
        run.state.store_result(kind, result.erase());

        match classification.action {
            RecoveryAction::Abort => {
                warn!(severity = classification.severity.as_str(), reason = %classification.reason, "step failed critically");
                Err(Halt::Abort {
                    step: Some(kind),
                    reason: classification.reason,
                })
            }
            RecoveryAction::ContinueWithFallback | RecoveryAction::Retry => {
                warn!(severity = classification.severity.as_str(), reason = %classification.reason, "step degraded, using fallback");
                run.state.transition(kind, ToolPhase::Completed)?;
                run.reporter
                    .status(&ToolStatus::new(name, ToolPhase::Completed).with_action("using fallback"))
                    .await;
                run.degraded.push(name.to_string());
                Ok((fallback(), RoutingSignal::None))
            }
        }
    }

    /// One wrapped invocation bounded by the step's time ceiling.
    async fn attempt<T: Tool>(
        &self,
        tool: &T,
        input: &T::Input,
        ctx: &ToolContext<'_>,
    ) -> ToolResult<T::Output> {
        let descriptor = tool.descriptor();
        let ceiling = descriptor.time_ceiling();

        match tokio::time::timeout(ceiling, execute_tool(tool, input, ctx)).await {
            Ok(result) => result,
            Err(_) => {
                let ceiling_ms = millis(ceiling);
                ctx.report(
                    ToolStatus::new(descriptor.name, ToolPhase::Failed)
                        .with_action(format!("timed out after {ceiling_ms}ms")),
                )
                .await;
                ToolResult::failed(
                    format!("{} timed out", descriptor.name),
                    ToolError::new(
                        ToolErrorKind::Timeout,
                        format!("exceeded the {ceiling_ms}ms time ceiling"),
                    )
                    .with_code(codes::TIME_CEILING)
                    .retryable(descriptor.retryable),
                )
                .with_execution_time(ceiling_ms)
            }
        }
    }

    /// Request override, then configuration, then whatever the index holds.
    async fn available_repositories(&self, request: &RunRequest) -> Vec<String> {
        if !request.repositories.is_empty() {
            return request.repositories.clone();
        }
        if !self.config.repositories.is_empty() {
            return self.config.repositories.clone();
        }
        match self.search.repositories().await {
            Ok(repositories) => repositories,
            Err(e) => {
                warn!(error = %e, "could not list repositories");
                Vec::new()
            }
        }
    }

    async fn finish(&self, run: Run<'_>, driven: Result<GeneratedResponse, Halt>) -> RunOutcome {
        let Run {
            state,
            reporter,
            tools_executed,
            degraded,
            retry_delays,
            ..
        } = run;

        let attempts = state
            .records
            .iter()
            .filter(|(_, r)| r.attempts > 0)
            .map(|(k, r)| (k.name().to_string(), r.attempts))
            .collect();
        let partial_answer = state
            .context
            .context_check()
            .and_then(|c| c.suggested_response.clone());
        let records = state
            .records
            .iter()
            .map(|(k, r)| (k.name().to_string(), r.clone()))
            .collect();

        let mut outcome = RunOutcome {
            run_id: state.id,
            status: RunStatus::Completed,
            success: true,
            short_summary: String::new(),
            answer: None,
            partial_answer: None,
            tools_executed,
            degraded_steps: degraded,
            error_message: None,
            attempts,
            retry_delays,
            records,
        };

        match driven {
            Ok(answer) => {
                let sources = answer.source_documents.len();
                outcome.short_summary = if outcome.degraded_steps.is_empty() {
                    format!("Answered citing {sources} sources")
                } else {
                    outcome.status = RunStatus::Degraded;
                    format!(
                        "Answered citing {sources} sources with {} degraded steps",
                        outcome.degraded_steps.len()
                    )
                };
                reporter.result(answer.answer.clone()).await;
                reporter
                    .done(if outcome.status == RunStatus::Degraded {
                        DoneState::Degraded
                    } else {
                        DoneState::Completed
                    })
                    .await;
                info!(run_id = %outcome.run_id, status = ?outcome.status, sources, "run finished");
                outcome.answer = Some(answer);
            }
            Err(Halt::Abort { step, reason }) => {
                warn!(run_id = %outcome.run_id, ?step, %reason, "run aborted");
                outcome.status = RunStatus::Aborted;
                outcome.success = false;
                outcome.short_summary = match step {
                    Some(step) => format!("{step} failed: {reason}"),
                    None => format!("run failed: {reason}"),
                };
                outcome.error_message = Some(ABORT_MESSAGE.to_string());
                reporter.error(ABORT_MESSAGE).await;
                if let Some(partial) = &partial_answer {
                    reporter.result(partial.clone()).await;
                }
                reporter.done(DoneState::Failed).await;
                outcome.partial_answer = partial_answer;
            }
            Err(Halt::Cancelled { at, retrying }) => {
                info!(run_id = %outcome.run_id, step = %at, retrying, "run cancelled");
                outcome.status = RunStatus::Cancelled;
                outcome.success = false;
                outcome.short_summary = if retrying {
                    format!("Cancelled while retrying {at}")
                } else {
                    format!("Cancelled before {at}")
                };
                reporter.done(DoneState::Aborted).await;
            }
        }
        outcome
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::KeywordCompressor;
    use crate::sink::{CollectingSink, EventKind, StreamEvent};
    use crate::testing::{ScriptedLanguage, ScriptedSearch, hit};
    use async_trait::async_trait;
    use repoqa_shared::{AnalysisTask, BackendError, SearchMode};
    use serde_json::json;

    fn relevant() -> serde_json::Value {
        json!({ "isRelevant": true, "confidence": 0.9, "domains": ["modflow"], "reasoning": "modflow option" })
    }

    fn hybrid_plan() -> serde_json::Value {
        json!({
            "strategy": "hybrid",
            "repositories": ["mf6", "flopy"],
            "keywords": ["maxcompdim"],
            "expectedResultTypes": ["documentation"]
        })
    }

    fn answer() -> serde_json::Value {
        json!({ "answer": "MAXCOMPDIM limits model dimensions [1].", "confidence": 0.85 })
    }

    fn in_domain_language() -> ScriptedLanguage {
        ScriptedLanguage::new()
            .answer(AnalysisTask::RelevanceCheck, relevant())
            .answer(AnalysisTask::QueryAnalysis, hybrid_plan())
            .answer(AnalysisTask::ResponseSynthesis, answer())
    }

    fn two_repositories() -> ScriptedSearch {
        ScriptedSearch::new()
            .hits("mf6", SearchMode::Text, vec![hit("mf6", "doc/dis.md", 0.9)])
            .hits("flopy", SearchMode::Semantic, vec![hit("flopy", "flopy/mf6/dis.py", 0.8)])
    }

    fn orchestrator(language: Arc<ScriptedLanguage>, search: Arc<ScriptedSearch>) -> Orchestrator {
        Orchestrator::new(
            PipelineConfig::default(),
            Backends {
                language,
                search,
                compressor: Arc::new(KeywordCompressor),
                cache: None,
            },
        )
    }

    #[tokio::test]
    async fn modflow_question_runs_every_step() {
        let language = Arc::new(in_domain_language());
        let search = Arc::new(two_repositories());
        let sink = CollectingSink::default();

        let outcome = orchestrator(language.clone(), search.clone())
            .run(
                RunRequest::new("what is maxcompdim in modflow", "u1"),
                &sink,
                &CancellationFlag::new(),
            )
            .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(outcome.success);
        assert_eq!(
            outcome.tools_executed,
            StepKind::ALL.iter().map(|k| k.name()).collect::<Vec<_>>()
        );
        let answer = outcome.answer.expect("answer");
        assert!(!answer.answer.is_empty());
        assert_eq!(answer.source_documents.len(), 2);
        assert_eq!(search.calls(), 4);
        // No history: the validator answers without the model.
        assert_eq!(language.calls(AnalysisTask::ContextValidation), 0);

        let events = sink.events();
        assert_eq!(
            events.first().map(|e| e.content.as_str()),
            Some("[relevance_checker] starting (~2000ms left)")
        );
        assert_eq!(
            events.last(),
            Some(&StreamEvent::new(EventKind::Done, "completed"))
        );
        assert!(events.iter().any(|e| e.kind == EventKind::Progress));
    }

    #[tokio::test]
    async fn out_of_domain_query_answers_generally() {
        let language = Arc::new(
            ScriptedLanguage::new()
                .answer(
                    AnalysisTask::RelevanceCheck,
                    json!({ "isRelevant": false, "confidence": 0.95, "reasoning": "cooking" }),
                )
                .answer(
                    AnalysisTask::GeneralResponse,
                    json!({ "answer": "I can only help with groundwater modelling questions.", "confidence": 0.7 }),
                ),
        );
        let search = Arc::new(two_repositories());

        let outcome = orchestrator(language.clone(), search.clone())
            .run(
                RunRequest::new("how to cook pasta", "u1"),
                &CollectingSink::default(),
                &CancellationFlag::new(),
            )
            .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(search.calls(), 0);
        assert_eq!(language.calls(AnalysisTask::QueryAnalysis), 0);
        assert_eq!(language.calls(AnalysisTask::ContextValidation), 0);
        assert_eq!(outcome.tools_executed, vec!["relevance_checker", "response_generator"]);
        for skipped in ["query_analyzer", "context_validator", "repository_searcher"] {
            assert!(outcome.records[skipped].skipped);
            assert_eq!(outcome.records[skipped].attempts, 0);
        }
        assert!(outcome.answer.expect("answer").source_documents.is_empty());
    }

    #[tokio::test]
    async fn sufficient_context_never_searches() {
        let language = Arc::new(
            in_domain_language().answer(
                AnalysisTask::ContextValidation,
                json!({
                    "needsNewSearch": false,
                    "contextSufficiency": 0.9,
                    "suggestedResponse": "MAXCOMPDIM defaults to 3.",
                    "reasoning": "answered in the previous turn"
                }),
            ),
        );
        let search = Arc::new(two_repositories());
        let prior = RankedDocument::from_hit(hit("mf6", "doc/dis.md", 0.9), SearchMode::Text);

        let mut request = RunRequest::new("and its default?", "u1");
        request.history = vec![
            ConversationTurn::user("what is maxcompdim"),
            ConversationTurn::assistant("It limits model dimensions."),
        ];
        request.prior_results = vec![prior];

        let outcome = orchestrator(language.clone(), search.clone())
            .run(request, &CollectingSink::default(), &CancellationFlag::new())
            .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(search.calls(), 0);
        assert!(outcome.records["repository_searcher"].skipped);
        let prompt = &language.prompts(AnalysisTask::ResponseSynthesis)[0];
        assert!(prompt.contains("MAXCOMPDIM defaults to 3."));
        assert!(prompt.contains("mf6/doc/dis.md"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        for failures in 0..=2u32 {
            let mut language = ScriptedLanguage::new().answer(AnalysisTask::RelevanceCheck, relevant());
            for _ in 0..failures {
                language = language.fail(AnalysisTask::QueryAnalysis, BackendError::Network("reset".into()));
            }
            let language = Arc::new(
                language
                    .answer(AnalysisTask::QueryAnalysis, hybrid_plan())
                    .answer(AnalysisTask::ResponseSynthesis, answer()),
            );

            let outcome = orchestrator(language, Arc::new(two_repositories()))
                .run(
                    RunRequest::new("what is maxcompdim", "u1"),
                    &CollectingSink::default(),
                    &CancellationFlag::new(),
                )
                .await;

            assert_eq!(outcome.status, RunStatus::Completed, "{failures} failures");
            assert_eq!(outcome.attempts["query_analyzer"], failures + 1);
            assert_eq!(outcome.retry_delays.len(), failures as usize);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fall_back_with_bounded_delays() {
        let language = Arc::new(
            ScriptedLanguage::new()
                .answer(AnalysisTask::RelevanceCheck, relevant())
                .fail(AnalysisTask::QueryAnalysis, BackendError::RateLimited("429".into()))
                .answer(AnalysisTask::ResponseSynthesis, answer()),
        );
        let search = Arc::new(two_repositories());
        let sink = CollectingSink::default();

        let outcome = orchestrator(language.clone(), search.clone())
            .run(RunRequest::new("what is maxcompdim", "u1"), &sink, &CancellationFlag::new())
            .await;

        assert_eq!(language.calls(AnalysisTask::QueryAnalysis), 3);
        assert_eq!(outcome.attempts["query_analyzer"], 3);
        assert_eq!(outcome.status, RunStatus::Degraded);
        assert_eq!(outcome.degraded_steps, vec!["query_analyzer"]);

        let record = &outcome.records["query_analyzer"];
        let last = record.last_result.as_ref().expect("last result");
        assert!(!last.success);
        assert_eq!(last.errors[0].kind, ToolErrorKind::ApiLimit);

        assert_eq!(outcome.retry_delays.len(), 2);
        for record in &outcome.retry_delays {
            let base = 1000 * 2u64.pow(record.attempt - 1);
            assert!(record.delay_ms >= base, "{record:?}");
            assert!(record.delay_ms <= base.min(8000) + 1000, "{record:?}");
        }

        assert!(sink.contents().contains(&"[query_analyzer] completed: using fallback".to_string()));
        // Fallback analysis searches everything with a hybrid strategy.
        assert_eq!(search.calls(), 4);
        assert!(outcome.answer.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_step_hits_the_time_ceiling() {
        let language = Arc::new(
            in_domain_language().delay(AnalysisTask::QueryAnalysis, Duration::from_secs(30)),
        );

        let outcome = orchestrator(language.clone(), Arc::new(two_repositories()))
            .run(
                RunRequest::new("what is maxcompdim", "u1"),
                &CollectingSink::default(),
                &CancellationFlag::new(),
            )
            .await;

        assert_eq!(outcome.status, RunStatus::Degraded);
        assert_eq!(outcome.attempts["query_analyzer"], 3);
        let last = outcome.records["query_analyzer"]
            .last_result
            .clone()
            .expect("last result");
        assert_eq!(last.errors[0].kind, ToolErrorKind::Timeout);
        assert!(last.errors[0].has_code(codes::TIME_CEILING));
    }

    #[tokio::test]
    async fn critical_failure_aborts_with_message() {
        let language = Arc::new(in_domain_language());
        let search = Arc::new(
            ScriptedSearch::new()
                .failing("mf6", BackendError::Unavailable("index missing".into()))
                .failing("flopy", BackendError::Unavailable("index missing".into())),
        );
        let sink = CollectingSink::default();

        let outcome = orchestrator(language.clone(), search)
            .run(RunRequest::new("what is maxcompdim", "u1"), &sink, &CancellationFlag::new())
            .await;

        assert_eq!(outcome.status, RunStatus::Aborted);
        assert!(!outcome.success);
        assert_eq!(outcome.error_message.as_deref(), Some(ABORT_MESSAGE));
        assert!(outcome.answer.is_none());
        assert!(outcome.short_summary.starts_with("repository_searcher failed"));
        assert_eq!(language.calls(AnalysisTask::ResponseSynthesis), 0);

        let events = sink.events();
        assert!(events.contains(&StreamEvent::new(EventKind::Error, ABORT_MESSAGE)));
        assert_eq!(events.last(), Some(&StreamEvent::new(EventKind::Done, "failed")));
    }

    #[tokio::test]
    async fn non_essential_critical_failure_degrades() {
        let language = Arc::new(
            ScriptedLanguage::new()
                .fail(AnalysisTask::RelevanceCheck, BackendError::MissingCredentials("401".into()))
                .answer(AnalysisTask::QueryAnalysis, hybrid_plan())
                .answer(AnalysisTask::ResponseSynthesis, answer()),
        );

        let outcome = orchestrator(language.clone(), Arc::new(two_repositories()))
            .run(
                RunRequest::new("what is maxcompdim", "u1"),
                &CollectingSink::default(),
                &CancellationFlag::new(),
            )
            .await;

        assert_eq!(outcome.status, RunStatus::Degraded);
        assert!(outcome.success);
        assert_eq!(outcome.degraded_steps, vec!["relevance_checker"]);
        // Missing credentials are never retried.
        assert_eq!(language.calls(AnalysisTask::RelevanceCheck), 1);
    }

    /// Sink that cancels the run once a given line has been written.
    struct CancelOn {
        inner: CollectingSink,
        line: &'static str,
        flag: CancellationFlag,
    }

    #[async_trait]
    impl StreamSink for CancelOn {
        async fn send(&self, event: StreamEvent) -> repoqa_shared::Result<()> {
            if event.content.starts_with(self.line) {
                self.flag.cancel();
            }
            self.inner.send(event).await
        }
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_step() {
        let language = Arc::new(in_domain_language());
        let search = Arc::new(two_repositories());
        let flag = CancellationFlag::new();
        let sink = CancelOn {
            inner: CollectingSink::default(),
            line: "[relevance_checker] completed",
            flag: flag.clone(),
        };

        let outcome = orchestrator(language.clone(), search.clone())
            .run(RunRequest::new("what is maxcompdim", "u1"), &sink, &flag)
            .await;

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(!outcome.success);
        assert_eq!(outcome.tools_executed, vec!["relevance_checker"]);
        assert_eq!(language.calls(AnalysisTask::QueryAnalysis), 0);
        assert_eq!(search.calls(), 0);
        assert_eq!(
            sink.inner.events().last(),
            Some(&StreamEvent::new(EventKind::Done, "aborted"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_skips_the_retry() {
        let language = Arc::new(
            ScriptedLanguage::new()
                .answer(AnalysisTask::RelevanceCheck, relevant())
                .fail(AnalysisTask::QueryAnalysis, BackendError::Network("reset".into()))
                .answer(AnalysisTask::QueryAnalysis, hybrid_plan())
                .answer(AnalysisTask::ResponseSynthesis, answer()),
        );
        let search = Arc::new(two_repositories());
        let flag = CancellationFlag::new();
        let sink = CancelOn {
            inner: CollectingSink::default(),
            line: "[query_analyzer] retrying",
            flag: flag.clone(),
        };

        let outcome = orchestrator(language.clone(), search.clone())
            .run(RunRequest::new("what is maxcompdim", "u1"), &sink, &flag)
            .await;

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.short_summary, "Cancelled while retrying query_analyzer");
        assert_eq!(language.calls(AnalysisTask::QueryAnalysis), 1);
        assert_eq!(outcome.retry_delays.len(), 1);
        assert_eq!(search.calls(), 0);
        assert_eq!(
            sink.inner.events().last(),
            Some(&StreamEvent::new(EventKind::Done, "aborted"))
        );
    }

    #[tokio::test]
    async fn routing_is_deterministic() {
        let language = Arc::new(in_domain_language());
        let search = Arc::new(two_repositories());
        let orchestrator = orchestrator(language, search);

        let mut routes = Vec::new();
        for _ in 0..2 {
            let outcome = orchestrator
                .run(
                    RunRequest::new("what is maxcompdim", "u1"),
                    &CollectingSink::default(),
                    &CancellationFlag::new(),
                )
                .await;
            let skipped: Vec<bool> = outcome.records.values().map(|r| r.skipped).collect();
            let signals: Vec<_> = outcome
                .records
                .values()
                .map(|r| r.last_result.as_ref().map(|res| res.routing()))
                .collect();
            routes.push((outcome.tools_executed, skipped, signals));
        }
        assert_eq!(routes[0], routes[1]);
    }

    #[tokio::test]
    async fn empty_index_aborts_on_invalid_input() {
        let language = Arc::new(in_domain_language());
        let outcome = orchestrator(language.clone(), Arc::new(ScriptedSearch::new()))
            .run(
                RunRequest::new("what is maxcompdim", "u1"),
                &CollectingSink::default(),
                &CancellationFlag::new(),
            )
            .await;

        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(language.calls(AnalysisTask::QueryAnalysis), 0);
        let last = outcome.records["query_analyzer"]
            .last_result
            .clone()
            .expect("last result");
        assert!(last.errors[0].has_code(codes::INVALID_INPUT));
    }
}
