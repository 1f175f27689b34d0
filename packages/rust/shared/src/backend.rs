//! Interfaces of the external collaborators the pipeline consumes.
//!
//! Implementations live in `repoqa-storage` (document index), `repoqa-llm`
//! (language model and embeddings) and `repoqa-core` (compression). Steps only
//! ever see these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BackendError;
use crate::payloads::{SearchHit, SearchMode};

// ---------------------------------------------------------------------------
// Document search
// ---------------------------------------------------------------------------

/// Tuning knobs for a search call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    /// Maximum hits returned per call (and after merging).
    pub max_results: usize,
    /// Semantic hits below this cosine similarity are dropped.
    pub min_similarity: f64,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            max_results: 20,
            min_similarity: 0.3,
        }
    }
}

/// Searches one repository of indexed documents.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Run one text or semantic search against `repository`.
    async fn search(
        &self,
        repository: &str,
        query: &str,
        mode: SearchMode,
        params: &SearchParams,
    ) -> Result<Vec<SearchHit>, BackendError>;

    /// Names of the repositories available for search.
    async fn repositories(&self) -> Result<Vec<String>, BackendError>;
}

// ---------------------------------------------------------------------------
// Language understanding
// ---------------------------------------------------------------------------

/// What a language-backend call is for. Lets implementations pick models and
/// lets test doubles script answers per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisTask {
    RelevanceCheck,
    QueryAnalysis,
    ContextValidation,
    ResponseSynthesis,
    GeneralResponse,
}

impl AnalysisTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RelevanceCheck => "relevance_check",
            Self::QueryAnalysis => "query_analysis",
            Self::ContextValidation => "context_validation",
            Self::ResponseSynthesis => "response_synthesis",
            Self::GeneralResponse => "general_response",
        }
    }
}

/// A single classify/analyze request.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub task: AnalysisTask,
    /// System instructions, including the required JSON shape.
    pub system: String,
    /// The user-facing prompt.
    pub prompt: String,
}

/// Structured JSON answer plus token accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResponse {
    pub value: Value,
    pub tokens_used: Option<u64>,
}

impl AnalysisResponse {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            tokens_used: None,
        }
    }
}

/// `analyze(prompt) -> structured JSON`.
#[async_trait]
pub trait LanguageBackend: Send + Sync {
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse, BackendError>;
}

/// Text embedding, used by semantic search and indexing.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError>;
}

// ---------------------------------------------------------------------------
// Document compression
// ---------------------------------------------------------------------------

/// Content shrunk to a token budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedDocument {
    pub content: String,
    pub token_count: usize,
    pub was_compressed: bool,
}

/// Shrinks a document to a token budget, keeping query-relevant sections.
#[async_trait]
pub trait DocumentCompressor: Send + Sync {
    async fn compress(&self, content: &str, query: &str, token_budget: usize)
    -> CompressedDocument;
}
