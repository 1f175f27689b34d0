//! Typed payloads produced by the five pipeline steps.
//!
//! The language model answers in JSON with camelCase keys; these structs
//! deserialize those answers directly, so every field has a serde default
//! where the model is allowed to omit it.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Search vocabulary
// ---------------------------------------------------------------------------

/// How the repository searcher should query the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    Text,
    Semantic,
    #[default]
    Hybrid,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Semantic => "semantic",
            Self::Hybrid => "hybrid",
        }
    }

    /// The backend sub-searches this strategy needs.
    pub fn modes(&self) -> &'static [SearchMode] {
        match self {
            Self::Text => &[SearchMode::Text],
            Self::Semantic => &[SearchMode::Semantic],
            Self::Hybrid => &[SearchMode::Text, SearchMode::Semantic],
        }
    }
}

impl std::fmt::Display for SearchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single backend search call mode. Hybrid is composed from both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Text,
    Semantic,
}

/// One raw hit returned by the search backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub repository: String,
    pub filepath: String,
    pub filename: String,
    /// Full content or a snippet.
    pub content: String,
    /// Backend relevance in `0.0..=1.0`.
    pub relevance_score: f64,
}

/// A merged, ranked hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedDocument {
    pub repository: String,
    pub filepath: String,
    pub filename: String,
    pub content: String,
    pub relevance_score: f64,
    /// Sub-searches that returned this document.
    pub matched_by: Vec<SearchMode>,
}

impl RankedDocument {
    pub fn from_hit(hit: SearchHit, mode: SearchMode) -> Self {
        Self {
            repository: hit.repository,
            filepath: hit.filepath,
            filename: hit.filename,
            content: hit.content,
            relevance_score: hit.relevance_score,
            matched_by: vec![mode],
        }
    }
}

// ---------------------------------------------------------------------------
// Step outputs
// ---------------------------------------------------------------------------

/// Output of the relevance checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelevanceAssessment {
    pub is_relevant: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

/// Output of the query analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnalysis {
    pub strategy: SearchStrategy,
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub expected_result_types: Vec<String>,
}

/// Output of the context validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextAssessment {
    pub needs_new_search: bool,
    #[serde(default)]
    pub context_sufficiency: f64,
    #[serde(default)]
    pub suggested_response: Option<String>,
    #[serde(default)]
    pub reasoning: String,
}

/// Output of the repository searcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOutcome {
    pub results: Vec<RankedDocument>,
    /// Raw hits from successful repositories, before merging and truncation.
    pub total_found: usize,
    /// Repositories that answered successfully.
    pub repositories_searched: usize,
    pub search_strategy: SearchStrategy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_repositories: Vec<String>,
}

/// A document cited by the final answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    pub repository: String,
    pub filepath: String,
    pub filename: String,
    pub relevance_score: f64,
}

impl From<&RankedDocument> for SourceDocument {
    fn from(doc: &RankedDocument) -> Self {
        Self {
            repository: doc.repository.clone(),
            filepath: doc.filepath.clone(),
            filename: doc.filename.clone(),
            relevance_score: doc.relevance_score,
        }
    }
}

/// Output of the response generator: the run's user-visible answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedResponse {
    pub answer: String,
    #[serde(default)]
    pub source_documents: Vec<SourceDocument>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub additional_resources: Vec<String>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Speaker of a prior conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A prior turn supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}
