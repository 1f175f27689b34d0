//! The five pipeline steps.
//!
//! Each step is a [`Tool`](crate::tool::Tool) with a typed input and output,
//! plus a `fallback` used by the orchestrator when the step fails for good.
//! Steps map backend failures onto the tool error taxonomy themselves; only
//! genuine logic faults reach the wrapper.

pub mod analyzer;
pub mod generator;
pub mod relevance;
pub mod searcher;
pub mod validator;

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use repoqa_shared::{
    AnalysisResponse, BackendError, ToolDescriptor, ToolError, ToolErrorKind, ToolResult, codes,
};

pub use analyzer::{AnalyzerInput, QueryAnalyzer};
pub use generator::{AnswerMode, GeneratorInput, GeneratorSettings, ResponseGenerator};
pub use relevance::{RelevanceChecker, RelevanceInput};
pub use searcher::{RepositorySearcher, SearcherInput};
pub use validator::{ContextValidator, ValidatorInput};

/// Parse a language-backend answer into a step payload.
pub(crate) fn parse_answer<T: DeserializeOwned>(value: Value) -> Result<T, ToolError> {
    serde_json::from_value(value).map_err(|e| {
        ToolError::new(
            ToolErrorKind::Validation,
            format!("model answer did not match the expected shape: {e}"),
        )
        .with_code(codes::PARSE_ERROR)
    })
}

/// Failed result for a backend error, using the step's retry default.
pub(crate) fn backend_failure<T>(
    descriptor: &ToolDescriptor,
    summary: &str,
    error: &BackendError,
) -> ToolResult<T> {
    ToolResult::failed(summary, error.to_tool_error(descriptor.retryable))
}

/// Attach token usage when the backend reported it.
pub(crate) fn with_usage<T>(result: ToolResult<T>, response: &AnalysisResponse) -> ToolResult<T> {
    match response.tokens_used {
        Some(tokens) => result.with_tokens(tokens),
        None => result,
    }
}

static WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z][A-Za-z0-9_.-]*[A-Za-z0-9]|[A-Za-z]{2,}").expect("valid word regex")
});

const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from",
    "how", "i", "in", "is", "it", "me", "my", "of", "on", "or", "should", "that", "the", "this",
    "to", "use", "what", "when", "where", "which", "who", "why", "with", "you", "your",
];

/// Lowercased, de-duplicated query terms minus stopwords.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for m in WORD.find_iter(query) {
        let word = m.as_str().to_lowercase();
        if word.len() < 2 || STOPWORDS.contains(&word.as_str()) || keywords.contains(&word) {
            continue;
        }
        keywords.push(word);
    }
    keywords
}
