//! Query analyzer: picks a search strategy, target repositories and keywords.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, instrument};

use repoqa_shared::{
    AnalysisRequest, AnalysisTask, LanguageBackend, QueryAnalysis, RelevanceAssessment,
    SearchStrategy, ToolDescriptor, ToolResult,
};

use super::{backend_failure, extract_keywords, parse_answer, with_usage};
use crate::tool::{Tool, ToolContext, ToolFault};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzerInput {
    pub query: String,
    pub relevance: Option<RelevanceAssessment>,
    pub available_repositories: Vec<String>,
}

pub struct QueryAnalyzer {
    descriptor: ToolDescriptor,
    language: Arc<dyn LanguageBackend>,
}

impl QueryAnalyzer {
    pub fn new(language: Arc<dyn LanguageBackend>) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "query_analyzer",
                description: "Chooses search strategy, repositories and keywords for a query",
                input_schema: json!({
                    "type": "object",
                    "required": ["query", "availableRepositories"],
                    "properties": {
                        "query": { "type": "string", "minLength": 1 },
                        "availableRepositories": {
                            "type": "array",
                            "minItems": 1,
                            "items": { "type": "string", "minLength": 1 }
                        }
                    }
                }),
                retryable: true,
                estimated_duration: Duration::from_millis(3000),
            },
            language,
        }
    }

    /// Hybrid search over everything, keywords taken from the query text.
    pub fn fallback(input: &AnalyzerInput) -> QueryAnalysis {
        QueryAnalysis {
            strategy: SearchStrategy::Hybrid,
            repositories: input.available_repositories.clone(),
            keywords: extract_keywords(&input.query),
            expected_result_types: vec!["documentation".into()],
        }
    }
}

/// Keep only configured repositories; an empty selection means all of them.
fn restrict_repositories(selected: Vec<String>, available: &[String]) -> Vec<String> {
    let mut kept: Vec<String> = Vec::new();
    for name in selected {
        if let Some(known) = available.iter().find(|a| a.eq_ignore_ascii_case(&name)) {
            if !kept.contains(known) {
                kept.push(known.clone());
            }
        }
    }
    if kept.is_empty() {
        available.to_vec()
    } else {
        kept
    }
}

#[async_trait]
impl Tool for QueryAnalyzer {
    type Input = AnalyzerInput;
    type Output = QueryAnalysis;

    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    #[instrument(skip_all, fields(repositories = input.available_repositories.len()))]
    async fn run(
        &self,
        input: &AnalyzerInput,
        _ctx: &ToolContext<'_>,
    ) -> Result<ToolResult<QueryAnalysis>, ToolFault> {
        let domains = input
            .relevance
            .as_ref()
            .map(|r| r.domains.join(", "))
            .unwrap_or_default();

        let request = AnalysisRequest {
            task: AnalysisTask::QueryAnalysis,
            system: format!(
                "Plan a documentation search. Available repositories: {}. \
                 Respond with JSON: {{\"strategy\": \"text\"|\"semantic\"|\"hybrid\", \
                 \"repositories\": [string], \"keywords\": [string], \
                 \"expectedResultTypes\": [string]}}.",
                input.available_repositories.join(", ")
            ),
            prompt: if domains.is_empty() {
                input.query.clone()
            } else {
                format!("{}\n\nDomains: {domains}", input.query)
            },
        };

        let response = match self.language.analyze(request).await {
            Ok(response) => response,
            Err(e) => return Ok(backend_failure(&self.descriptor, "Query analysis failed", &e)),
        };

        let mut analysis: QueryAnalysis = match parse_answer(response.value.clone()) {
            Ok(a) => a,
            Err(e) => return Ok(ToolResult::failed("Query analysis returned an unreadable answer", e)),
        };

        analysis.repositories =
            restrict_repositories(analysis.repositories, &input.available_repositories);
        if analysis.keywords.is_empty() {
            analysis.keywords = extract_keywords(&input.query);
        }
        debug!(strategy = %analysis.strategy, repositories = ?analysis.repositories, "query analysed");

        let summary = format!(
            "Planned {} search across {} repositories",
            analysis.strategy,
            analysis.repositories.len()
        );
        Ok(with_usage(ToolResult::ok(analysis, summary, 0.8), &response))
    }
}
