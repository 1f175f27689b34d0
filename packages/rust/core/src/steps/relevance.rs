//! Relevance checker: is the query about the configured domain?

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, instrument};

use repoqa_shared::{
    AnalysisRequest, AnalysisTask, LanguageBackend, RelevanceAssessment, RoutingSignal,
    ToolDescriptor, ToolResult,
};

use super::{backend_failure, parse_answer, with_usage};
use crate::tool::{Tool, ToolContext, ToolFault};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelevanceInput {
    pub query: String,
    pub domain_description: String,
    pub known_domains: Vec<String>,
}

pub struct RelevanceChecker {
    descriptor: ToolDescriptor,
    language: Arc<dyn LanguageBackend>,
}

impl RelevanceChecker {
    pub fn new(language: Arc<dyn LanguageBackend>) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "relevance_checker",
                description: "Decides whether a query belongs to the supported domain",
                input_schema: json!({
                    "type": "object",
                    "required": ["query"],
                    "properties": {
                        "query": { "type": "string", "minLength": 1 },
                        "domainDescription": { "type": "string" },
                        "knownDomains": { "type": "array", "items": { "type": "string" } }
                    }
                }),
                retryable: true,
                estimated_duration: Duration::from_millis(2000),
            },
            language,
        }
    }

    /// Assume the query is relevant and let later steps decide.
    pub fn fallback() -> RelevanceAssessment {
        RelevanceAssessment {
            is_relevant: true,
            confidence: 0.5,
            domains: Vec::new(),
            reasoning: "relevance check unavailable; assuming the query is in scope".into(),
        }
    }
}

#[async_trait]
impl Tool for RelevanceChecker {
    type Input = RelevanceInput;
    type Output = RelevanceAssessment;

    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    #[instrument(skip_all)]
    async fn run(
        &self,
        input: &RelevanceInput,
        _ctx: &ToolContext<'_>,
    ) -> Result<ToolResult<RelevanceAssessment>, ToolFault> {
        let request = AnalysisRequest {
            task: AnalysisTask::RelevanceCheck,
            system: format!(
                "You decide whether a question is about: {}. Known sub-domains: {}. \
                 Respond with JSON: {{\"isRelevant\": bool, \"confidence\": 0..1, \
                 \"domains\": [string], \"reasoning\": string}}.",
                input.domain_description,
                input.known_domains.join(", ")
            ),
            prompt: input.query.clone(),
        };

        let response = match self.language.analyze(request).await {
            Ok(response) => response,
            Err(e) => {
                return Ok(backend_failure(&self.descriptor, "Relevance check failed", &e));
            }
        };

        let mut assessment: RelevanceAssessment = match parse_answer(response.value.clone()) {
            Ok(a) => a,
            Err(e) => return Ok(ToolResult::failed("Relevance check returned an unreadable answer", e)),
        };
        assessment.confidence = assessment.confidence.clamp(0.0, 1.0);
        debug!(relevant = assessment.is_relevant, confidence = assessment.confidence, "relevance assessed");

        let (summary, signal) = if assessment.is_relevant {
            ("Query is in scope", RoutingSignal::None)
        } else {
            ("Query is outside the supported domain", RoutingSignal::GeneralResponse)
        };
        let confidence = assessment.confidence;
        let result = ToolResult::ok(assessment, summary, confidence).with_next_action(signal);
        Ok(with_usage(result, &response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{NullSink, StatusReporter};
    use crate::testing::ScriptedLanguage;
    use repoqa_shared::{BackendError, ToolErrorKind, codes};
    use uuid::Uuid;

    fn input(query: &str) -> RelevanceInput {
        RelevanceInput {
            query: query.into(),
            domain_description: "groundwater modelling".into(),
            known_domains: vec!["modflow".into()],
        }
    }

    #[tokio::test]
    async fn irrelevant_query_routes_to_general_response() {
        let language = Arc::new(ScriptedLanguage::new().answer(
            AnalysisTask::RelevanceCheck,
            json!({ "isRelevant": false, "confidence": 0.95, "domains": [], "reasoning": "cooking" }),
        ));
        let step = RelevanceChecker::new(language.clone());
        let ctx = ToolContext::new(Uuid::now_v7(), StatusReporter::new(&NullSink));

        let result = step.run(&input("how to cook pasta"), &ctx).await.expect("run");

        assert!(result.success);
        assert_eq!(result.routing(), RoutingSignal::GeneralResponse);
        assert_eq!(language.calls(AnalysisTask::RelevanceCheck), 1);
    }

    #[tokio::test]
    async fn relevant_query_continues() {
        let language = Arc::new(ScriptedLanguage::new().answer(
            AnalysisTask::RelevanceCheck,
            json!({ "isRelevant": true, "confidence": 0.9, "domains": ["modflow"], "reasoning": "mf6" }),
        ));
        let step = RelevanceChecker::new(language);
        let ctx = ToolContext::new(Uuid::now_v7(), StatusReporter::new(&NullSink));

        let result = step.run(&input("what is maxcompdim"), &ctx).await.expect("run");
        assert_eq!(result.routing(), RoutingSignal::None);
        assert_eq!(result.data.map(|d| d.domains), Some(vec!["modflow".to_string()]));
    }

    #[tokio::test]
    async fn backend_errors_become_failed_results() {
        let language = Arc::new(
            ScriptedLanguage::new()
                .fail(AnalysisTask::RelevanceCheck, BackendError::RateLimited("429".into())),
        );
        let step = RelevanceChecker::new(language);
        let ctx = ToolContext::new(Uuid::now_v7(), StatusReporter::new(&NullSink));

        let result = step.run(&input("q"), &ctx).await.expect("run");
        assert!(!result.success);
        assert_eq!(result.errors[0].kind, ToolErrorKind::ApiLimit);
        assert!(result.errors[0].retryable);
    }

    #[tokio::test]
    async fn malformed_answer_is_parse_error() {
        let language = Arc::new(
            ScriptedLanguage::new().answer(AnalysisTask::RelevanceCheck, json!({ "verdict": "yes" })),
        );
        let step = RelevanceChecker::new(language);
        let ctx = ToolContext::new(Uuid::now_v7(), StatusReporter::new(&NullSink));

        let result = step.run(&input("q"), &ctx).await.expect("run");
        assert!(result.errors[0].has_code(codes::PARSE_ERROR));
    }

    #[test]
    fn fallback_assumes_relevant() {
        let fallback = RelevanceChecker::fallback();
        assert!(fallback.is_relevant);
        assert_eq!(fallback.confidence, 0.5);
    }
}
