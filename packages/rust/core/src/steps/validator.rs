//! Context validator: can prior turns answer the query without a new search?

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, instrument};

use repoqa_shared::{
    AnalysisRequest, AnalysisTask, ContextAssessment, ConversationTurn, LanguageBackend,
    QueryAnalysis, RankedDocument, Role, RoutingSignal, ToolDescriptor, ToolResult,
};

use super::{backend_failure, parse_answer, with_usage};
use crate::tool::{Tool, ToolContext, ToolFault};

/// Prior documents quoted to the model, at most.
const MAX_PRIOR_DOCUMENTS: usize = 5;
/// Characters of each prior document quoted to the model.
const PRIOR_EXCERPT_CHARS: usize = 600;
/// Conversation turns quoted to the model, most recent last.
const MAX_HISTORY_TURNS: usize = 6;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorInput {
    pub query: String,
    pub analysis: QueryAnalysis,
    pub history: Vec<ConversationTurn>,
    pub prior_results: Vec<RankedDocument>,
}

pub struct ContextValidator {
    descriptor: ToolDescriptor,
    language: Arc<dyn LanguageBackend>,
}

impl ContextValidator {
    pub fn new(language: Arc<dyn LanguageBackend>) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "context_validator",
                description: "Checks whether existing context already answers the query",
                input_schema: json!({
                    "type": "object",
                    "required": ["query", "analysis"],
                    "properties": {
                        "query": { "type": "string", "minLength": 1 },
                        "analysis": { "type": "object", "required": ["strategy"] },
                        "history": { "type": "array" },
                        "priorResults": { "type": "array" }
                    }
                }),
                retryable: false,
                estimated_duration: Duration::from_millis(3000),
            },
            language,
        }
    }

    /// Search again; nothing is known to be sufficient.
    pub fn fallback() -> ContextAssessment {
        ContextAssessment {
            needs_new_search: true,
            context_sufficiency: 0.0,
            suggested_response: None,
            reasoning: "context check unavailable; searching again".into(),
        }
    }
}

fn render_context(input: &ValidatorInput) -> String {
    let mut out = String::new();

    let skip = input.history.len().saturating_sub(MAX_HISTORY_TURNS);
    for turn in input.history.iter().skip(skip) {
        let speaker = match turn.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        out.push_str(&format!("{speaker}: {}\n", turn.content));
    }

    for doc in input.prior_results.iter().take(MAX_PRIOR_DOCUMENTS) {
        let excerpt: String = doc.content.chars().take(PRIOR_EXCERPT_CHARS).collect();
        out.push_str(&format!("\n[{}/{}]\n{excerpt}\n", doc.repository, doc.filepath));
    }
    out
}

#[async_trait]
impl Tool for ContextValidator {
    type Input = ValidatorInput;
    type Output = ContextAssessment;

    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    #[instrument(skip_all, fields(history = input.history.len(), prior = input.prior_results.len()))]
    async fn run(
        &self,
        input: &ValidatorInput,
        _ctx: &ToolContext<'_>,
    ) -> Result<ToolResult<ContextAssessment>, ToolFault> {
        if input.history.is_empty() && input.prior_results.is_empty() {
            let assessment = ContextAssessment {
                needs_new_search: true,
                context_sufficiency: 0.0,
                suggested_response: None,
                reasoning: "no prior context".into(),
            };
            return Ok(ToolResult::ok(assessment, "No prior context; searching", 1.0));
        }

        let request = AnalysisRequest {
            task: AnalysisTask::ContextValidation,
            system: "Decide whether the conversation so far already answers the new question. \
                     Respond with JSON: {\"needsNewSearch\": bool, \"contextSufficiency\": 0..1, \
                     \"suggestedResponse\": string|null, \"reasoning\": string}."
                .into(),
            prompt: format!(
                "Question: {}\n\nContext:\n{}",
                input.query,
                render_context(input)
            ),
        };

        let response = match self.language.analyze(request).await {
            Ok(response) => response,
            Err(e) => return Ok(backend_failure(&self.descriptor, "Context check failed", &e)),
        };

        let mut assessment: ContextAssessment = match parse_answer(response.value.clone()) {
            Ok(a) => a,
            Err(e) => return Ok(ToolResult::failed("Context check returned an unreadable answer", e)),
        };
        assessment.context_sufficiency = assessment.context_sufficiency.clamp(0.0, 1.0);
        debug!(
            needs_new_search = assessment.needs_new_search,
            sufficiency = assessment.context_sufficiency,
            "context assessed"
        );

        let (summary, signal) = if assessment.needs_new_search {
            ("Existing context is not sufficient", RoutingSignal::None)
        } else {
            ("Existing context answers the query", RoutingSignal::SkipSearch)
        };
        let confidence = assessment.context_sufficiency;
        let result = ToolResult::ok(assessment, summary, confidence).with_next_action(signal);
        Ok(with_usage(result, &response))
    }
}
