//! Response generator: the run's user-visible answer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use repoqa_shared::{
    AnalysisRequest, AnalysisTask, ConversationTurn, DocumentCompressor, GeneratedResponse,
    LanguageBackend, QueryAnalysis, RankedDocument, Role, SourceDocument, ToolDescriptor,
    ToolResult,
};

use super::{backend_failure, parse_answer, with_usage};
use crate::tool::{Tool, ToolContext, ToolFault};

/// Whether the answer is grounded in retrieved documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerMode {
    Grounded,
    /// Conversational answer for out-of-domain queries; no sources.
    General,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorInput {
    pub query: String,
    pub mode: AnswerMode,
    pub documents: Vec<RankedDocument>,
    pub suggested_response: Option<String>,
    pub analysis: Option<QueryAnalysis>,
    pub history: Vec<ConversationTurn>,
}

/// Source selection knobs.
#[derive(Debug, Clone, Copy)]
pub struct GeneratorSettings {
    pub relevance_floor: f64,
    pub max_sources: usize,
    pub source_token_budget: usize,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            relevance_floor: 0.6,
            max_sources: 5,
            source_token_budget: 1500,
        }
    }
}

/// The model's synthesized answer.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Synthesis {
    answer: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    additional_resources: Vec<String>,
}

pub struct ResponseGenerator {
    descriptor: ToolDescriptor,
    language: Arc<dyn LanguageBackend>,
    compressor: Arc<dyn DocumentCompressor>,
    settings: GeneratorSettings,
}

impl ResponseGenerator {
    pub fn new(
        language: Arc<dyn LanguageBackend>,
        compressor: Arc<dyn DocumentCompressor>,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "response_generator",
                description: "Synthesizes the final answer from the selected sources",
                input_schema: json!({
                    "type": "object",
                    "required": ["query", "mode"],
                    "properties": {
                        "query": { "type": "string", "minLength": 1 },
                        "mode": { "type": "string", "enum": ["grounded", "general"] },
                        "documents": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["repository", "filepath"],
                                "properties": {
                                    "relevanceScore": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
                                }
                            }
                        }
                    }
                }),
                retryable: true,
                estimated_duration: Duration::from_millis(8000),
            },
            language,
            compressor,
            settings,
        }
    }

    /// Documents at or above the floor, best first, capped.
    pub fn select_sources<'a>(&self, documents: &'a [RankedDocument]) -> Vec<&'a RankedDocument> {
        let mut kept: Vec<&RankedDocument> = documents
            .iter()
            .filter(|d| d.relevance_score >= self.settings.relevance_floor)
            .collect();
        kept.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        kept.truncate(self.settings.max_sources);
        kept
    }

    /// Templated answer listing the best sources.
    pub fn fallback(&self, input: &GeneratorInput) -> GeneratedResponse {
        let sources: Vec<SourceDocument> = match input.mode {
            AnswerMode::General => Vec::new(),
            AnswerMode::Grounded => self
                .select_sources(&input.documents)
                .into_iter()
                .map(SourceDocument::from)
                .collect(),
        };

        let answer = if !sources.is_empty() {
            let list = sources
                .iter()
                .map(|s| format!("- {}/{}", s.repository, s.filepath))
                .collect::<Vec<_>>()
                .join("\n");
            format!("I could not compose a full answer, but these documents look relevant:\n{list}")
        } else if let Some(suggested) = &input.suggested_response {
            suggested.clone()
        } else {
            "Sorry, I could not find enough information to answer that.".to_string()
        };

        GeneratedResponse {
            answer,
            source_documents: sources,
            confidence: 0.2,
            additional_resources: Vec::new(),
        }
    }

    async fn render_sources(&self, sources: &[&RankedDocument], query: &str) -> String {
        let mut out = String::new();
        for (i, doc) in sources.iter().enumerate() {
            let compressed = self
                .compressor
                .compress(&doc.content, query, self.settings.source_token_budget)
                .await;
            out.push_str(&format!(
                "[{}] {}/{}\n{}\n\n",
                i + 1,
                doc.repository,
                doc.filepath,
                compressed.content
            ));
        }
        out
    }
}

fn render_history(history: &[ConversationTurn]) -> String {
    history
        .iter()
        .map(|t| match t.role {
            Role::User => format!("User: {}", t.content),
            Role::Assistant => format!("Assistant: {}", t.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Tool for ResponseGenerator {
    type Input = GeneratorInput;
    type Output = GeneratedResponse;

    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    #[instrument(skip_all, fields(mode = ?input.mode, documents = input.documents.len()))]
    async fn run(
        &self,
        input: &GeneratorInput,
        _ctx: &ToolContext<'_>,
    ) -> Result<ToolResult<GeneratedResponse>, ToolFault> {
        let sources = match input.mode {
            AnswerMode::General => Vec::new(),
            AnswerMode::Grounded => self.select_sources(&input.documents),
        };

        let request = match input.mode {
            AnswerMode::General => AnalysisRequest {
                task: AnalysisTask::GeneralResponse,
                system: "The question is outside the documentation you can search. Answer \
                         briefly and conversationally. Respond with JSON: \
                         {\"answer\": string, \"confidence\": 0..1, \"additionalResources\": [string]}."
                    .into(),
                prompt: format!("{}\n\n{}", render_history(&input.history), input.query)
                    .trim()
                    .to_string(),
            },
            AnswerMode::Grounded => {
                let mut prompt = format!("Question: {}\n", input.query);
                if let Some(analysis) = &input.analysis {
                    prompt.push_str(&format!("Keywords: {}\n", analysis.keywords.join(", ")));
                }
                if let Some(suggested) = &input.suggested_response {
                    prompt.push_str(&format!("Draft answer from earlier context: {suggested}\n"));
                }
                if !input.history.is_empty() {
                    prompt.push_str(&format!("\nConversation:\n{}\n", render_history(&input.history)));
                }
                prompt.push_str("\nSources:\n");
                prompt.push_str(&self.render_sources(&sources, &input.query).await);

                AnalysisRequest {
                    task: AnalysisTask::ResponseSynthesis,
                    system: "Answer the question using only the numbered sources, citing them \
                             as [n]. Respond with JSON: {\"answer\": string, \"confidence\": 0..1, \
                             \"additionalResources\": [string]}."
                        .into(),
                    prompt,
                }
            }
        };

        let response = match self.language.analyze(request).await {
            Ok(response) => response,
            Err(e) => return Ok(backend_failure(&self.descriptor, "Answer generation failed", &e)),
        };

        let synthesis: Synthesis = match parse_answer(response.value.clone()) {
            Ok(s) => s,
            Err(e) => return Ok(ToolResult::failed("Answer generation returned an unreadable answer", e)),
        };

        let generated = GeneratedResponse {
            answer: synthesis.answer,
            source_documents: sources.into_iter().map(SourceDocument::from).collect(),
            confidence: synthesis.confidence.clamp(0.0, 1.0),
            additional_resources: synthesis.additional_resources,
        };
        debug!(sources = generated.source_documents.len(), "answer generated");

        let summary = match generated.source_documents.len() {
            0 => "Answered without sources".to_string(),
            n => format!("Answered citing {n} sources"),
        };
        let confidence = generated.confidence;
        Ok(with_usage(ToolResult::ok(generated, summary, confidence), &response))
    }
}
