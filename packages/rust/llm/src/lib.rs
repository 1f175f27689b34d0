//! OpenRouter client for repoqa.
//!
//! Implements [`LanguageBackend`] over the OpenAI-compatible chat completions
//! endpoint (JSON response mode) and [`EmbeddingBackend`] over `/embeddings`.
//! HTTP failures are mapped onto [`BackendError`] so pipeline steps can
//! classify them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};
use url::Url;

use repoqa_shared::{
    AnalysisRequest, AnalysisResponse, BackendError, EmbeddingBackend, LanguageBackend,
    OpenRouterConfig, RepoQaError, Result,
};

/// User-Agent string for API requests.
const USER_AGENT: &str = concat!("repoqa/", env!("CARGO_PKG_VERSION"));

/// Attribution header OpenRouter uses for app rankings.
const APP_TITLE: &str = "repoqa";

/// OpenRouter (or any OpenAI-compatible) API client.
pub struct OpenRouterClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    embedding_model: String,
}

impl OpenRouterClient {
    /// Build a client. A missing key is allowed here; calls then fail with
    /// [`BackendError::MissingCredentials`].
    pub fn new(config: &OpenRouterConfig, api_key: Option<String>) -> Result<Self> {
        let base = Url::parse(&config.base_url).map_err(|e| {
            RepoQaError::config(format!("invalid OpenRouter base_url {}: {e}", config.base_url))
        })?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RepoQaError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base.as_str().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn key(&self) -> std::result::Result<&str, BackendError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| BackendError::MissingCredentials("OpenRouter API key not set".into()))
    }

    async fn post(&self, path: &str, body: &Value) -> std::result::Result<String, BackendError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(self.key()?)
            .header("X-Title", APP_TITLE)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            warn!(%status, "OpenRouter request failed");
            return Err(map_status(status, &text));
        }
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Backend impls
// ---------------------------------------------------------------------------

#[async_trait]
impl LanguageBackend for OpenRouterClient {
    #[instrument(skip_all, fields(task = request.task.as_str(), model = %self.model))]
    async fn analyze(
        &self,
        request: AnalysisRequest,
    ) -> std::result::Result<AnalysisResponse, BackendError> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
            "response_format": { "type": "json_object" },
            "temperature": 0.1,
        });

        let text = self.post("chat/completions", &body).await?;
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| BackendError::InvalidResponse(format!("chat response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::InvalidResponse("no choices in response".into()))?;

        let value = extract_json(&content)?;
        let tokens_used = parsed.usage.and_then(|u| u.total_tokens);
        debug!(?tokens_used, "analysis complete");

        Ok(AnalysisResponse { value, tokens_used })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenRouterClient {
    #[instrument(skip_all, fields(model = %self.embedding_model, chars = text.len()))]
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, BackendError> {
        let body = json!({
            "model": self.embedding_model,
            "input": text,
        });

        let raw = self.post("embeddings", &body).await?;
        let parsed: EmbeddingResponse = serde_json::from_str(&raw)
            .map_err(|e| BackendError::InvalidResponse(format!("embedding response: {e}")))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| BackendError::InvalidResponse("no embedding in response".into()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn map_transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Network(e.to_string())
    }
}

fn map_status(status: StatusCode, body: &str) -> BackendError {
    let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::MissingCredentials(detail)
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::PAYMENT_REQUIRED => {
            BackendError::RateLimited(detail)
        }
        StatusCode::SERVICE_UNAVAILABLE => BackendError::Unavailable(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendError::Timeout,
        s if s.is_client_error() => BackendError::Rejected(detail),
        _ => BackendError::Network(detail),
    }
}

/// Parse a model answer as JSON, tolerating markdown fences and prose
/// around the object.
fn extract_json(content: &str) -> std::result::Result<Value, BackendError> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if s < e => serde_json::from_str(&trimmed[s..=e])
            .map_err(|err| BackendError::InvalidResponse(format!("model answer: {err}"))),
        _ => Err(BackendError::InvalidResponse(
            "model answer contained no JSON object".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repoqa_shared::AnalysisTask;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, key: Option<&str>) -> OpenRouterClient {
        let config = OpenRouterConfig {
            base_url: format!("{}/api/v1", server.uri()),
            timeout_secs: 5,
            ..OpenRouterConfig::default()
        };
        OpenRouterClient::new(&config, key.map(String::from)).expect("client")
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest {
            task: AnalysisTask::RelevanceCheck,
            system: "Answer in JSON".into(),
            prompt: "Is MODFLOW relevant?".into(),
        }
    }

    #[test]
    fn extract_json_strips_fences() {
        let value = extract_json("```json\n{\"isRelevant\": true}\n```").expect("parse");
        assert_eq!(value["isRelevant"], true);
        assert!(extract_json("no json here").is_err());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, ""),
            BackendError::MissingCredentials(_)
        ));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, ""),
            BackendError::RateLimited(_)
        ));
        assert!(matches!(
            map_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            BackendError::Unavailable(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, ""),
            BackendError::Network(_)
        ));
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::NOT_FOUND,
            StatusCode::UNPROCESSABLE_ENTITY,
        ] {
            assert!(matches!(map_status(status, ""), BackendError::Rejected(_)));
        }
    }

    #[tokio::test]
    async fn analyze_parses_json_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "{\"isRelevant\": true, \"confidence\": 0.9}"
                    }
                }],
                "usage": { "total_tokens": 42 }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, Some("test-key"));
        let response = client.analyze(request()).await.expect("analyze");
        assert_eq!(response.value["confidence"], 0.9);
        assert_eq!(response.tokens_used, Some(42));
    }

    #[tokio::test]
    async fn analyze_maps_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client = client_for(&server, Some("test-key"));
        let err = client.analyze(request()).await.unwrap_err();
        assert!(matches!(err, BackendError::RateLimited(_)));
    }

    #[tokio::test]
    async fn analyze_maps_unknown_model_to_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(404).set_body_string("{\"error\":\"model not found\"}"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("test-key"));
        let err = client.analyze(request()).await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected(ref d) if d.contains("404")));
        assert!(!err.to_tool_error(true).retryable);
    }

    #[tokio::test]
    async fn analyze_rejects_non_json_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "I think so." } }]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, Some("test-key"));
        let err = client.analyze(request()).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn missing_key_fails_without_request() {
        let server = MockServer::start().await;
        let client = client_for(&server, None);
        let err = client.analyze(request()).await.unwrap_err();
        assert!(matches!(err, BackendError::MissingCredentials(_)));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn embed_returns_first_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "embedding": [0.25, -0.5, 1.0], "index": 0 }]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, Some("test-key"));
        let vector = client.embed("well package").await.expect("embed");
        assert_eq!(vector, vec![0.25, -0.5, 1.0]);
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        let config = OpenRouterConfig {
            base_url: "not a url".into(),
            ..OpenRouterConfig::default()
        };
        let err = OpenRouterClient::new(&config, None).err().expect("error");
        assert!(err.to_string().contains("invalid OpenRouter base_url"));
    }
}
