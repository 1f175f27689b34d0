//! Repository searcher: concurrent fan-out across repositories, merge, rank.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use repoqa_shared::{
    BackendError, DocumentCompressor, RankedDocument, SearchBackend, SearchHit, SearchMode,
    SearchOutcome, SearchParams, SearchStrategy, ToolDescriptor, ToolError, ToolErrorKind,
    ToolPhase, ToolResult, ToolStatus, codes,
};

use crate::cache::{ResultCache, cache_key};
use crate::compress::estimate_tokens;
use crate::tool::{Tool, ToolContext, ToolFault};

/// Score bonus for documents found by both text and semantic search.
const AGREEMENT_BONUS: f64 = 0.1;

/// Documents above this many tokens are compressed before being returned.
const RESULT_TOKEN_BUDGET: usize = 2000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearcherInput {
    pub query: String,
    pub user_id: String,
    pub strategy: SearchStrategy,
    pub repositories: Vec<String>,
    pub keywords: Vec<String>,
    pub params: SearchParams,
}

pub struct RepositorySearcher {
    descriptor: ToolDescriptor,
    backend: Arc<dyn SearchBackend>,
    compressor: Arc<dyn DocumentCompressor>,
    cache: Option<Arc<dyn ResultCache>>,
    cache_ttl: Duration,
}

/// Outcome of one repository branch: raw hits tagged by sub-search.
type BranchResult = Result<Vec<(SearchMode, SearchHit)>, BackendError>;

impl RepositorySearcher {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        compressor: Arc<dyn DocumentCompressor>,
        cache: Option<Arc<dyn ResultCache>>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "repository_searcher",
                description: "Searches the target repositories and ranks the merged hits",
                input_schema: json!({
                    "type": "object",
                    "required": ["query", "strategy", "repositories", "params"],
                    "properties": {
                        "query": { "type": "string", "minLength": 1 },
                        "strategy": { "type": "string", "enum": ["text", "semantic", "hybrid"] },
                        "repositories": {
                            "type": "array",
                            "minItems": 1,
                            "items": { "type": "string", "minLength": 1 }
                        },
                        "params": {
                            "type": "object",
                            "properties": {
                                "maxResults": { "type": "integer", "minimum": 1 },
                                "minSimilarity": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
                            }
                        }
                    }
                }),
                retryable: true,
                estimated_duration: Duration::from_millis(5000),
            },
            backend,
            compressor,
            cache,
            cache_ttl,
        }
    }

    /// Nothing found.
    pub fn fallback(input: &SearcherInput) -> SearchOutcome {
        SearchOutcome {
            search_strategy: input.strategy,
            ..SearchOutcome::default()
        }
    }

    /// Run every sub-search the strategy needs against one repository.
    /// Hybrid sub-searches run concurrently; the branch succeeds if any
    /// sub-search does.
    async fn search_repository(&self, repository: &str, input: &SearcherInput) -> BranchResult {
        let text_query = if input.keywords.is_empty() {
            input.query.clone()
        } else {
            input.keywords.join(" ")
        };

        match input.strategy {
            SearchStrategy::Text => {
                let hits = self
                    .backend
                    .search(repository, &text_query, SearchMode::Text, &input.params)
                    .await?;
                Ok(tag(SearchMode::Text, hits))
            }
            SearchStrategy::Semantic => {
                let hits = self
                    .backend
                    .search(repository, &input.query, SearchMode::Semantic, &input.params)
                    .await?;
                Ok(tag(SearchMode::Semantic, hits))
            }
            SearchStrategy::Hybrid => {
                let (text, semantic) = tokio::join!(
                    self.backend
                        .search(repository, &text_query, SearchMode::Text, &input.params),
                    self.backend
                        .search(repository, &input.query, SearchMode::Semantic, &input.params),
                );
                match (text, semantic) {
                    (Ok(t), Ok(s)) => {
                        let mut hits = tag(SearchMode::Text, t);
                        hits.extend(tag(SearchMode::Semantic, s));
                        Ok(hits)
                    }
                    (Ok(t), Err(e)) => {
                        debug!(repository, error = %e, "semantic sub-search failed");
                        Ok(tag(SearchMode::Text, t))
                    }
                    (Err(e), Ok(s)) => {
                        debug!(repository, error = %e, "text sub-search failed");
                        Ok(tag(SearchMode::Semantic, s))
                    }
                    (Err(text_err), Err(semantic_err)) => {
                        Err(prefer_informative(text_err, semantic_err))
                    }
                }
            }
        }
    }

    async fn compress_oversized(&self, docs: &mut [RankedDocument], query: &str) {
        for doc in docs.iter_mut() {
            if estimate_tokens(&doc.content) > RESULT_TOKEN_BUDGET {
                let compressed = self
                    .compressor
                    .compress(&doc.content, query, RESULT_TOKEN_BUDGET)
                    .await;
                doc.content = compressed.content;
            }
        }
    }
}

fn tag(mode: SearchMode, hits: Vec<SearchHit>) -> Vec<(SearchMode, SearchHit)> {
    hits.into_iter().map(|h| (mode, h)).collect()
}

/// When both sub-searches fail, report the one that is not merely "unavailable".
fn prefer_informative(first: BackendError, second: BackendError) -> BackendError {
    match first {
        BackendError::Unavailable(_) => second,
        _ => first,
    }
}

/// Merge hits from all repositories into one ranked list.
///
/// Duplicates are keyed on `(repository, filepath)`. A document found by
/// both text and semantic search keeps its best score plus an agreement
/// bonus. Semantic-only hits under `min_similarity` are dropped.
pub fn merge_hits(hits: Vec<(SearchMode, SearchHit)>, params: &SearchParams) -> Vec<RankedDocument> {
    let mut merged: HashMap<(String, String), RankedDocument> = HashMap::new();

    for (mode, hit) in hits {
        if mode == SearchMode::Semantic && hit.relevance_score < params.min_similarity {
            continue;
        }
        let key = (hit.repository.clone(), hit.filepath.clone());
        match merged.get_mut(&key) {
            Some(doc) => {
                doc.relevance_score = doc.relevance_score.max(hit.relevance_score);
                if !doc.matched_by.contains(&mode) {
                    doc.matched_by.push(mode);
                }
            }
            None => {
                merged.insert(key, RankedDocument::from_hit(hit, mode));
            }
        }
    }

    let mut docs: Vec<RankedDocument> = merged
        .into_values()
        .map(|mut doc| {
            if doc.matched_by.len() > 1 {
                doc.relevance_score += AGREEMENT_BONUS;
            }
            doc.relevance_score = doc.relevance_score.clamp(0.0, 1.0);
            doc
        })
        .collect();

    docs.sort_by(|a, b| {
        b.relevance_score
            .total_cmp(&a.relevance_score)
            .then_with(|| a.repository.cmp(&b.repository))
            .then_with(|| a.filepath.cmp(&b.filepath))
    });
    docs.truncate(params.max_results);
    docs
}

#[async_trait]
impl Tool for RepositorySearcher {
    type Input = SearcherInput;
    type Output = SearchOutcome;

    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    #[instrument(skip_all, fields(strategy = %input.strategy, repositories = input.repositories.len()))]
    async fn run(
        &self,
        input: &SearcherInput,
        ctx: &ToolContext<'_>,
    ) -> Result<ToolResult<SearchOutcome>, ToolFault> {
        let key = cache_key(&input.query, input.strategy, &input.repositories, &input.user_id);
        if let Some(cache) = &self.cache {
            if let Some(outcome) = cache.get(&key) {
                debug!("search cache hit");
                let summary = format!("Found {} documents (cached)", outcome.results.len());
                return Ok(ToolResult::ok(outcome, summary, 0.8).with_cache_hit(true));
            }
        }

        let started = Instant::now();
        let total = input.repositories.len();
        let mut pending: FuturesUnordered<_> = input
            .repositories
            .iter()
            .map(|repository| async move {
                (repository, self.search_repository(repository, input).await)
            })
            .collect();

        let mut raw_hits = Vec::new();
        let mut total_found = 0;
        let mut succeeded = 0;
        let mut failed_repositories = Vec::new();
        let mut failures = Vec::new();
        let mut done = 0;

        while let Some((repository, result)) = pending.next().await {
            done += 1;
            match result {
                Ok(hits) => {
                    succeeded += 1;
                    total_found += hits.len();
                    raw_hits.extend(hits);
                }
                Err(e) => {
                    warn!(repository = %repository, error = %e, "repository search failed");
                    failed_repositories.push(repository.clone());
                    failures.push(e);
                }
            }

            let progress = u8::try_from(done * 100 / total).unwrap_or(100);
            let per_repo_ms = started.elapsed().as_millis() as u64 / done as u64;
            ctx.report(
                ToolStatus::new(self.descriptor.name, ToolPhase::Processing)
                    .with_progress(progress)
                    .with_action(format!("searched {repository} ({done}/{total})"))
                    .with_eta_ms(per_repo_ms * (total - done) as u64),
            )
            .await;
        }

        if succeeded == 0 {
            let all_unavailable = failures
                .iter()
                .all(|e| matches!(e, BackendError::Unavailable(_)));
            let error = if all_unavailable {
                ToolError::new(ToolErrorKind::Execution, "search backend is unavailable")
                    .with_code(codes::BACKEND_UNAVAILABLE)
            } else {
                ToolError::new(ToolErrorKind::Network, "every repository search failed")
                    .with_code(codes::ALL_REPOSITORIES_FAILED)
                    .retryable(self.descriptor.retryable)
            };
            let error = error.with_context("failedRepositories", json!(failed_repositories));
            return Ok(ToolResult::failed("Repository search failed", error));
        }

        let mut results = merge_hits(raw_hits, &input.params);
        self.compress_oversized(&mut results, &input.query).await;

        info!(
            found = total_found,
            kept = results.len(),
            failed = failed_repositories.len(),
            "search complete"
        );

        let outcome = SearchOutcome {
            results,
            total_found,
            repositories_searched: succeeded,
            search_strategy: input.strategy,
            failed_repositories,
        };

        if let Some(cache) = &self.cache {
            cache.put(&key, outcome.clone(), self.cache_ttl);
        }

        let confidence = outcome
            .results
            .first()
            .map(|d| d.relevance_score)
            .unwrap_or(0.0);
        let summary = format!(
            "Found {} documents in {} repositories",
            outcome.results.len(),
            outcome.repositories_searched
        );
        Ok(ToolResult::ok(outcome, summary, confidence).with_cache_hit(false))
    }
}
