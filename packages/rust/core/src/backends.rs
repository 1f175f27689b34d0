//! [`SearchBackend`] over the local libSQL repository index.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use repoqa_shared::{
    BackendError, EmbeddingBackend, SearchBackend, SearchHit, SearchMode, SearchParams,
};
use repoqa_storage::Storage;

/// Text search via FTS5, semantic search via stored embeddings.
pub struct IndexSearchBackend {
    storage: Arc<Storage>,
    embedder: Option<Arc<dyn EmbeddingBackend>>,
}

impl IndexSearchBackend {
    pub fn new(storage: Arc<Storage>, embedder: Option<Arc<dyn EmbeddingBackend>>) -> Self {
        Self { storage, embedder }
    }
}

#[async_trait]
impl SearchBackend for IndexSearchBackend {
    #[instrument(skip_all, fields(repository = %repository, mode = ?mode))]
    async fn search(
        &self,
        repository: &str,
        query: &str,
        mode: SearchMode,
        params: &SearchParams,
    ) -> Result<Vec<SearchHit>, BackendError> {
        let hits = match mode {
            SearchMode::Text => self
                .storage
                .search_text(repository, query, params.max_results)
                .await
                .map_err(|e| BackendError::Unavailable(e.to_string()))?,
            SearchMode::Semantic => {
                let Some(embedder) = &self.embedder else {
                    return Err(BackendError::Unavailable(
                        "semantic search needs an embedding backend".into(),
                    ));
                };
                let vector = embedder.embed(query).await?;
                self.storage
                    .search_semantic(repository, &vector, params.max_results, params.min_similarity)
                    .await
                    .map_err(|e| BackendError::Unavailable(e.to_string()))?
            }
        };

        debug!(hits = hits.len(), "index search complete");
        Ok(hits)
    }

    async fn repositories(&self) -> Result<Vec<String>, BackendError> {
        let repos = self
            .storage
            .list_repositories()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(repos.into_iter().map(|r| r.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repoqa_storage::NewFile;
    use uuid::Uuid;

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl EmbeddingBackend for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, BackendError> {
            Ok(self.0.clone())
        }
    }

    async fn seeded_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("repoqa_backend_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.expect("open");
        let repo = storage.upsert_repository("mf6", None, None).await.expect("repo");
        storage
            .upsert_file(
                &repo,
                &NewFile {
                    filepath: "doc/mf6io.md".into(),
                    filename: "mf6io.md".into(),
                    extension: Some("md".into()),
                    content: "MAXCOMPDIM sets the maximum compiled dimension".into(),
                    content_hash: "h1".into(),
                    embedding: Some(vec![1.0, 0.0]),
                },
            )
            .await
            .expect("file");
        Arc::new(storage)
    }

    #[tokio::test]
    async fn text_and_semantic_modes() {
        let storage = seeded_storage().await;
        let backend = IndexSearchBackend::new(storage, Some(Arc::new(FixedEmbedder(vec![1.0, 0.0]))));
        let params = SearchParams::default();

        let text = backend
            .search("mf6", "maxcompdim", SearchMode::Text, &params)
            .await
            .expect("text");
        assert_eq!(text.len(), 1);

        let semantic = backend
            .search("mf6", "maxcompdim", SearchMode::Semantic, &params)
            .await
            .expect("semantic");
        assert_eq!(semantic[0].filepath, "doc/mf6io.md");

        assert_eq!(backend.repositories().await.expect("repos"), vec!["mf6"]);
    }

    #[tokio::test]
    async fn semantic_without_embedder_is_unavailable() {
        let backend = IndexSearchBackend::new(seeded_storage().await, None);
        let err = backend
            .search("mf6", "q", SearchMode::Semantic, &SearchParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }
}
