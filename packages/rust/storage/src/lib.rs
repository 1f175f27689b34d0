//! libSQL storage layer for the repository index (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding indexed
//! repositories, their files, optional embeddings and an FTS5 index.
//!
//! **Access rules:**
//! - `repoqa index`: read-write (sole writer) via [`Storage::open`]
//! - `repoqa ask`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, params};
use repoqa_shared::{RepoQaError, Result, SearchHit};
use uuid::Uuid;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// An indexed repository with its file count.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryRecord {
    pub id: String,
    pub name: String,
    pub url: Option<String>,
    pub root_path: Option<String>,
    pub file_count: u64,
}

/// A file to be written to the index.
#[derive(Debug, Clone)]
pub struct NewFile {
    /// Path relative to the repository root, `/`-separated.
    pub filepath: String,
    pub filename: String,
    pub extension: Option<String>,
    pub content: String,
    pub content_hash: String,
    pub embedding: Option<Vec<f32>>,
}

fn db_err(e: libsql::Error) -> RepoQaError {
    RepoQaError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RepoQaError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RepoQaError::Storage(format!(
                "index not found at {}; run `repoqa index` first",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    RepoQaError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(RepoQaError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Repository operations
    // -----------------------------------------------------------------------

    /// Insert a repository, or refresh its url/root path if the name exists.
    /// Returns the repository id.
    pub async fn upsert_repository(
        &self,
        name: &str,
        url: Option<&str>,
        root_path: Option<&str>,
    ) -> Result<String> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let id = Uuid::now_v7().to_string();

        self.conn
            .execute(
                "INSERT INTO repositories (id, name, url, root_path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                    url = excluded.url,
                    root_path = excluded.root_path,
                    updated_at = excluded.updated_at",
                params![id.as_str(), name, url, root_path, now.as_str()],
            )
            .await
            .map_err(db_err)?;

        self.repository_id(name)
            .await?
            .ok_or_else(|| RepoQaError::Storage(format!("repository {name} vanished after upsert")))
    }

    /// Look up a repository id by name.
    pub async fn repository_id(&self, name: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT id FROM repositories WHERE name = ?1", params![name])
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }

    /// List all repositories, ordered by name.
    pub async fn list_repositories(&self) -> Result<Vec<RepositoryRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT r.id, r.name, r.url, r.root_path, COUNT(f.id)
                 FROM repositories r
                 LEFT JOIN repository_files f ON f.repository_id = r.id
                 GROUP BY r.id
                 ORDER BY r.name",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(RepositoryRecord {
                id: row.get::<String>(0).map_err(db_err)?,
                name: row.get::<String>(1).map_err(db_err)?,
                url: row.get::<String>(2).ok(),
                root_path: row.get::<String>(3).ok(),
                file_count: row.get::<u64>(4).unwrap_or(0),
            });
        }
        Ok(results)
    }

    /// Delete a repository and every indexed file it owns.
    /// Returns the number of files removed, or `None` if no such repository.
    pub async fn delete_repository(&self, name: &str) -> Result<Option<u64>> {
        self.check_writable()?;
        let Some(id) = self.repository_id(name).await? else {
            return Ok(None);
        };

        // The delete trigger keeps the FTS table in step.
        let removed = self
            .conn
            .execute(
                "DELETE FROM repository_files WHERE repository_id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(db_err)?;
        self.conn
            .execute("DELETE FROM repositories WHERE id = ?1", params![id.as_str()])
            .await
            .map_err(db_err)?;

        tracing::info!(repository = name, files = removed, "repository deleted");
        Ok(Some(removed))
    }

    // -----------------------------------------------------------------------
    // File operations
    // -----------------------------------------------------------------------

    /// Insert or update a file keyed on `(repository, filepath)`.
    pub async fn upsert_file(&self, repository_id: &str, file: &NewFile) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let id = Uuid::now_v7().to_string();
        let embedding = match &file.embedding {
            Some(vector) => Some(
                serde_json::to_string(vector)
                    .map_err(|e| RepoQaError::Storage(format!("encode embedding: {e}")))?,
            ),
            None => None,
        };

        self.conn
            .execute(
                "INSERT INTO repository_files
                    (id, repository_id, filepath, filename, extension, content,
                     content_hash, file_size, embedding, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(repository_id, filepath) DO UPDATE SET
                    filename = excluded.filename,
                    extension = excluded.extension,
                    content = excluded.content,
                    content_hash = excluded.content_hash,
                    file_size = excluded.file_size,
                    embedding = excluded.embedding,
                    indexed_at = excluded.indexed_at",
                params![
                    id.as_str(),
                    repository_id,
                    file.filepath.as_str(),
                    file.filename.as_str(),
                    file.extension.as_deref(),
                    file.content.as_str(),
                    file.content_hash.as_str(),
                    file.content.len() as i64,
                    embedding.as_deref(),
                    now.as_str()
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Stored content hash of a file, if it is indexed.
    pub async fn file_hash(&self, repository_id: &str, filepath: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT content_hash FROM repository_files
                 WHERE repository_id = ?1 AND filepath = ?2",
                params![repository_id, filepath],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }

    /// Delete the files of a repository whose paths are not in `present`.
    /// Returns the removed paths.
    pub async fn remove_missing_files(
        &self,
        repository_id: &str,
        present: &[String],
    ) -> Result<Vec<String>> {
        self.check_writable()?;
        let present: HashSet<&str> = present.iter().map(String::as_str).collect();

        let mut stale = Vec::new();
        {
            let mut rows = self
                .conn
                .query(
                    "SELECT filepath FROM repository_files WHERE repository_id = ?1",
                    params![repository_id],
                )
                .await
                .map_err(db_err)?;
            while let Some(row) = rows.next().await.map_err(db_err)? {
                let filepath = row.get::<String>(0).map_err(db_err)?;
                if !present.contains(filepath.as_str()) {
                    stale.push(filepath);
                }
            }
        }

        for filepath in &stale {
            self.conn
                .execute(
                    "DELETE FROM repository_files WHERE repository_id = ?1 AND filepath = ?2",
                    params![repository_id, filepath.as_str()],
                )
                .await
                .map_err(db_err)?;
        }
        stale.sort();
        Ok(stale)
    }

    /// Number of indexed files in a repository.
    pub async fn count_files(&self, repository: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(f.id) FROM repository_files f
                 JOIN repositories r ON r.id = f.repository_id
                 WHERE r.name = ?1",
                params![repository],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<u64>(0).unwrap_or(0)),
            None => Ok(0),
        }
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Full-text search within one repository.
    ///
    /// Scores are bm25 ranks normalized against the best hit, so the top
    /// result scores 1.0.
    pub async fn search_text(
        &self,
        repository: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let Some(expression) = match_expression(query) else {
            return Ok(Vec::new());
        };

        let mut rows = self
            .conn
            .query(
                "SELECT r.name, f.filepath, f.filename, f.content,
                        bm25(repository_files_fts) AS score
                 FROM repository_files_fts fts
                 JOIN repository_files f ON f.rowid = fts.rowid
                 JOIN repositories r ON r.id = f.repository_id
                 WHERE repository_files_fts MATCH ?1 AND r.name = ?2
                 ORDER BY score
                 LIMIT ?3",
                params![expression.as_str(), repository, limit as i64],
            )
            .await
            .map_err(db_err)?;

        let mut ranked = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let rank = row.get::<f64>(4).unwrap_or(0.0);
            ranked.push((row_to_hit(&row)?, rank));
        }

        // bm25 is negative; more negative is better.
        let best = ranked
            .iter()
            .map(|(_, rank)| *rank)
            .fold(0.0_f64, f64::min);

        Ok(ranked
            .into_iter()
            .map(|(mut hit, rank)| {
                hit.relevance_score = if best < 0.0 {
                    (rank / best).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                hit
            })
            .collect())
    }

    /// Vector search within one repository by cosine similarity.
    pub async fn search_semantic(
        &self,
        repository: &str,
        embedding: &[f32],
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<SearchHit>> {
        let mut rows = self
            .conn
            .query(
                "SELECT r.name, f.filepath, f.filename, f.content, f.embedding
                 FROM repository_files f
                 JOIN repositories r ON r.id = f.repository_id
                 WHERE r.name = ?1 AND f.embedding IS NOT NULL",
                params![repository],
            )
            .await
            .map_err(db_err)?;

        let mut hits = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let raw: String = row.get(4).map_err(db_err)?;
            let vector: Vec<f32> = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping file with malformed embedding");
                    continue;
                }
            };

            let similarity = cosine_similarity(embedding, &vector);
            if similarity < min_similarity {
                continue;
            }

            let mut hit = row_to_hit(&row)?;
            hit.relevance_score = similarity.clamp(0.0, 1.0);
            hits.push(hit);
        }

        hits.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Build an FTS5 match expression from free text: each word quoted, OR-ed.
fn match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 1)
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Cosine similarity of two vectors; 0.0 when lengths differ or a norm is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0_f64, 0.0_f64, 0.0_f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Convert the leading `(repository, filepath, filename, content)` columns.
fn row_to_hit(row: &libsql::Row) -> Result<SearchHit> {
    Ok(SearchHit {
        repository: row.get::<String>(0).map_err(db_err)?,
        filepath: row.get::<String>(1).map_err(db_err)?,
        filename: row.get::<String>(2).map_err(db_err)?,
        content: row.get::<String>(3).map_err(db_err)?,
        relevance_score: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("repoqa_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn file(path: &str, content: &str, embedding: Option<Vec<f32>>) -> NewFile {
        let filename = path.rsplit('/').next().unwrap_or(path).to_string();
        NewFile {
            filepath: path.into(),
            extension: filename.rsplit_once('.').map(|(_, ext)| ext.to_string()),
            filename,
            content: content.into(),
            content_hash: format!("hash-{}", content.len()),
            embedding,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("repoqa_test_{}.db", Uuid::now_v7()));
        let first = Storage::open(&tmp).await.expect("first open");
        drop(first);
        let second = Storage::open(&tmp).await.expect("second open");
        assert_eq!(second.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn repository_upsert_keeps_id() {
        let storage = test_storage().await;
        let id = storage
            .upsert_repository("flopy", Some("https://github.com/modflowpy/flopy"), None)
            .await
            .expect("insert");
        let again = storage
            .upsert_repository("flopy", None, Some("/src/flopy"))
            .await
            .expect("update");
        assert_eq!(id, again);

        let repos = storage.list_repositories().await.expect("list");
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].root_path.as_deref(), Some("/src/flopy"));
        assert_eq!(repos[0].file_count, 0);
    }

    #[tokio::test]
    async fn file_upsert_replaces_content() {
        let storage = test_storage().await;
        let repo = storage.upsert_repository("mf6", None, None).await.unwrap();

        storage
            .upsert_file(&repo, &file("doc/wel.md", "well package", None))
            .await
            .expect("insert file");
        storage
            .upsert_file(&repo, &file("doc/wel.md", "well package v2 docs", None))
            .await
            .expect("update file");

        assert_eq!(storage.count_files("mf6").await.unwrap(), 1);
        let hash = storage.file_hash(&repo, "doc/wel.md").await.unwrap();
        assert_eq!(hash.as_deref(), Some("hash-20"));
    }

    #[tokio::test]
    async fn missing_files_are_removed_from_search() {
        let storage = test_storage().await;
        let repo = storage.upsert_repository("mf6", None, None).await.unwrap();
        for (path, content) in [
            ("doc/dis.md", "discretization maxcompdim"),
            ("doc/wel.md", "well package"),
            ("README.md", "mf6 readme"),
        ] {
            storage.upsert_file(&repo, &file(path, content, None)).await.unwrap();
        }

        let removed = storage
            .remove_missing_files(&repo, &["README.md".to_string(), "doc/wel.md".to_string()])
            .await
            .expect("remove");
        assert_eq!(removed, vec!["doc/dis.md"]);
        assert_eq!(storage.count_files("mf6").await.unwrap(), 2);
        let hits = storage.search_text("mf6", "maxcompdim", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn deleting_a_repository_drops_its_files() {
        let storage = test_storage().await;
        let mf6 = storage.upsert_repository("mf6", None, None).await.unwrap();
        let flopy = storage.upsert_repository("flopy", None, None).await.unwrap();
        storage.upsert_file(&mf6, &file("doc/wel.md", "wells", None)).await.unwrap();
        storage.upsert_file(&mf6, &file("doc/rch.md", "recharge", None)).await.unwrap();
        storage.upsert_file(&flopy, &file("wel.py", "wells", None)).await.unwrap();

        assert_eq!(storage.delete_repository("mf6").await.unwrap(), Some(2));
        assert_eq!(storage.delete_repository("mf6").await.unwrap(), None);

        let names: Vec<_> = storage
            .list_repositories()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["flopy"]);
        assert!(storage.search_text("mf6", "wells", 10).await.unwrap().is_empty());
        assert_eq!(storage.search_text("flopy", "wells", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn text_search_scopes_to_repository() {
        let storage = test_storage().await;
        let mf6 = storage.upsert_repository("mf6", None, None).await.unwrap();
        let flopy = storage.upsert_repository("flopy", None, None).await.unwrap();

        storage
            .upsert_file(&mf6, &file("doc/wel.md", "The WEL package simulates wells", None))
            .await
            .unwrap();
        storage
            .upsert_file(&mf6, &file("doc/rch.md", "Recharge package input", None))
            .await
            .unwrap();
        storage
            .upsert_file(&flopy, &file("flopy/wel.py", "class ModflowGwfwel wells", None))
            .await
            .unwrap();

        let hits = storage
            .search_text("mf6", "how do wells work?", 10)
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].filepath, "doc/wel.md");
        assert_eq!(hits[0].relevance_score, 1.0);
    }

    #[tokio::test]
    async fn text_search_ignores_punctuation_only_queries() {
        let storage = test_storage().await;
        let hits = storage.search_text("mf6", "?!", 10).await.expect("search");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn semantic_search_ranks_by_cosine() {
        let storage = test_storage().await;
        let repo = storage.upsert_repository("mf6", None, None).await.unwrap();

        storage
            .upsert_file(&repo, &file("a.md", "aligned", Some(vec![1.0, 0.0])))
            .await
            .unwrap();
        storage
            .upsert_file(&repo, &file("b.md", "diagonal", Some(vec![1.0, 1.0])))
            .await
            .unwrap();
        storage
            .upsert_file(&repo, &file("c.md", "orthogonal", Some(vec![0.0, 1.0])))
            .await
            .unwrap();
        storage
            .upsert_file(&repo, &file("d.md", "no vector", None))
            .await
            .unwrap();

        let hits = storage
            .search_semantic("mf6", &[1.0, 0.0], 10, 0.3)
            .await
            .expect("search");
        let paths: Vec<_> = hits.iter().map(|h| h.filepath.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "b.md"]);
        assert!((hits[0].relevance_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert!((cosine_similarity(&[2.0, 0.0], &[3.0, 0.0]) - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("repoqa_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.upsert_repository("mf6", None, None).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro.upsert_repository("flopy", None, None).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn readonly_requires_existing_index() {
        let tmp = std::env::temp_dir().join(format!("repoqa_missing_{}.db", Uuid::now_v7()));
        let result = Storage::open_readonly(&tmp).await;
        assert!(result.is_err());
    }
}
