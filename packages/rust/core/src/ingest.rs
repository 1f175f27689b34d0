//! Repository ingestion: local checkout → document index.
//!
//! Walks a directory honouring `.gitignore` files, keeps text files, and
//! upserts them into [`Storage`] with a content hash so unchanged files are
//! skipped on re-index. Files that disappeared from the checkout are dropped
//! from the index.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use ignore::{DirEntry, WalkBuilder};

use repoqa_shared::{EmbeddingBackend, RepoQaError, Result};
use repoqa_storage::{NewFile, Storage};

/// Files larger than this are not indexed.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Characters of a file sent to the embedding backend.
const EMBED_CHARS: usize = 8000;

/// Vendored or generated directories skipped even when no `.gitignore` names them.
const SKIPPED_DIRS: &[&str] = &["node_modules", "__pycache__", "target", "dist", "build", "venv"];

const BINARY_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp", "ico", "svg", "mp3", "wav", "flac", "aac",
    "ogg", "m4a", "mp4", "avi", "mkv", "mov", "webm", "flv", "zip", "tar", "gz", "bz2", "xz", "7z",
    "rar", "exe", "dll", "so", "dylib", "bin", "pdf", "docx", "xlsx", "pptx", "class", "pyc",
];

const TEXT_EXTENSIONS: &[&str] = &[
    "py", "js", "jsx", "ts", "tsx", "java", "c", "cpp", "h", "hpp", "cs", "go", "rs", "rb", "php",
    "swift", "kt", "scala", "f", "f90", "f95", "for", "html", "htm", "css", "scss", "json", "xml",
    "yaml", "yml", "md", "rst", "txt", "tex", "conf", "cfg", "ini", "toml", "sh", "bash", "zsh",
    "ps1", "bat", "nam", "dfn",
];

/// What to ingest and how.
#[derive(Clone)]
pub struct IngestOptions {
    pub name: String,
    pub url: Option<String>,
    pub root: PathBuf,
    pub max_file_bytes: u64,
    /// Embed each indexed file for semantic search.
    pub embedder: Option<Arc<dyn EmbeddingBackend>>,
}

impl IngestOptions {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            url: None,
            root: root.into(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            embedder: None,
        }
    }
}

/// Counts reported when ingestion finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestStats {
    pub repository_id: String,
    pub scanned: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub embedded: usize,
    /// Previously indexed files no longer in the checkout.
    pub removed: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Progress callback for ingestion.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after each candidate file.
    fn file_processed(&self, path: &str, current: usize, total: usize);
    /// Called when ingestion completes.
    fn done(&self, stats: &IngestStats);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn file_processed(&self, _path: &str, _current: usize, _total: usize) {}
    fn done(&self, _stats: &IngestStats) {}
}

/// Index a local repository checkout.
#[instrument(skip_all, fields(name = %options.name, root = %options.root.display()))]
pub async fn ingest_repository(
    storage: &Storage,
    options: &IngestOptions,
    progress: &dyn ProgressReporter,
) -> Result<IngestStats> {
    let start = Instant::now();
    if !options.root.is_dir() {
        return Err(RepoQaError::validation(format!(
            "{} is not a directory",
            options.root.display()
        )));
    }

    progress.phase("Registering repository");
    let root = options.root.to_string_lossy().to_string();
    let repository_id = storage
        .upsert_repository(&options.name, options.url.as_deref(), Some(&root))
        .await?;

    progress.phase("Scanning files");
    let (candidates, skipped) = collect_candidates(&options.root, options.max_file_bytes);
    info!(candidates = candidates.len(), skipped, "scan complete");

    let mut stats = IngestStats {
        repository_id: repository_id.clone(),
        scanned: candidates.len() + skipped,
        skipped,
        ..IngestStats::default()
    };

    progress.phase("Indexing files");
    let total = candidates.len();
    let mut present = Vec::with_capacity(total);
    for (i, path) in candidates.iter().enumerate() {
        let relative = relative_path(&options.root, path);
        match index_file(storage, &repository_id, path, &relative, options).await {
            Ok(FileOutcome::Indexed { embedded }) => {
                stats.indexed += 1;
                if embedded {
                    stats.embedded += 1;
                }
                present.push(relative.clone());
            }
            Ok(FileOutcome::Unchanged) => {
                stats.unchanged += 1;
                present.push(relative.clone());
            }
            Ok(FileOutcome::NotText) => stats.skipped += 1,
            Err(e) => {
                // Keep whatever was indexed before; the file is still there.
                warn!(path = %relative, error = %e, "failed to index file");
                stats.failed += 1;
                present.push(relative.clone());
            }
        }
        progress.file_processed(&relative, i + 1, total);
    }

    progress.phase("Removing deleted files");
    let removed = storage.remove_missing_files(&repository_id, &present).await?;
    for path in &removed {
        debug!(path = %path, "removed from index");
    }
    stats.removed = removed.len();

    stats.elapsed = start.elapsed();
    info!(
        indexed = stats.indexed,
        unchanged = stats.unchanged,
        removed = stats.removed,
        skipped = stats.skipped,
        failed = stats.failed,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        "ingestion complete"
    );
    progress.done(&stats);
    Ok(stats)
}

enum FileOutcome {
    Indexed { embedded: bool },
    Unchanged,
    NotText,
}

async fn index_file(
    storage: &Storage,
    repository_id: &str,
    path: &Path,
    relative: &str,
    options: &IngestOptions,
) -> Result<FileOutcome> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| RepoQaError::io(path, e))?;
    if bytes.contains(&0) {
        return Ok(FileOutcome::NotText);
    }
    let content = String::from_utf8_lossy(&bytes).into_owned();
    let content_hash = sha256_hex(&bytes);

    if storage.file_hash(repository_id, relative).await?.as_deref() == Some(content_hash.as_str()) {
        debug!(path = %relative, "unchanged");
        return Ok(FileOutcome::Unchanged);
    }

    let embedding = match &options.embedder {
        Some(embedder) => {
            let excerpt: String = content.chars().take(EMBED_CHARS).collect();
            match embedder.embed(&excerpt).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    warn!(path = %relative, error = %e, "embedding failed, indexing text only");
                    None
                }
            }
        }
        None => None,
    };
    let embedded = embedding.is_some();

    let file = NewFile {
        filepath: relative.to_string(),
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| relative.to_string()),
        extension: extension_of(path),
        content,
        content_hash,
        embedding,
    };
    storage.upsert_file(repository_id, &file).await?;
    Ok(FileOutcome::Indexed { embedded })
}

/// Text-file candidates under `root`, plus the number of files rejected.
///
/// Hidden entries and anything matched by a `.gitignore` (at any depth) are
/// never visited, so they are not counted as rejected.
fn collect_candidates(root: &Path, max_file_bytes: u64) -> (Vec<PathBuf>, usize) {
    let mut candidates = Vec::new();
    let mut skipped = 0;

    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .git_exclude(true)
        .git_global(false)
        .require_git(false)
        .parents(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|e| !is_vendored_dir(e))
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        let size = entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX);
        if size > max_file_bytes || !is_text_path(path) {
            skipped += 1;
            continue;
        }
        candidates.push(path.to_path_buf());
    }
    (candidates, skipped)
}

fn is_vendored_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_some_and(|t| t.is_dir())
        && SKIPPED_DIRS.contains(&entry.file_name().to_string_lossy().as_ref())
}

/// Known text extensions, plus extension-less files such as `README` or
/// `Makefile`.
fn is_text_path(path: &Path) -> bool {
    match extension_of(path) {
        Some(ext) if BINARY_EXTENSIONS.contains(&ext.as_str()) => false,
        Some(ext) => TEXT_EXTENSIONS.contains(&ext.as_str()),
        None => true,
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// Forward-slash path relative to the repository root.
fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
