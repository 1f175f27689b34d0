//! SQL migration definitions for the repoqa index database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: repositories, repository_files, FTS5",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Indexed repositories
CREATE TABLE IF NOT EXISTS repositories (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL UNIQUE,
    url        TEXT,
    root_path  TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- One row per indexed file. `embedding` is a JSON array of floats.
CREATE TABLE IF NOT EXISTS repository_files (
    id            TEXT PRIMARY KEY,
    repository_id TEXT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    filepath      TEXT NOT NULL,
    filename      TEXT NOT NULL,
    extension     TEXT,
    content       TEXT NOT NULL,
    content_hash  TEXT NOT NULL,
    file_size     INTEGER NOT NULL,
    embedding     TEXT,
    indexed_at    TEXT NOT NULL,
    UNIQUE(repository_id, filepath)
);

CREATE INDEX IF NOT EXISTS idx_files_repository ON repository_files(repository_id);
CREATE INDEX IF NOT EXISTS idx_files_hash ON repository_files(content_hash);

-- Full-text search on file names, paths and content
CREATE VIRTUAL TABLE IF NOT EXISTS repository_files_fts USING fts5(
    filename,
    filepath,
    content,
    content=repository_files,
    content_rowid=rowid
);

CREATE TRIGGER IF NOT EXISTS files_fts_insert AFTER INSERT ON repository_files BEGIN
    INSERT INTO repository_files_fts(rowid, filename, filepath, content)
    VALUES (new.rowid, new.filename, new.filepath, new.content);
END;

CREATE TRIGGER IF NOT EXISTS files_fts_delete AFTER DELETE ON repository_files BEGIN
    INSERT INTO repository_files_fts(repository_files_fts, rowid, filename, filepath, content)
    VALUES ('delete', old.rowid, old.filename, old.filepath, old.content);
END;

CREATE TRIGGER IF NOT EXISTS files_fts_update AFTER UPDATE ON repository_files BEGIN
    INSERT INTO repository_files_fts(repository_files_fts, rowid, filename, filepath, content)
    VALUES ('delete', old.rowid, old.filename, old.filepath, old.content);
    INSERT INTO repository_files_fts(rowid, filename, filepath, content)
    VALUES (new.rowid, new.filename, new.filepath, new.content);
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
