//! SQL DDL for the index store.
//!
//! Defines the `files`, `chunks`, `meta`, and `embedding_cache` tables plus
//! the `chunks_fts` (FTS5) and `chunks_vec` (vec0) virtual tables. All DDL
//! uses `IF NOT EXISTS` for idempotent initialization. The vector table is
//! dimensioned at creation time and must be dropped and rebuilt whenever the
//! embedding dimensionality changes.

use rusqlite::Connection;

/// Meta key holding the JSON index fingerprint.
pub const META_KEY: &str = "memory_index_meta_v1";

/// Base tables. These always exist; the virtual tables are best-effort.
const SCHEMA_SQL: &str = r#"
-- One row per indexed document
CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    source TEXT NOT NULL DEFAULT 'memory',
    hash TEXT NOT NULL,
    mtime INTEGER NOT NULL,
    size INTEGER NOT NULL
);

-- Embeddable slices of documents. `embedding` keeps the JSON float array
-- for backup and reindex seeding; the vec0 table is the search copy.
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'memory',
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    hash TEXT NOT NULL,
    model TEXT NOT NULL,
    text TEXT NOT NULL,
    embedding TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path);
CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source);
CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(hash);

-- Index fingerprint and other key/value state
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Content-hash keyed embedding cache, scoped per provider deployment
CREATE TABLE IF NOT EXISTS embedding_cache (
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    provider_key TEXT NOT NULL,
    hash TEXT NOT NULL,
    embedding TEXT NOT NULL,
    dims INTEGER,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (provider, model, provider_key, hash)
);

CREATE INDEX IF NOT EXISTS idx_embedding_cache_updated_at ON embedding_cache(updated_at);
"#;

/// FTS5 keyword index over chunk text. Creation can fail when the SQLite
/// build lacks FTS5; callers treat that as a degraded mode, not an error.
const FTS_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    text,
    id UNINDEXED,
    path UNINDEXED,
    source UNINDEXED,
    model UNINDEXED,
    start_line UNINDEXED,
    end_line UNINDEXED
);
"#;

/// Initialize the base tables. Idempotent.
pub fn init_base(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)
}

/// Try to create the FTS5 virtual table. Returns false when unavailable.
pub fn init_fts(conn: &Connection) -> bool {
    conn.execute_batch(FTS_SQL).is_ok()
}

/// Try to create the vec0 virtual table with the given dimensionality.
/// Returns false when the vector extension is unavailable.
pub fn init_vec(conn: &Connection, dims: usize) -> bool {
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_vec USING vec0(
            id TEXT PRIMARY KEY,
            embedding FLOAT[{dims}]
        );"
    ))
    .is_ok()
}

/// Drop the vec0 table (used when dimensionality changes).
pub fn drop_vec(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("DROP TABLE IF EXISTS chunks_vec;")
}
