//! Write path: scanning sources, diffing against the stored file table, and
//! (re)indexing changed documents.
//!
//! Incremental syncs touch only the sources marked dirty and index files
//! whose content hash changed, deleting rows for files that disappeared.
//! A full reindex builds a complete shadow store next to the primary and
//! promotes it with an atomic rename of the `{db, db-wal, db-shm}` file set,
//! falling back to the previous files if any rename fails. Each file is
//! indexed as one transaction, so a crash mid-sync leaves a consistent index
//! of the files processed so far.

use anyhow::{Context, Result};
use rusqlite::params;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::chunk::{chunk_markdown, hash_text};
use crate::config::MnemosConfig;
use crate::db::{remove_store_files, rename_store_files, IndexMeta, Store};
use crate::embedding::batch::{BatchManager, PendingText};
use crate::embedding::Provider;
use crate::error::MemoryError;
use crate::index::cache::{self, CacheScope};
use crate::index::{embedding_to_bytes, embedding_to_json, session, SOURCE_MEMORY, SOURCE_SESSIONS};

/// Why a sync was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    SessionStart,
    Search,
    Watch,
    Interval,
    SessionDelta,
    Fallback,
    Manual,
}

impl SyncReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncReason::SessionStart => "session-start",
            SyncReason::Search => "search",
            SyncReason::Watch => "watch",
            SyncReason::Interval => "interval",
            SyncReason::SessionDelta => "session-delta",
            SyncReason::Fallback => "fallback",
            SyncReason::Manual => "manual",
        }
    }
}

/// Options for one sync request.
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub reason: SyncReason,
    pub force: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            reason: SyncReason::Manual,
            force: false,
        }
    }
}

/// Outcome of a completed sync.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub reason: &'static str,
    pub full: bool,
    pub indexed_files: usize,
    pub deleted_files: usize,
    pub chunks_written: usize,
    pub duration_ms: u128,
}

/// Which sources an incremental sync should visit.
#[derive(Debug, Clone, Copy)]
pub struct SyncScope {
    pub memory: bool,
    pub sessions: bool,
}

/// Everything the engine needs besides the store itself.
pub struct EngineContext<'a> {
    pub cfg: &'a MnemosConfig,
    pub provider: &'a Provider,
    pub provider_key: &'a str,
    pub batch: &'a BatchManager,
    pub workspace: &'a Path,
    pub sessions_dir: &'a Path,
}

impl EngineContext<'_> {
    fn cache_scope(&self) -> CacheScope {
        CacheScope {
            provider: self.provider.id().to_string(),
            model: self.provider.model().to_string(),
            provider_key: self.provider_key.to_string(),
        }
    }

    fn fingerprint(&self, vector_dims: Option<usize>) -> IndexMeta {
        IndexMeta {
            model: self.provider.model().to_string(),
            provider: self.provider.id().to_string(),
            provider_key: self.provider_key.to_string(),
            chunk_tokens: self.cfg.chunking.tokens,
            chunk_overlap: self.cfg.chunking.overlap,
            vector_dims,
        }
    }
}

/// A document discovered on disk, with its derived indexable content.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub source: &'static str,
    pub mtime_ms: i64,
    pub size: i64,
    pub hash: String,
    pub content: String,
}

/// Decide whether the stored fingerprint forces a full reindex.
pub fn needs_full_reindex(store: &Store, ctx: &EngineContext<'_>) -> Result<bool> {
    let Some(meta) = store.read_meta()? else {
        return Ok(true);
    };
    let expected = ctx.fingerprint(meta.vector_dims);
    if meta != expected {
        tracing::info!(
            stored = ?meta,
            "index fingerprint changed; full reindex required"
        );
        return Ok(true);
    }
    // Vector storage became usable after chunks were indexed without it.
    if store.vector_enabled() && meta.vector_dims.is_none() && vector_runtime_available(store) {
        let chunks: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
        if chunks > 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

fn vector_runtime_available(store: &Store) -> bool {
    store
        .conn()
        .query_row("SELECT vec_version()", [], |r| r.get::<_, String>(0))
        .is_ok()
}

/// Run an incremental sync over the dirty sources.
pub async fn run_incremental(
    store: &mut Store,
    ctx: &EngineContext<'_>,
    scope: SyncScope,
    reason: SyncReason,
) -> Result<SyncReport> {
    let started = std::time::Instant::now();
    let stats = sync_sources(store, ctx, scope).await?;
    finalize(store, ctx)?;
    Ok(SyncReport {
        reason: reason.as_str(),
        full: false,
        indexed_files: stats.indexed_files,
        deleted_files: stats.deleted_files,
        chunks_written: stats.chunks_written,
        duration_ms: started.elapsed().as_millis(),
    })
}

/// Rebuild the whole index. For file-backed stores this builds a shadow
/// store and atomically swaps it in; in-memory stores are rebuilt in place.
pub async fn run_full(
    store: &mut Store,
    ctx: &EngineContext<'_>,
    reason: SyncReason,
) -> Result<SyncReport> {
    let started = std::time::Instant::now();

    let stats = if store.path().as_os_str().is_empty() {
        clear_index_rows(store)?;
        let stats = sync_sources(store, ctx, SyncScope { memory: true, sessions: true }).await?;
        finalize(store, ctx)?;
        stats
    } else {
        rebuild_with_swap(store, ctx).await?
    };

    Ok(SyncReport {
        reason: reason.as_str(),
        full: true,
        indexed_files: stats.indexed_files,
        deleted_files: stats.deleted_files,
        chunks_written: stats.chunks_written,
        duration_ms: started.elapsed().as_millis(),
    })
}

async fn rebuild_with_swap(store: &mut Store, ctx: &EngineContext<'_>) -> Result<SyncStats> {
    let primary = store.path().to_path_buf();
    let vector_enabled = store.vector_enabled();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let tmp_path = sibling_path(&primary, &format!(".tmp-{suffix}"));
    let backup_path = sibling_path(&primary, &format!(".bak-{suffix}"));

    // Build the shadow store while the primary stays live for readers.
    let build = async {
        let mut shadow = Store::open(&tmp_path, vector_enabled)
            .context("failed to create shadow store for reindex")?;
        seed_cache(store, &shadow)?;
        let stats =
            sync_sources(&mut shadow, ctx, SyncScope { memory: true, sessions: true }).await?;
        finalize(&mut shadow, ctx)?;
        Ok::<SyncStats, anyhow::Error>(stats)
    }
    .await;

    let stats = match build {
        Ok(stats) => stats,
        Err(err) => {
            remove_store_files(&tmp_path);
            return Err(err);
        }
    };

    // Close the primary handle before touching its files. Readers holding
    // the old handle keep reading the old inode after the rename.
    let placeholder = Store::open_in_memory(vector_enabled)?;
    drop(std::mem::replace(store, placeholder));

    if let Err(err) = rename_store_files(&primary, &backup_path) {
        remove_store_files(&tmp_path);
        *store = Store::open(&primary, vector_enabled)?;
        return Err(MemoryError::SwapFailed {
            stage: "backup".into(),
            details: err.to_string(),
        }
        .into());
    }

    if let Err(err) = rename_store_files(&tmp_path, &primary) {
        let restored = rename_store_files(&backup_path, &primary);
        remove_store_files(&tmp_path);
        *store = Store::open(&primary, vector_enabled)?;
        let details = match restored {
            Ok(()) => format!("{err}; previous index restored from backup"),
            Err(restore_err) => format!("{err}; restore also failed: {restore_err}"),
        };
        return Err(MemoryError::SwapFailed {
            stage: "promote".into(),
            details,
        }
        .into());
    }

    remove_store_files(&backup_path);
    *store = Store::open(&primary, vector_enabled)?;
    tracing::info!(path = %primary.display(), "full reindex swapped in");
    Ok(stats)
}

/// Copy embedding cache rows from the live store into the shadow store so a
/// reindex never re-embeds content it has already paid for.
fn seed_cache(live: &Store, shadow: &Store) -> Result<()> {
    let mut stmt = live.conn().prepare(
        "SELECT provider, model, provider_key, hash, embedding, dims, updated_at
         FROM embedding_cache",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, String>(4)?,
            r.get::<_, Option<i64>>(5)?,
            r.get::<_, i64>(6)?,
        ))
    })?;

    let mut insert = shadow.conn().prepare(
        "INSERT OR REPLACE INTO embedding_cache
         (provider, model, provider_key, hash, embedding, dims, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for row in rows {
        let (provider, model, provider_key, hash, embedding, dims, updated_at) = row?;
        insert.execute(params![provider, model, provider_key, hash, embedding, dims, updated_at])?;
    }
    Ok(())
}

struct SyncStats {
    indexed_files: usize,
    deleted_files: usize,
    chunks_written: usize,
}

async fn sync_sources(
    store: &mut Store,
    ctx: &EngineContext<'_>,
    scope: SyncScope,
) -> Result<SyncStats> {
    let mut stats = SyncStats {
        indexed_files: 0,
        deleted_files: 0,
        chunks_written: 0,
    };

    let mut sources: Vec<&'static str> = Vec::new();
    let mut desired: Vec<FileEntry> = Vec::new();

    if scope.memory && ctx.cfg.sources.memory {
        sources.push(SOURCE_MEMORY);
        desired.extend(scan_memory_files(ctx.workspace, &ctx.cfg.sources.extra_paths)?);
    }
    if scope.sessions && ctx.cfg.sources.sessions {
        sources.push(SOURCE_SESSIONS);
        desired.extend(scan_session_files(ctx.sessions_dir)?);
    }

    for entry in &desired {
        let existing: Option<String> = store
            .conn()
            .query_row(
                "SELECT hash FROM files WHERE path = ?1 AND source = ?2",
                params![entry.rel_path, entry.source],
                |r| r.get(0),
            )
            .optional()?;
        if existing.as_deref() == Some(entry.hash.as_str()) {
            continue;
        }
        stats.chunks_written += index_file(store, ctx, entry).await?;
        stats.indexed_files += 1;
    }

    // Remove rows for files that no longer exist in the scanned sources.
    let active: HashSet<(String, &str)> = desired
        .iter()
        .map(|e| (e.rel_path.clone(), e.source))
        .collect();
    for source in sources {
        let stale: Vec<String> = {
            let mut stmt = store
                .conn()
                .prepare("SELECT path FROM files WHERE source = ?1")?;
            let rows = stmt.query_map(params![source], |r| r.get::<_, String>(0))?;
            rows.filter_map(|r| r.ok())
                .filter(|p| !active.contains(&(p.clone(), source)))
                .collect()
        };
        for path in stale {
            remove_file_rows(store, &path, source)?;
            stats.deleted_files += 1;
        }
    }

    Ok(stats)
}

/// Write the fingerprint and prune the cache after a successful pass.
fn finalize(store: &mut Store, ctx: &EngineContext<'_>) -> Result<()> {
    let meta = ctx.fingerprint(store.vector_dims);
    store.write_meta(&meta)?;
    cache::prune_if_needed(
        store.conn(),
        ctx.cfg.cache.max_entries,
        ctx.cfg.cache.enabled,
    )?;
    Ok(())
}

/// Index one file: chunk, resolve embeddings (cache first, then provider),
/// and replace the file's rows in a single transaction.
async fn index_file(store: &mut Store, ctx: &EngineContext<'_>, entry: &FileEntry) -> Result<usize> {
    let chunks: Vec<_> = chunk_markdown(
        &entry.content,
        ctx.cfg.chunking.tokens,
        ctx.cfg.chunking.overlap,
    );
    let model = ctx.provider.model().to_string();

    let ids: Vec<String> = chunks
        .iter()
        .map(|c| {
            hash_text(&format!(
                "{}:{}:{}:{}:{}:{}",
                entry.source, entry.rel_path, c.start_line, c.end_line, c.hash, model
            ))
        })
        .collect();

    // Resolve embeddings: cache hits first, the rest through the batcher.
    let scope = ctx.cache_scope();
    let hashes: Vec<String> = chunks.iter().map(|c| c.hash.clone()).collect();
    let cached = cache::load(store.conn(), &scope, &hashes, ctx.cfg.cache.enabled)?;
    let mut embeddings: Vec<Option<Vec<f32>>> =
        chunks.iter().map(|c| cached.get(&c.hash).cloned()).collect();

    let pending: Vec<PendingText> = chunks
        .iter()
        .enumerate()
        .filter(|(i, _)| embeddings[*i].is_none())
        .map(|(i, c)| PendingText {
            index: i,
            text: c.text.clone(),
            custom_id: hash_text(&format!(
                "{}:{}:{}:{}:{}:{}",
                entry.source, entry.rel_path, c.start_line, c.end_line, c.hash, i
            )),
        })
        .collect();

    if !pending.is_empty() {
        let resolved = ctx
            .batch
            .embed_texts(ctx.provider, &pending)
            .await
            .with_context(|| format!("embeddings failed for {}", entry.rel_path))?;
        let mut fresh: Vec<(String, Vec<f32>)> = Vec::new();
        for item in &pending {
            let vector = resolved.get(&item.index).cloned().ok_or_else(|| {
                anyhow::anyhow!(
                    "embedding batch returned no vector for {} chunk {}",
                    entry.rel_path,
                    item.index
                )
            })?;
            fresh.push((chunks[item.index].hash.clone(), vector.clone()));
            embeddings[item.index] = Some(vector);
        }
        cache::upsert(store.conn(), &scope, &fresh, ctx.cfg.cache.enabled)?;
    }

    // The vector table's dimensionality follows the provider's output.
    if let Some(dims) = embeddings.iter().flatten().map(Vec::len).find(|d| *d > 0) {
        store.ensure_vector_table(dims);
    }

    let now = chrono::Utc::now().timestamp_millis();
    let fts_available = store.fts_available;
    let vector_available = store.vector_available;
    let conn = store.conn();
    let tx = conn.unchecked_transaction()?;

    if vector_available {
        tx.execute(
            "DELETE FROM chunks_vec WHERE id IN
             (SELECT id FROM chunks WHERE path = ?1 AND source = ?2)",
            params![entry.rel_path, entry.source],
        )?;
    }
    if fts_available {
        tx.execute(
            "DELETE FROM chunks_fts WHERE path = ?1 AND source = ?2",
            params![entry.rel_path, entry.source],
        )?;
    }
    tx.execute(
        "DELETE FROM chunks WHERE path = ?1 AND source = ?2",
        params![entry.rel_path, entry.source],
    )?;

    for (i, chunk) in chunks.iter().enumerate() {
        let embedding = embeddings[i].as_deref().unwrap_or(&[]);
        tx.execute(
            "INSERT INTO chunks
             (id, path, source, start_line, end_line, hash, model, text, embedding, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
               hash = excluded.hash, model = excluded.model, text = excluded.text,
               embedding = excluded.embedding, updated_at = excluded.updated_at",
            params![
                ids[i],
                entry.rel_path,
                entry.source,
                chunk.start_line as i64,
                chunk.end_line as i64,
                chunk.hash,
                model,
                chunk.text,
                embedding_to_json(embedding),
                now,
            ],
        )?;
        if fts_available {
            tx.execute(
                "INSERT INTO chunks_fts (text, id, path, source, model, start_line, end_line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    chunk.text,
                    ids[i],
                    entry.rel_path,
                    entry.source,
                    model,
                    chunk.start_line as i64,
                    chunk.end_line as i64,
                ],
            )?;
        }
        if vector_available && !embedding.is_empty() {
            tx.execute(
                "INSERT INTO chunks_vec (id, embedding) VALUES (?1, ?2)",
                params![ids[i], embedding_to_bytes(embedding)],
            )?;
        }
    }

    tx.execute(
        "INSERT INTO files (path, source, hash, mtime, size) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(path) DO UPDATE SET
           source = excluded.source, hash = excluded.hash,
           mtime = excluded.mtime, size = excluded.size",
        params![entry.rel_path, entry.source, entry.hash, entry.mtime_ms, entry.size],
    )?;

    tx.commit()?;
    tracing::debug!(path = %entry.rel_path, chunks = chunks.len(), "file indexed");
    Ok(chunks.len())
}

/// Drop every row belonging to a file.
fn remove_file_rows(store: &Store, path: &str, source: &str) -> Result<()> {
    let conn = store.conn();
    let tx = conn.unchecked_transaction()?;
    if store.vector_available {
        tx.execute(
            "DELETE FROM chunks_vec WHERE id IN
             (SELECT id FROM chunks WHERE path = ?1 AND source = ?2)",
            params![path, source],
        )?;
    }
    if store.fts_available {
        tx.execute(
            "DELETE FROM chunks_fts WHERE path = ?1 AND source = ?2",
            params![path, source],
        )?;
    }
    tx.execute(
        "DELETE FROM chunks WHERE path = ?1 AND source = ?2",
        params![path, source],
    )?;
    tx.execute(
        "DELETE FROM files WHERE path = ?1 AND source = ?2",
        params![path, source],
    )?;
    tx.commit()?;
    tracing::debug!(path, source, "stale file removed from index");
    Ok(())
}

fn clear_index_rows(store: &Store) -> Result<()> {
    let conn = store.conn();
    if store.vector_available {
        conn.execute("DELETE FROM chunks_vec", [])?;
    }
    if store.fts_available {
        conn.execute("DELETE FROM chunks_fts", [])?;
    }
    conn.execute("DELETE FROM chunks", [])?;
    conn.execute("DELETE FROM files", [])?;
    Ok(())
}

// ── Source scanning ─────────────────────────────────────────────────────

/// Enumerate workspace memory documents plus configured extra paths.
/// Symlinks are rejected at every step.
pub fn scan_memory_files(workspace: &Path, extra_paths: &[String]) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();

    for name in ["MEMORY.md", "memory.md"] {
        let abs = workspace.join(name);
        if is_regular_file(&abs) {
            entries.push(build_memory_entry(workspace, &abs)?);
        }
    }

    let memory_dir = workspace.join("memory");
    if memory_dir.is_dir() && !is_symlink(&memory_dir) {
        let mut found = Vec::new();
        walk_markdown(&memory_dir, &mut found)?;
        for abs in found {
            entries.push(build_memory_entry(workspace, &abs)?);
        }
    }

    for raw in extra_paths {
        let abs = crate::config::expand_tilde(raw);
        if is_symlink(&abs) {
            tracing::warn!(path = %abs.display(), "extra path is a symlink; skipped");
            continue;
        }
        if abs.is_dir() {
            let mut found = Vec::new();
            walk_markdown(&abs, &mut found)?;
            for file in found {
                entries.push(build_memory_entry(workspace, &file)?);
            }
        } else if is_regular_file(&abs) && has_md_extension(&abs) {
            entries.push(build_memory_entry(workspace, &abs)?);
        }
    }

    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    entries.dedup_by(|a, b| a.rel_path == b.rel_path);
    Ok(entries)
}

/// Enumerate the agent's session transcripts, deriving their indexable text.
pub fn scan_session_files(sessions_dir: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    if !sessions_dir.is_dir() || is_symlink(sessions_dir) {
        return Ok(entries);
    }

    let mut names: Vec<PathBuf> = std::fs::read_dir(sessions_dir)
        .with_context(|| format!("failed to read sessions dir {}", sessions_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .filter(|p| !is_symlink(p))
        .collect();
    names.sort();

    for abs in names {
        let meta = std::fs::metadata(&abs)?;
        let raw = std::fs::read_to_string(&abs)
            .with_context(|| format!("failed to read transcript {}", abs.display()))?;
        let content = session::transcript_text(&raw);
        let file_name = abs
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        entries.push(FileEntry {
            rel_path: format!("sessions/{file_name}"),
            abs_path: abs,
            source: SOURCE_SESSIONS,
            mtime_ms: mtime_ms(&meta),
            size: meta.len() as i64,
            hash: hash_text(&content),
            content,
        });
    }
    Ok(entries)
}

fn build_memory_entry(workspace: &Path, abs: &Path) -> Result<FileEntry> {
    let meta = std::fs::metadata(abs)?;
    let content = std::fs::read_to_string(abs)
        .with_context(|| format!("failed to read {}", abs.display()))?;
    let rel_path = abs
        .strip_prefix(workspace)
        .unwrap_or(abs)
        .to_string_lossy()
        .replace('\\', "/");
    Ok(FileEntry {
        rel_path,
        abs_path: abs.to_path_buf(),
        source: SOURCE_MEMORY,
        mtime_ms: mtime_ms(&meta),
        size: meta.len() as i64,
        hash: hash_text(&content),
        content,
    })
}

/// Collect non-symlink `.md` files under a directory, recursively, skipping
/// hidden entries.
fn walk_markdown(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut children: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    children.sort();

    for child in children {
        let name = child
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.starts_with('.') || is_symlink(&child) {
            continue;
        }
        if child.is_dir() {
            walk_markdown(&child, out)?;
        } else if has_md_extension(&child) {
            out.push(child);
        }
    }
    Ok(())
}

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

fn is_regular_file(path: &Path) -> bool {
    !is_symlink(path) && path.is_file()
}

fn has_md_extension(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
}

fn mtime_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn sibling_path(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

use rusqlite::OptionalExtension;
