//! Per-agent manager facade.
//!
//! A [`MemoryManager`] owns one index store, one embedding provider, the
//! batch orchestrator, and all dirty/delta state for a single agent's
//! workspace. Instances live in a process-wide registry keyed by agent,
//! workspace, and a settings fingerprint; [`MemoryManager::get_or_create`]
//! returns the existing instance for that key, and [`close`] removes it.
//!
//! Syncs are serialised per manager: concurrent callers share the in-flight
//! run's outcome instead of queuing another. Background triggers (watchers,
//! interval) route through the same entry point and swallow failures with a
//! warning.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::MnemosConfig;
use crate::db::Store;
use crate::embedding::batch::BatchManager;
use crate::embedding::{create_provider, Provider};
use crate::error::MemoryError;
use crate::index::search::{
    candidate_limit, keyword_search, merge_hybrid, vector_search, SearchHit,
};
use crate::index::session::DeltaTracker;
use crate::index::sync::{
    needs_full_reindex, run_full, run_incremental, EngineContext, SyncOptions, SyncReason,
    SyncReport, SyncScope,
};
use crate::index::{SOURCE_MEMORY, SOURCE_SESSIONS};
use crate::watch::WatchHandles;

/// Identity of the agent a manager serves.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub agent_id: String,
    pub workspace_dir: PathBuf,
    pub sessions_dir: PathBuf,
}

/// Options for [`MemoryManager::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub max_results: Option<usize>,
    pub min_score: Option<f32>,
    /// Warm the index once per unique session key before searching.
    pub session_key: Option<String>,
}

/// Request for [`MemoryManager::read_file`]. Line numbers are 1-based.
#[derive(Debug, Clone)]
pub struct ReadFileRequest {
    pub rel_path: String,
    pub from: Option<usize>,
    pub lines: Option<usize>,
}

/// Where the active provider came from, when a fallback was applied.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackInfo {
    pub from: String,
    pub reason: String,
}

/// Snapshot returned by [`MemoryManager::status`].
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub agent_id: String,
    pub db_path: String,
    pub provider: String,
    pub model: String,
    pub files: usize,
    pub chunks: usize,
    pub embedded_chunks: usize,
    pub cache_entries: usize,
    pub fts_available: bool,
    pub vector_available: bool,
    pub vector_dims: Option<usize>,
    pub dirty_memory: bool,
    pub dirty_sessions: usize,
    pub batch_disabled: bool,
    pub fallback: Option<FallbackInfo>,
}

struct ProviderState {
    provider: Provider,
    provider_key: String,
    fallback: Option<FallbackInfo>,
    fallback_applied: bool,
}

#[derive(Default)]
struct DirtyState {
    memory: bool,
    sessions: HashSet<PathBuf>,
}

type SyncSlot = Option<Result<SyncReport, Arc<anyhow::Error>>>;

struct Inner {
    agent: AgentContext,
    cfg: MnemosConfig,
    registry_key: String,
    store: Mutex<Store>,
    provider: RwLock<ProviderState>,
    batch: BatchManager,
    dirty: StdMutex<DirtyState>,
    delta: StdMutex<DeltaTracker>,
    warm_sessions: StdMutex<HashSet<String>>,
    sync_rx: StdMutex<Option<watch::Receiver<SyncSlot>>>,
    watch_handles: StdMutex<Option<WatchHandles>>,
}

static REGISTRY: OnceLock<StdMutex<HashMap<String, MemoryManager>>> = OnceLock::new();

fn registry() -> &'static StdMutex<HashMap<String, MemoryManager>> {
    REGISTRY.get_or_init(|| StdMutex::new(HashMap::new()))
}

/// Facade over one agent's memory index.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<Inner>,
}

impl MemoryManager {
    /// Fetch or create the manager for this agent/workspace/settings triple.
    /// Creating also starts the configured watchers and timers.
    pub async fn get_or_create(agent: AgentContext, cfg: MnemosConfig) -> Result<MemoryManager> {
        let key = registry_key(&agent, &cfg);
        if let Some(existing) = registry().lock().unwrap().get(&key) {
            return Ok(existing.clone());
        }

        let init = create_provider(&cfg.provider)?;
        let fallback = match (&init.fallback_from, &init.fallback_reason) {
            (Some(from), Some(reason)) => Some(FallbackInfo {
                from: from.clone(),
                reason: reason.clone(),
            }),
            _ => None,
        };
        let fallback_applied = fallback.is_some();
        let manager =
            Self::build(agent, cfg, init.provider, fallback, fallback_applied).await?;

        let handles = crate::watch::start(&manager);
        *manager.inner.watch_handles.lock().unwrap() = Some(handles);

        let mut reg = registry().lock().unwrap();
        if let Some(existing) = reg.get(&key) {
            // Lost a creation race: stop the fresh instance's background
            // work and hand back the registered one.
            if let Some(mut handles) = manager.inner.watch_handles.lock().unwrap().take() {
                handles.stop();
            }
            return Ok(existing.clone());
        }
        reg.insert(key, manager.clone());
        Ok(manager)
    }

    /// Construct a manager around an explicit provider, without registering
    /// it or starting watchers. Used by tests and embedders that manage
    /// lifecycle themselves.
    pub async fn with_provider(
        agent: AgentContext,
        cfg: MnemosConfig,
        provider: Provider,
    ) -> Result<MemoryManager> {
        Self::build(agent, cfg, provider, None, false).await
    }

    async fn build(
        agent: AgentContext,
        cfg: MnemosConfig,
        provider: Provider,
        fallback: Option<FallbackInfo>,
        fallback_applied: bool,
    ) -> Result<MemoryManager> {
        // The vector extension must load before any vec0 table is created;
        // the load is cached process-wide and bounded by a timeout. Failure
        // degrades this store to keyword-only rather than erroring.
        if cfg.storage.vector_enabled {
            if let Err(err) = crate::db::ensure_vector_extension().await {
                warn!(
                    agent = %agent.agent_id,
                    error = %err,
                    "vector extension unavailable; search degrades to keyword-only"
                );
            }
        }

        let db_path = cfg.resolved_db_path(&agent.workspace_dir);
        let store = Store::open(&db_path, cfg.storage.vector_enabled)
            .with_context(|| format!("failed to open index for agent {}", agent.agent_id))?;

        let provider_key = provider.provider_key();
        let registry_key = registry_key(&agent, &cfg);
        let delta = DeltaTracker::new(
            cfg.sync.session_delta_bytes,
            cfg.sync.session_delta_messages,
        );

        info!(
            agent = %agent.agent_id,
            provider = provider.id(),
            model = provider.model(),
            db = %db_path.display(),
            "memory index manager ready"
        );

        Ok(MemoryManager {
            inner: Arc::new(Inner {
                agent,
                batch: BatchManager::new(cfg.batch.clone()),
                cfg,
                registry_key,
                store: Mutex::new(store),
                provider: RwLock::new(ProviderState {
                    provider,
                    provider_key,
                    fallback,
                    fallback_applied,
                }),
                dirty: StdMutex::new(DirtyState::default()),
                delta: StdMutex::new(delta),
                warm_sessions: StdMutex::new(HashSet::new()),
                sync_rx: StdMutex::new(None),
                watch_handles: StdMutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &MnemosConfig {
        &self.inner.cfg
    }

    pub fn workspace(&self) -> &Path {
        &self.inner.agent.workspace_dir
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.inner.agent.sessions_dir
    }

    // ── Dirty tracking ──────────────────────────────────────────────────

    pub fn mark_memory_dirty(&self) {
        self.inner.dirty.lock().unwrap().memory = true;
    }

    pub fn mark_session_dirty(&self, path: &Path) {
        self.inner
            .dirty
            .lock()
            .unwrap()
            .sessions
            .insert(path.to_path_buf());
    }

    pub fn is_dirty(&self) -> bool {
        let dirty = self.inner.dirty.lock().unwrap();
        dirty.memory || !dirty.sessions.is_empty()
    }

    /// Feed an observed transcript size through the delta tracker; marks the
    /// file dirty and returns true when a threshold was crossed.
    pub fn note_session_growth(&self, path: &Path) -> bool {
        let Ok(meta) = std::fs::metadata(path) else {
            return false;
        };
        let size = meta.len();
        let crossed = {
            let mut delta = self.inner.delta.lock().unwrap();
            delta.record(path, size, |from, to| {
                crate::watch::count_newlines_in_range(path, from, to)
            })
        };
        if crossed {
            self.mark_session_dirty(path);
        }
        crossed
    }

    // ── Sync ────────────────────────────────────────────────────────────

    /// Synchronise the index. At most one sync runs per manager; concurrent
    /// callers await the in-flight run and observe its outcome.
    pub async fn sync(&self, opts: SyncOptions) -> Result<SyncReport> {
        loop {
            // Join an in-flight run when there is one.
            let joined = {
                let slot = self.inner.sync_rx.lock().unwrap();
                slot.clone()
            };
            if let Some(mut rx) = joined {
                if let Some(outcome) = rx.borrow().clone() {
                    return flatten_shared(outcome);
                }
                match rx.changed().await {
                    Ok(()) => {
                        if let Some(outcome) = rx.borrow().clone() {
                            return flatten_shared(outcome);
                        }
                    }
                    Err(_) => {}
                }
                continue;
            }

            // Become the runner, unless someone beat us to it.
            let tx = {
                let mut slot = self.inner.sync_rx.lock().unwrap();
                if slot.is_some() {
                    continue;
                }
                let (tx, rx) = watch::channel(None);
                *slot = Some(rx);
                tx
            };

            let result = self.run_sync_with_fallback(opts).await;
            let shared: Result<SyncReport, Arc<anyhow::Error>> = match result {
                Ok(report) => Ok(report),
                Err(err) => Err(Arc::new(err)),
            };
            *self.inner.sync_rx.lock().unwrap() = None;
            let _ = tx.send(Some(shared.clone()));
            return flatten_shared(shared);
        }
    }

    /// Fire-and-forget sync used by background triggers: logs and swallows.
    pub async fn sync_and_log(&self, opts: SyncOptions) {
        if let Err(err) = self.sync(opts).await {
            warn!(
                reason = opts.reason.as_str(),
                error = %format!("{err:#}"),
                "background sync failed"
            );
        }
    }

    fn spawn_sync(&self, opts: SyncOptions) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.sync_and_log(opts).await;
        });
    }

    async fn run_sync_with_fallback(&self, opts: SyncOptions) -> Result<SyncReport> {
        let mut reason = opts.reason;
        let mut force = opts.force;
        loop {
            match self.run_sync_once(reason, force).await {
                Ok(report) => return Ok(report),
                Err(err) => {
                    if self.try_provider_fallback(&err).await {
                        reason = SyncReason::Fallback;
                        force = true;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn run_sync_once(&self, reason: SyncReason, force: bool) -> Result<SyncReport> {
        let snapshot = {
            let mut dirty = self.inner.dirty.lock().unwrap();
            DirtyState {
                memory: std::mem::take(&mut dirty.memory),
                sessions: std::mem::take(&mut dirty.sessions),
            }
        };

        let scope = match reason {
            SyncReason::Watch => SyncScope {
                memory: true,
                sessions: !snapshot.sessions.is_empty(),
            },
            SyncReason::SessionDelta => SyncScope {
                memory: snapshot.memory,
                sessions: true,
            },
            SyncReason::Search => SyncScope {
                memory: snapshot.memory,
                sessions: !snapshot.sessions.is_empty(),
            },
            _ => SyncScope {
                memory: true,
                sessions: true,
            },
        };

        let (provider, provider_key) = {
            let state = self.inner.provider.read().await;
            (state.provider.clone(), state.provider_key.clone())
        };

        let result = async {
            let mut store = self.inner.store.lock().await;
            let ctx = EngineContext {
                cfg: &self.inner.cfg,
                provider: &provider,
                provider_key: &provider_key,
                batch: &self.inner.batch,
                workspace: &self.inner.agent.workspace_dir,
                sessions_dir: &self.inner.agent.sessions_dir,
            };
            let full = force || needs_full_reindex(&store, &ctx)?;
            if full {
                run_full(&mut store, &ctx, reason).await
            } else {
                run_incremental(&mut store, &ctx, scope, reason).await
            }
        }
        .await;

        match result {
            Ok(report) => {
                info!(
                    reason = report.reason,
                    full = report.full,
                    indexed = report.indexed_files,
                    deleted = report.deleted_files,
                    "sync complete"
                );
                Ok(report)
            }
            Err(err) => {
                // Changes observed before the failure are still pending.
                let mut dirty = self.inner.dirty.lock().unwrap();
                dirty.memory |= snapshot.memory;
                dirty.sessions.extend(snapshot.sessions);
                Err(err)
            }
        }
    }

    /// Switch to the configured fallback provider when a sync failed on an
    /// embedding-class error. Applies at most once per manager.
    async fn try_provider_fallback(&self, err: &anyhow::Error) -> bool {
        let message = format!("{err:#}").to_lowercase();
        if !(message.contains("embedding") || message.contains("batch")) {
            return false;
        }
        let Some(name) = self.inner.cfg.provider.fallback.clone() else {
            return false;
        };

        let mut state = self.inner.provider.write().await;
        if state.fallback_applied || name == state.provider.id() {
            return false;
        }
        let replacement = match crate::embedding::build_variant(&name, &self.inner.cfg.provider) {
            Ok(p) => p,
            Err(build_err) => {
                warn!(
                    fallback = %name,
                    error = %format!("{build_err:#}"),
                    "fallback provider could not be constructed"
                );
                return false;
            }
        };

        let reason = err.root_cause().to_string();
        warn!(
            from = state.provider.id(),
            to = %name,
            %reason,
            "switching embedding provider after sync failure"
        );
        state.fallback = Some(FallbackInfo {
            from: state.provider.id().to_string(),
            reason,
        });
        state.provider_key = replacement.provider_key();
        state.provider = replacement;
        state.fallback_applied = true;
        true
    }

    // ── Search ──────────────────────────────────────────────────────────

    pub async fn search(&self, query: &str, opts: SearchOptions) -> Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(key) = opts.session_key.as_deref() {
            self.warm_session(Some(key));
        }
        if self.inner.cfg.sync.on_search && self.is_dirty() {
            self.spawn_sync(SyncOptions {
                reason: SyncReason::Search,
                force: false,
            });
        }

        let cfg = &self.inner.cfg.query;
        let max_results = opts.max_results.unwrap_or(cfg.max_results).max(1);
        let min_score = opts.min_score.unwrap_or(cfg.min_score);
        let candidates = candidate_limit(max_results, cfg.candidate_multiplier);

        let mut sources: Vec<&str> = Vec::new();
        if self.inner.cfg.sources.memory {
            sources.push(SOURCE_MEMORY);
        }
        if self.inner.cfg.sources.sessions {
            sources.push(SOURCE_SESSIONS);
        }

        let (provider, model) = {
            let state = self.inner.provider.read().await;
            (state.provider.clone(), state.provider.model().to_string())
        };

        // Keyword search runs concurrently with embedding the query.
        let keyword_fut = async {
            if cfg.hybrid {
                let store = self.inner.store.lock().await;
                keyword_search(&store, query, &sources, &model, candidates)
            } else {
                Ok(Vec::new())
            }
        };
        let embed_fut = self.inner.batch.embed_query(&provider, query);
        let (keyword_result, embed_result) = tokio::join!(keyword_fut, embed_fut);
        let keyword_hits = keyword_result?;

        let query_vec = match embed_result {
            Ok(v) => v,
            Err(err) => {
                // Keyword-only degraded mode when the hybrid path can still
                // answer; otherwise the failure is the caller's problem.
                if cfg.hybrid && !keyword_hits.is_empty() {
                    warn!(error = %format!("{err:#}"), "query embedding failed; keyword-only results");
                    Vec::new()
                } else {
                    return Err(err);
                }
            }
        };

        let vector_hits = if query_vec.iter().any(|v| *v != 0.0) {
            let store = self.inner.store.lock().await;
            vector_search(&store, &query_vec, &sources, &model, candidates)?
        } else {
            Vec::new()
        };

        let mut hits = if cfg.hybrid {
            merge_hybrid(vector_hits, keyword_hits, cfg.vector_weight, cfg.text_weight)
        } else {
            let mut v = vector_hits;
            v.sort_by(|a, b| b.score.total_cmp(&a.score));
            v
        };

        hits.retain(|h| h.score >= min_score);
        hits.truncate(max_results);
        Ok(hits)
    }

    /// Warm the index once per unique session key (fire-and-forget).
    pub fn warm_session(&self, session_key: Option<&str>) {
        if !self.inner.cfg.sync.on_session_start {
            return;
        }
        let key = session_key.unwrap_or("default").to_string();
        {
            let mut warmed = self.inner.warm_sessions.lock().unwrap();
            if !warmed.insert(key) {
                return;
            }
        }
        self.spawn_sync(SyncOptions {
            reason: SyncReason::SessionStart,
            force: false,
        });
    }

    // ── File access ─────────────────────────────────────────────────────

    /// Read a Markdown file confined to the workspace or a configured extra
    /// path. Rejects traversal, symlinks, and non-`.md` targets; optionally
    /// returns a 1-based line slice.
    pub async fn read_file(&self, req: ReadFileRequest) -> Result<String> {
        let rel = Path::new(&req.rel_path);

        if rel
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(denied("path traversal is not allowed"));
        }
        if !rel
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
        {
            return Err(denied("only .md files can be read"));
        }

        let candidate = if rel.is_absolute() {
            rel.to_path_buf()
        } else {
            self.inner.agent.workspace_dir.join(rel)
        };

        let meta = std::fs::symlink_metadata(&candidate)
            .map_err(|_| denied("file not found"))?;
        if meta.file_type().is_symlink() {
            return Err(denied("symlinks are not allowed"));
        }
        if !meta.is_file() {
            return Err(denied("not a regular file"));
        }

        let canonical = candidate
            .canonicalize()
            .map_err(|_| denied("file not found"))?;
        let in_workspace = self
            .inner
            .agent
            .workspace_dir
            .canonicalize()
            .map(|ws| canonical.starts_with(&ws))
            .unwrap_or(false);
        let in_extra = self.inner.cfg.sources.extra_paths.iter().any(|raw| {
            let extra = crate::config::expand_tilde(raw);
            match extra.canonicalize() {
                Ok(extra) => canonical == extra || canonical.starts_with(&extra),
                Err(_) => false,
            }
        });
        if !in_workspace && !in_extra {
            return Err(denied("path is outside the allowed roots"));
        }

        let content = std::fs::read_to_string(&candidate)
            .with_context(|| format!("failed to read {}", candidate.display()))?;

        match (req.from, req.lines) {
            (None, None) => Ok(content),
            (from, lines) => {
                let all: Vec<&str> = content.lines().collect();
                let start = from.unwrap_or(1).saturating_sub(1).min(all.len());
                let count = lines.unwrap_or(all.len() - start);
                let end = (start + count).min(all.len());
                Ok(all[start..end].join("\n"))
            }
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub async fn status(&self) -> Result<IndexStatus> {
        let (provider_id, model, fallback) = {
            let state = self.inner.provider.read().await;
            (
                state.provider.id().to_string(),
                state.provider.model().to_string(),
                state.fallback.clone(),
            )
        };
        let store = self.inner.store.lock().await;
        let conn = store.conn();
        let files: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?;
        let chunks: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
        let embedded: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE embedding != '[]' AND embedding != ''",
            [],
            |r| r.get(0),
        )?;
        let cache_entries: i64 =
            conn.query_row("SELECT COUNT(*) FROM embedding_cache", [], |r| r.get(0))?;

        let dirty = self.inner.dirty.lock().unwrap();
        Ok(IndexStatus {
            agent_id: self.inner.agent.agent_id.clone(),
            db_path: store.path().display().to_string(),
            provider: provider_id,
            model,
            files: files as usize,
            chunks: chunks as usize,
            embedded_chunks: embedded as usize,
            cache_entries: cache_entries as usize,
            fts_available: store.fts_available,
            vector_available: store.vector_available,
            vector_dims: store.vector_dims,
            dirty_memory: dirty.memory,
            dirty_sessions: dirty.sessions.len(),
            batch_disabled: self.inner.batch.batch_disabled().await,
            fallback,
        })
    }

    /// Whether vector storage can be used for this store.
    pub async fn probe_vector_availability(&self) -> bool {
        {
            let store = self.inner.store.lock().await;
            if store.vector_available {
                return true;
            }
            if !store.vector_enabled() {
                return false;
            }
        }
        crate::db::ensure_vector_extension().await.is_ok()
    }

    /// Whether the active provider can embed right now (per-request path).
    pub async fn probe_embedding_availability(&self) -> bool {
        let provider = {
            let state = self.inner.provider.read().await;
            state.provider.clone()
        };
        self.inner
            .batch
            .embed_query(&provider, "availability probe")
            .await
            .is_ok()
    }

    /// Stop background work and drop this manager from the registry.
    pub async fn close(&self) {
        if let Some(mut handles) = self.inner.watch_handles.lock().unwrap().take() {
            handles.stop();
        }
        registry().lock().unwrap().remove(&self.inner.registry_key);
        info!(agent = %self.inner.agent.agent_id, "memory index manager closed");
    }
}

fn registry_key(agent: &AgentContext, cfg: &MnemosConfig) -> String {
    format!(
        "{}\u{1}{}\u{1}{}",
        agent.agent_id,
        agent.workspace_dir.display(),
        cfg.settings_fingerprint()
    )
}

fn denied(reason: &str) -> anyhow::Error {
    MemoryError::PathDenied {
        reason: reason.to_string(),
    }
    .into()
}

fn flatten_shared(outcome: Result<SyncReport, Arc<anyhow::Error>>) -> Result<SyncReport> {
    outcome.map_err(|err| anyhow::anyhow!("{err:#}"))
}
