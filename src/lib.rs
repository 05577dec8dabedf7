//! Per-agent local semantic memory index.
//!
//! Mnemos gives an agent hybrid (dense-vector + BM25 keyword) search over
//! its workspace of Markdown memory notes and append-only chat transcripts.
//! Documents are chunked, embedded through a configurable provider, and
//! persisted in an embedded SQLite store with a vector virtual table and an
//! FTS5 index. The index tracks file changes — including incremental
//! processing of tail-appended transcripts — and rebuilds itself atomically
//! when the embedding configuration changes.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 for keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search
//! - **Embeddings**: local ONNX Runtime models, OpenAI-compatible or
//!   Gemini-compatible HTTP endpoints, with auto-selection and fallback
//! - **Search**: max-normalized weighted blend of vector similarity and
//!   BM25 keyword scores
//! - **Sync**: debounced file watching, transcript byte/message delta
//!   tracking, and crash-safe full reindexes via shadow-store swap
//!
//! # Modules
//!
//! - [`config`] — configuration loading from TOML files and environment
//! - [`chunk`] — Markdown chunking and content hashing
//! - [`db`] — store schema, open/initialize, atomic file-set renames
//! - [`embedding`] — providers, batching, retry, provider-side batch jobs
//! - [`index`] — sync engine, query engine, embedding cache, transcripts
//! - [`manager`] — the per-agent facade and process-wide registry
//! - [`watch`] — background triggers feeding the manager
//!
//! Callers interact through [`manager::MemoryManager`]; there is no CLI.

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod index;
pub mod manager;
pub mod watch;

pub use config::MnemosConfig;
pub use error::MemoryError;
pub use index::search::SearchHit;
pub use index::sync::{SyncOptions, SyncReason, SyncReport};
pub use manager::{AgentContext, IndexStatus, MemoryManager, ReadFileRequest, SearchOptions};
