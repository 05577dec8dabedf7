//! Index store: a single SQLite database per manager holding files, chunks,
//! the fingerprint meta row, the embedding cache, and the FTS5/vec0 virtual
//! tables. The vector extension loads once per process through a cached,
//! time-bounded future; per-store availability of FTS and vector search is
//! probed at open and exposed as flags so search can degrade instead of
//! failing.

pub mod schema;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sqlite_vec::sqlite3_vec_init;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::error::MemoryError;

static SQLITE_VEC_INIT: Once = Once::new();

/// Raw sqlite-vec registration. Safe to call multiple times; async callers
/// go through [`ensure_vector_extension`], which bounds and caches the load.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

static VECTOR_EXTENSION: OnceCell<std::result::Result<(), String>> = OnceCell::const_new();

/// The extension must finish loading within this bound or vector search is
/// written off for the process.
const VECTOR_EXTENSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Load the vector extension before any vec0 table is created.
///
/// The load runs once per process on the blocking pool; every caller shares
/// the cached outcome, and a hung or slow registration is cut off after
/// [`VECTOR_EXTENSION_TIMEOUT`]. A failure here is not fatal — stores opened
/// afterwards simply stay keyword-only.
pub async fn ensure_vector_extension() -> std::result::Result<(), MemoryError> {
    let outcome = VECTOR_EXTENSION
        .get_or_init(|| async {
            let load = tokio::task::spawn_blocking(|| {
                load_sqlite_vec();
                // Registration itself cannot fail; prove the extension
                // actually resolves before anyone relies on it.
                let conn = Connection::open_in_memory().map_err(|e| e.to_string())?;
                conn.query_row("SELECT vec_version()", [], |r| r.get::<_, String>(0))
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            });
            match tokio::time::timeout(VECTOR_EXTENSION_TIMEOUT, load).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(format!("extension load task failed: {join_err}")),
                Err(_) => Err(format!(
                    "load timed out after {}s",
                    VECTOR_EXTENSION_TIMEOUT.as_secs()
                )),
            }
        })
        .await;
    outcome
        .clone()
        .map_err(|details| MemoryError::VectorExtension { details })
}

/// Persisted description of the provider/model/chunking parameters that
/// produced the current index. Any mismatch forces a full reindex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMeta {
    pub model: String,
    pub provider: String,
    pub provider_key: String,
    pub chunk_tokens: usize,
    pub chunk_overlap: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_dims: Option<usize>,
}

/// An open index store with its availability flags.
pub struct Store {
    conn: Connection,
    path: PathBuf,
    pub fts_available: bool,
    pub vector_available: bool,
    pub vector_dims: Option<usize>,
    vector_enabled: bool,
}

impl Store {
    /// Open (or create) the store at `path` with schema initialized.
    ///
    /// Vector search additionally requires [`ensure_vector_extension`] to
    /// have succeeded beforehand; without it the vec0 table cannot be
    /// created and the store opens keyword-only.
    pub fn open(path: impl AsRef<Path>, vector_enabled: bool) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open index store at {}", path.display()))?;

        // WAL for concurrent reads during sync; tolerate short lock waits.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", "5000")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self::init(conn, path.to_path_buf(), vector_enabled)?;

        let integrity: String = store
            .conn
            .pragma_query_value(None, "quick_check", |row| row.get(0))?;
        if integrity != "ok" {
            anyhow::bail!(
                "index store integrity check failed at {}: {integrity}. \
                 Delete the store file to rebuild from source documents.",
                path.display()
            );
        }

        tracing::debug!(path = %path.display(), fts = store.fts_available, "index store opened");
        Ok(store)
    }

    /// Open an in-memory store (tests and the swap placeholder).
    pub fn open_in_memory(vector_enabled: bool) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init(conn, PathBuf::new(), vector_enabled)
    }

    fn init(conn: Connection, path: PathBuf, vector_enabled: bool) -> Result<Self> {
        schema::init_base(&conn).context("failed to initialize schema")?;
        let fts_available = schema::init_fts(&conn);
        if !fts_available {
            tracing::warn!("FTS5 unavailable; keyword search disabled for this store");
        }

        let mut store = Store {
            conn,
            path,
            fts_available,
            vector_available: false,
            vector_dims: None,
            vector_enabled,
        };

        // Recreate the vector table eagerly when the fingerprint already
        // knows its dimensionality.
        if vector_enabled {
            if let Some(meta) = store.read_meta()? {
                if let Some(dims) = meta.vector_dims {
                    store.ensure_vector_table(dims);
                }
            }
        }

        Ok(store)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn vector_enabled(&self) -> bool {
        self.vector_enabled
    }

    /// Make sure the vec0 table exists with exactly `dims` dimensions,
    /// rebuilding it when the dimensionality changed. Returns the resulting
    /// availability; failure to create flips the store into keyword-only
    /// mode rather than erroring.
    pub fn ensure_vector_table(&mut self, dims: usize) -> bool {
        if !self.vector_enabled || dims == 0 {
            self.vector_available = false;
            return false;
        }
        if self.vector_available && self.vector_dims == Some(dims) {
            return true;
        }
        if self.vector_dims.is_some() && self.vector_dims != Some(dims) {
            if let Err(err) = schema::drop_vec(&self.conn) {
                tracing::warn!(%err, "failed to drop vector table for rebuild");
                self.vector_available = false;
                return false;
            }
        }
        self.vector_available = schema::init_vec(&self.conn, dims);
        self.vector_dims = self.vector_available.then_some(dims);
        if !self.vector_available {
            tracing::warn!(dims, "vector table unavailable; vector search disabled");
        }
        self.vector_available
    }

    /// Read the stored index fingerprint, if any.
    pub fn read_meta(&self) -> Result<Option<IndexMeta>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                rusqlite::params![schema::META_KEY],
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }

    /// Write the index fingerprint.
    pub fn write_meta(&self, meta: &IndexMeta) -> Result<()> {
        let json = serde_json::to_string(meta)?;
        self.conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![schema::META_KEY, json],
        )?;
        Ok(())
    }
}

/// Rename the store file set (`base`, `base-wal`, `base-shm`) from one base
/// path to another, ignoring members that do not exist.
pub fn rename_store_files(from: &Path, to: &Path) -> std::io::Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let src = sibling(from, suffix);
        let dst = sibling(to, suffix);
        match std::fs::rename(&src, &dst) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Delete the store file set, ignoring missing members.
pub fn remove_store_files(base: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(sibling(base, suffix));
    }
}

fn sibling(base: &Path, suffix: &str) -> PathBuf {
    if suffix.is_empty() {
        base.to_path_buf()
    } else {
        let mut name = base.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }
}
