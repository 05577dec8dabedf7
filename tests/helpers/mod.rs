#![allow(dead_code)]

use std::path::{Path, PathBuf};

use mnemos::embedding::{Provider, StubProvider};
use mnemos::{AgentContext, MemoryManager, MnemosConfig};
use tempfile::TempDir;

/// Embedding dimensionality used by the stub provider in tests.
pub const STUB_DIMS: usize = 64;

/// A throwaway agent: temp workspace + sessions dir + a manager wired to the
/// deterministic stub provider. Background triggers are off so tests control
/// every sync.
pub struct TestAgent {
    pub dir: TempDir,
    pub workspace: PathBuf,
    pub sessions: PathBuf,
    pub manager: MemoryManager,
}

/// Config tuned for deterministic tests: no watchers, no background syncs.
pub fn test_config() -> MnemosConfig {
    let mut cfg = MnemosConfig::default();
    cfg.sync.watch = false;
    cfg.sync.on_search = false;
    cfg.sync.on_session_start = false;
    cfg.batch.enabled = false;
    cfg
}

pub async fn spawn_agent() -> TestAgent {
    spawn_agent_with(test_config()).await
}

pub async fn spawn_agent_with(cfg: MnemosConfig) -> TestAgent {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let workspace = dir.path().join("workspace");
    let sessions = dir.path().join("sessions");
    std::fs::create_dir_all(&workspace).unwrap();
    std::fs::create_dir_all(&sessions).unwrap();

    let agent = AgentContext {
        agent_id: "test-agent".into(),
        workspace_dir: workspace.clone(),
        sessions_dir: sessions.clone(),
    };
    let manager = MemoryManager::with_provider(
        agent,
        cfg,
        Provider::Stub(StubProvider::new(STUB_DIMS)),
    )
    .await
    .unwrap();

    TestAgent {
        dir,
        workspace,
        sessions,
        manager,
    }
}

/// Write a file, creating parent directories as needed.
pub fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// A transcript line in the format the gateway writes.
pub fn transcript_line(role: &str, text: &str) -> String {
    format!(
        r#"{{"type":"message","message":{{"role":"{role}","content":"{text}"}}}}"#
    ) + "\n"
}

/// Open the agent's index store read-only for assertions, without going
/// through the manager.
pub fn open_store(agent: &TestAgent) -> mnemos::db::Store {
    mnemos::db::load_sqlite_vec();
    let db_path = agent
        .manager
        .config()
        .resolved_db_path(&agent.workspace);
    mnemos::db::Store::open(db_path, true).unwrap()
}

pub fn count(store: &mnemos::db::Store, sql: &str) -> i64 {
    store.conn().query_row(sql, [], |r| r.get(0)).unwrap()
}

pub fn strings(store: &mnemos::db::Store, sql: &str) -> Vec<String> {
    let mut stmt = store.conn().prepare(sql).unwrap();
    let rows = stmt.query_map([], |r| r.get::<_, String>(0)).unwrap();
    rows.collect::<Result<Vec<_>, _>>().unwrap()
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}
