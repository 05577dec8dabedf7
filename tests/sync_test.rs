//! Sync engine behaviour: incremental indexing, idempotence, stale cleanup,
//! fingerprint-forced reindexing, and the atomic rebuild.

mod helpers;

use helpers::{count, open_store, spawn_agent, spawn_agent_with, strings, test_config, write_file};
use mnemos::{SyncOptions, SyncReason};

fn manual() -> SyncOptions {
    SyncOptions {
        reason: SyncReason::Manual,
        force: false,
    }
}

fn forced() -> SyncOptions {
    SyncOptions {
        reason: SyncReason::Manual,
        force: true,
    }
}

#[tokio::test]
async fn initial_sync_indexes_memory_file() {
    let agent = spawn_agent().await;
    write_file(
        &agent.workspace.join("MEMORY.md"),
        "# Notes\n\nFirst paragraph about project layout.\n\nSecond paragraph about testing.\n\nThird paragraph about deployment.\n",
    );

    let report = agent.manager.sync(manual()).await.unwrap();
    assert!(report.full, "first sync has no fingerprint and must be full");
    assert!(report.indexed_files >= 1);

    let status = agent.manager.status().await.unwrap();
    assert_eq!(status.files, 1);
    assert!(status.chunks >= 1);
    assert_eq!(status.chunks, status.embedded_chunks);
    assert!(status.fts_available);
    assert!(status.vector_available);
    assert_eq!(status.vector_dims, Some(helpers::STUB_DIMS));
}

#[tokio::test]
async fn chunk_ranges_cover_the_file() {
    let mut cfg = test_config();
    cfg.chunking.tokens = 64;
    cfg.chunking.overlap = 0;
    let agent = spawn_agent_with(cfg).await;

    let body: String = (1..=12)
        .map(|i| format!("line number {i} with some filler text\n"))
        .collect();
    write_file(&agent.workspace.join("MEMORY.md"), &body);
    agent.manager.sync(manual()).await.unwrap();

    let store = open_store(&agent);
    let ranges: Vec<(i64, i64)> = {
        let mut stmt = store
            .conn()
            .prepare("SELECT start_line, end_line FROM chunks ORDER BY start_line")
            .unwrap();
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    };
    assert!(ranges.len() > 1, "12 lines at 64-char windows must split");
    assert_eq!(ranges[0].0, 1);
    assert_eq!(ranges.last().unwrap().1, 13); // trailing newline -> empty line 13
    for pair in ranges.windows(2) {
        assert!(pair[1].0 > pair[0].0);
        assert!(pair[0].1 <= pair[1].1);
    }
}

#[tokio::test]
async fn sync_is_idempotent_and_skips_unchanged() {
    let agent = spawn_agent().await;
    write_file(&agent.workspace.join("MEMORY.md"), "# stable content\n\nbody text\n");

    agent.manager.sync(manual()).await.unwrap();
    let store = open_store(&agent);
    let ids_before = strings(&store, "SELECT id FROM chunks ORDER BY id");
    drop(store);

    let second = agent.manager.sync(manual()).await.unwrap();
    assert!(!second.full);
    assert_eq!(second.indexed_files, 0, "unchanged files must be skipped");

    let store = open_store(&agent);
    let ids_after = strings(&store, "SELECT id FROM chunks ORDER BY id");
    assert_eq!(ids_before, ids_after, "chunk ids must be bit-identical");
}

#[tokio::test]
async fn append_updates_file_row_and_keeps_early_chunk_ids() {
    let mut cfg = test_config();
    cfg.chunking.tokens = 64;
    cfg.chunking.overlap = 0;
    let agent = spawn_agent_with(cfg).await;

    let original: String = (1..=10)
        .map(|i| format!("paragraph {i} some steady content here\n"))
        .collect();
    write_file(&agent.workspace.join("MEMORY.md"), &original);
    agent.manager.sync(manual()).await.unwrap();

    let store = open_store(&agent);
    let ids_before = strings(&store, "SELECT id FROM chunks ORDER BY start_line");
    let hash_before = strings(&store, "SELECT hash FROM files")[0].clone();
    drop(store);

    let appended = format!("{original}a new trailing paragraph appended later\n");
    write_file(&agent.workspace.join("MEMORY.md"), &appended);
    let report = agent.manager.sync(manual()).await.unwrap();
    assert!(!report.full);
    assert_eq!(report.indexed_files, 1);

    let store = open_store(&agent);
    let ids_after = strings(&store, "SELECT id FROM chunks ORDER BY start_line");
    let hash_after = strings(&store, "SELECT hash FROM files")[0].clone();

    assert_ne!(hash_before, hash_after);
    assert!(ids_after.len() >= ids_before.len());
    // Early windows are untouched by a tail append, so their ids survive.
    assert_eq!(ids_before[0], ids_after[0]);
    let before: std::collections::HashSet<_> = ids_before.iter().collect();
    let surviving = ids_after.iter().filter(|id| before.contains(id)).count();
    assert!(surviving >= ids_before.len() - 1);
}

#[tokio::test]
async fn deleted_files_are_fully_removed() {
    let agent = spawn_agent().await;
    write_file(&agent.workspace.join("MEMORY.md"), "# keep me\n");
    write_file(&agent.workspace.join("memory/extra.md"), "# delete me soon\n");
    agent.manager.sync(manual()).await.unwrap();

    let store = open_store(&agent);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM files"), 2);
    drop(store);

    std::fs::remove_file(agent.workspace.join("memory/extra.md")).unwrap();
    let report = agent.manager.sync(manual()).await.unwrap();
    assert_eq!(report.deleted_files, 1);

    let store = open_store(&agent);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM files"), 1);
    assert_eq!(
        count(&store, "SELECT COUNT(*) FROM chunks WHERE path = 'memory/extra.md'"),
        0
    );
    assert_eq!(
        count(&store, "SELECT COUNT(*) FROM chunks_fts WHERE path = 'memory/extra.md'"),
        0
    );
    // Every chunk row still has its vector twin.
    assert_eq!(
        count(&store, "SELECT COUNT(*) FROM chunks"),
        count(&store, "SELECT COUNT(*) FROM chunks_vec"),
    );
}

#[tokio::test]
async fn meta_fingerprint_matches_producer() {
    let agent = spawn_agent().await;
    write_file(&agent.workspace.join("MEMORY.md"), "# fingerprint test\n");
    agent.manager.sync(manual()).await.unwrap();

    let store = open_store(&agent);
    let meta = store.read_meta().unwrap().expect("meta must exist after sync");
    assert_eq!(meta.provider, "stub");
    assert_eq!(meta.model, "stub-embed");
    assert_eq!(meta.chunk_tokens, agent.manager.config().chunking.tokens);
    assert_eq!(meta.chunk_overlap, agent.manager.config().chunking.overlap);
    assert_eq!(meta.vector_dims, Some(helpers::STUB_DIMS));
    assert!(!meta.provider_key.is_empty());
}

#[tokio::test]
async fn chunking_change_forces_full_reindex() {
    let dir = tempfile::TempDir::new().unwrap();
    let workspace = dir.path().join("workspace");
    let sessions = dir.path().join("sessions");
    std::fs::create_dir_all(&workspace).unwrap();
    std::fs::create_dir_all(&sessions).unwrap();
    write_file(&workspace.join("MEMORY.md"), "# content for reindex check\n");

    let agent_ctx = mnemos::AgentContext {
        agent_id: "re-agent".into(),
        workspace_dir: workspace.clone(),
        sessions_dir: sessions.clone(),
    };

    let first = mnemos::MemoryManager::with_provider(
        agent_ctx.clone(),
        test_config(),
        mnemos::embedding::Provider::Stub(mnemos::embedding::StubProvider::new(helpers::STUB_DIMS)),
    )
    .await
    .unwrap();
    first.sync(manual()).await.unwrap();
    drop(first);

    let mut changed = test_config();
    changed.chunking.tokens = 128;
    let second = mnemos::MemoryManager::with_provider(
        agent_ctx,
        changed,
        mnemos::embedding::Provider::Stub(mnemos::embedding::StubProvider::new(helpers::STUB_DIMS)),
    )
    .await
    .unwrap();
    let report = second.sync(manual()).await.unwrap();
    assert!(report.full, "fingerprint mismatch must trigger a full reindex");
}

#[tokio::test]
async fn forced_reindex_preserves_chunk_ids_and_results() {
    let agent = spawn_agent().await;
    write_file(
        &agent.workspace.join("MEMORY.md"),
        "# project\n\nthe database swap must be atomic\n",
    );
    agent.manager.sync(manual()).await.unwrap();

    let store = open_store(&agent);
    let ids_before = strings(&store, "SELECT id FROM chunks ORDER BY id");
    drop(store);

    let report = agent.manager.sync(forced()).await.unwrap();
    assert!(report.full);

    let store = open_store(&agent);
    let ids_after = strings(&store, "SELECT id FROM chunks ORDER BY id");
    assert_eq!(ids_before, ids_after);
    drop(store);

    // No temp or backup store files left behind.
    let mnemos_dir = agent.workspace.join(".mnemos");
    let leftovers: Vec<String> = std::fs::read_dir(&mnemos_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains(".tmp-") || n.contains(".bak-"))
        .collect();
    assert!(leftovers.is_empty(), "swap leftovers: {leftovers:?}");

    let hits = agent
        .manager
        .search("atomic database swap", mnemos::SearchOptions::default())
        .await
        .unwrap();
    assert!(!hits.is_empty());
}

#[tokio::test]
async fn failed_rebuild_leaves_previous_index_usable() {
    let dir = tempfile::TempDir::new().unwrap();
    let workspace = dir.path().join("workspace");
    let sessions = dir.path().join("sessions");
    std::fs::create_dir_all(&workspace).unwrap();
    std::fs::create_dir_all(&sessions).unwrap();
    write_file(&workspace.join("MEMORY.md"), "# durable content\n");

    let agent_ctx = mnemos::AgentContext {
        agent_id: "crash-agent".into(),
        workspace_dir: workspace.clone(),
        sessions_dir: sessions.clone(),
    };

    let good = mnemos::MemoryManager::with_provider(
        agent_ctx.clone(),
        test_config(),
        mnemos::embedding::Provider::Stub(mnemos::embedding::StubProvider::new(helpers::STUB_DIMS)),
    )
    .await
    .unwrap();
    good.sync(manual()).await.unwrap();
    drop(good);

    // A provider that cannot embed (nothing listens on this port) makes the
    // shadow build fail before any swap happens.
    let mut broken_cfg = test_config();
    broken_cfg.provider.openai.base_url = "http://127.0.0.1:9".into();
    broken_cfg.provider.openai.api_key = Some("sk-test".into());
    let broken_provider =
        mnemos::embedding::build_variant("openai", &broken_cfg.provider).unwrap();
    let broken = mnemos::MemoryManager::with_provider(agent_ctx.clone(), broken_cfg, broken_provider)
        .await
        .unwrap();
    let err = broken
        .sync(SyncOptions {
            reason: SyncReason::Manual,
            force: true,
        })
        .await
        .unwrap_err();
    assert!(format!("{err:#}").to_lowercase().contains("embedding"));
    drop(broken);

    // The original index is intact and searchable with the original settings.
    let revived = mnemos::MemoryManager::with_provider(
        agent_ctx,
        test_config(),
        mnemos::embedding::Provider::Stub(mnemos::embedding::StubProvider::new(helpers::STUB_DIMS)),
    )
    .await
    .unwrap();
    let report = revived.sync(manual()).await.unwrap();
    assert!(!report.full, "fingerprint still matches the good index");
    assert_eq!(report.indexed_files, 0);

    let hits = revived
        .search("durable content", mnemos::SearchOptions::default())
        .await
        .unwrap();
    assert!(!hits.is_empty());

    // Failed shadow builds must not leave temp stores around.
    let mnemos_dir = workspace.join(".mnemos");
    let leftovers: Vec<String> = std::fs::read_dir(&mnemos_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains(".tmp-"))
        .collect();
    assert!(leftovers.is_empty(), "leftover temp stores: {leftovers:?}");
}

#[tokio::test]
async fn cache_survives_forced_reindex() {
    let agent = spawn_agent().await;
    write_file(&agent.workspace.join("MEMORY.md"), "# cached forever\n");
    agent.manager.sync(manual()).await.unwrap();

    let store = open_store(&agent);
    let cache_before = count(&store, "SELECT COUNT(*) FROM embedding_cache");
    assert!(cache_before > 0);
    drop(store);

    agent.manager.sync(forced()).await.unwrap();

    let store = open_store(&agent);
    let cache_after = count(&store, "SELECT COUNT(*) FROM embedding_cache");
    assert!(
        cache_after >= cache_before,
        "reindex must seed the cache from the previous store"
    );
}

#[tokio::test]
async fn extra_paths_are_indexed() {
    let dir = tempfile::TempDir::new().unwrap();
    let shared = dir.path().join("shared");
    std::fs::create_dir_all(&shared).unwrap();
    write_file(&shared.join("team.md"), "# shared team knowledge base\n");

    let mut cfg = test_config();
    cfg.sources.extra_paths = vec![shared.to_string_lossy().into_owned()];
    let agent = spawn_agent_with(cfg).await;
    write_file(&agent.workspace.join("MEMORY.md"), "# own notes\n");

    agent.manager.sync(manual()).await.unwrap();
    let status = agent.manager.status().await.unwrap();
    assert_eq!(status.files, 2);

    let store = open_store(&agent);
    let paths = strings(&store, "SELECT path FROM files ORDER BY path");
    assert!(paths.iter().any(|p| p.ends_with("team.md")));
}
