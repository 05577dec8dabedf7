//! Session transcript indexing and the append-delta trigger path.

mod helpers;

use helpers::{open_store, spawn_agent_with, strings, test_config, transcript_line, write_file};
use mnemos::{SearchOptions, SyncOptions, SyncReason};

fn manual() -> SyncOptions {
    SyncOptions {
        reason: SyncReason::Manual,
        force: false,
    }
}

fn append(path: &std::path::Path, content: &str) {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
}

#[tokio::test]
async fn transcripts_index_only_message_text() {
    let agent = spawn_agent_with(test_config()).await;
    let transcript = transcript_line("user", "remember the deploy password policy")
        + r#"{"type":"tool_result","payload":{"secret":"do not index"}}"#
        + "\n"
        + &transcript_line("assistant", "noted, policy stored")
        + "{broken json line\n";
    write_file(&agent.sessions.join("chat.jsonl"), &transcript);
    agent.manager.sync(manual()).await.unwrap();

    let store = open_store(&agent);
    let texts = strings(&store, "SELECT text FROM chunks WHERE source = 'sessions'");
    assert!(!texts.is_empty());
    let joined = texts.join("\n");
    assert!(joined.contains("User: remember the deploy password policy"));
    assert!(joined.contains("Assistant: noted, policy stored"));
    assert!(!joined.contains("do not index"), "non-message records leaked");
}

#[tokio::test]
async fn unchanged_transcript_is_not_reindexed() {
    let agent = spawn_agent_with(test_config()).await;
    write_file(
        &agent.sessions.join("chat.jsonl"),
        &transcript_line("user", "stable conversation"),
    );
    agent.manager.sync(manual()).await.unwrap();
    let second = agent.manager.sync(manual()).await.unwrap();
    assert_eq!(second.indexed_files, 0);
}

#[tokio::test]
async fn appended_messages_reindex_the_transcript() {
    let agent = spawn_agent_with(test_config()).await;
    let path = agent.sessions.join("chat.jsonl");
    write_file(&path, &transcript_line("user", "first question about caching"));
    agent.manager.sync(manual()).await.unwrap();

    append(&path, &transcript_line("assistant", "caching answer with eviction details"));
    let report = agent.manager.sync(manual()).await.unwrap();
    assert_eq!(report.indexed_files, 1);

    let hits = agent
        .manager
        .search("eviction details", SearchOptions::default())
        .await
        .unwrap();
    assert!(hits.iter().any(|h| h.path == "sessions/chat.jsonl"));
}

#[tokio::test]
async fn delta_thresholds_gate_dirty_marking() {
    // Messages threshold of 4 lines, byte threshold high enough to stay out
    // of the way.
    let mut cfg = test_config();
    cfg.sync.session_delta_bytes = 1_000_000;
    cfg.sync.session_delta_messages = 4;
    let agent = spawn_agent_with(cfg).await;
    let path = agent.sessions.join("chat.jsonl");

    // Three appended lines: below the message threshold.
    write_file(
        &path,
        &(transcript_line("user", "one")
            + &transcript_line("assistant", "two")
            + &transcript_line("user", "three")),
    );
    assert!(!agent.manager.note_session_growth(&path));
    assert!(!agent.manager.is_dirty());

    // One more line crosses the threshold.
    append(&path, &transcript_line("assistant", "four"));
    assert!(agent.manager.note_session_growth(&path));
    assert!(agent.manager.is_dirty());
}

#[tokio::test]
async fn delta_counters_subtract_instead_of_reset() {
    let mut cfg = test_config();
    cfg.sync.session_delta_bytes = 1_000_000;
    cfg.sync.session_delta_messages = 4;
    let agent = spawn_agent_with(cfg).await;
    let path = agent.sessions.join("chat.jsonl");

    // Six lines at once: crosses the threshold of 4, leaving 2 pending.
    let six: String = (0..6).map(|i| transcript_line("user", &format!("m{i}"))).collect();
    write_file(&path, &six);
    assert!(agent.manager.note_session_growth(&path));

    // One more line: 2 + 1 = 3, still below the threshold. A reset-to-zero
    // implementation would also stay below, but the next append separates
    // the behaviours.
    append(&path, &transcript_line("user", "m6"));
    assert!(!agent.manager.note_session_growth(&path));

    // 3 + 1 = 4: triggers again. With reset semantics this would be only 2.
    append(&path, &transcript_line("user", "m7"));
    assert!(agent.manager.note_session_growth(&path));
}

#[tokio::test]
async fn zero_byte_threshold_triggers_on_any_growth() {
    let mut cfg = test_config();
    cfg.sync.session_delta_bytes = 0;
    cfg.sync.session_delta_messages = 0;
    let agent = spawn_agent_with(cfg).await;
    let path = agent.sessions.join("chat.jsonl");

    write_file(&path, &transcript_line("user", "hello"));
    assert!(agent.manager.note_session_growth(&path));

    // No growth, no trigger.
    assert!(!agent.manager.note_session_growth(&path));
}

#[tokio::test]
async fn truncated_transcript_counts_fresh_content() {
    let mut cfg = test_config();
    cfg.sync.session_delta_bytes = 10;
    cfg.sync.session_delta_messages = 0;
    let agent = spawn_agent_with(cfg).await;
    let path = agent.sessions.join("chat.jsonl");

    write_file(&path, &transcript_line("user", "a fairly long first message"));
    assert!(agent.manager.note_session_growth(&path));

    // Rotate the file down to something smaller; the whole new size counts.
    write_file(&path, &transcript_line("user", "tiny"));
    assert!(agent.manager.note_session_growth(&path));
}
