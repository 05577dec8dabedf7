//! Persistent embedding cache.
//!
//! Entries are keyed by `(provider, model, provider_key, chunk_hash)`, so a
//! provider switch invalidates hits without deleting rows, and switching
//! back revives them. The cache is pruned to a configured entry count by
//! oldest `updated_at`.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};

use super::{embedding_to_json, parse_embedding_json};

/// SQLite caps host parameters per statement; stay well under it.
const LOAD_BATCH_SIZE: usize = 400;

/// The provider deployment a cache lookup or write is scoped to.
#[derive(Debug, Clone)]
pub struct CacheScope {
    pub provider: String,
    pub model: String,
    pub provider_key: String,
}

/// Fetch cached embeddings for the given chunk hashes. Only entries matching
/// the scope are returned. No-op when caching is disabled.
pub fn load(
    conn: &Connection,
    scope: &CacheScope,
    hashes: &[String],
    enabled: bool,
) -> Result<HashMap<String, Vec<f32>>> {
    let mut found = HashMap::new();
    if !enabled || hashes.is_empty() {
        return Ok(found);
    }

    let unique: Vec<&String> = {
        let mut seen = HashSet::new();
        hashes.iter().filter(|h| seen.insert(h.as_str())).collect()
    };

    for group in unique.chunks(LOAD_BATCH_SIZE) {
        let placeholders: Vec<String> = (0..group.len()).map(|i| format!("?{}", i + 4)).collect();
        let sql = format!(
            "SELECT hash, embedding FROM embedding_cache
             WHERE provider = ?1 AND model = ?2 AND provider_key = ?3
               AND hash IN ({})",
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;

        let mut bound: Vec<&dyn rusqlite::types::ToSql> = vec![
            &scope.provider,
            &scope.model,
            &scope.provider_key,
        ];
        for hash in group {
            bound.push(*hash as &dyn rusqlite::types::ToSql);
        }

        let rows = stmt.query_map(bound.as_slice(), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (hash, raw) = row?;
            let embedding = parse_embedding_json(&raw);
            if !embedding.is_empty() {
                found.insert(hash, embedding);
            }
        }
    }

    Ok(found)
}

/// Insert or replace cache entries for the scope. No-op when disabled.
pub fn upsert(
    conn: &Connection,
    scope: &CacheScope,
    entries: &[(String, Vec<f32>)],
    enabled: bool,
) -> Result<()> {
    if !enabled || entries.is_empty() {
        return Ok(());
    }
    let now = chrono::Utc::now().timestamp_millis();
    let mut stmt = conn.prepare(
        "INSERT INTO embedding_cache (provider, model, provider_key, hash, embedding, dims, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(provider, model, provider_key, hash) DO UPDATE SET
           embedding = excluded.embedding,
           dims = excluded.dims,
           updated_at = excluded.updated_at",
    )?;
    for (hash, embedding) in entries {
        stmt.execute(params![
            scope.provider,
            scope.model,
            scope.provider_key,
            hash,
            embedding_to_json(embedding),
            embedding.len() as i64,
            now,
        ])?;
    }
    Ok(())
}

/// Delete oldest entries until the cache holds at most `max_entries` rows.
/// No-op when disabled.
pub fn prune_if_needed(conn: &Connection, max_entries: usize, enabled: bool) -> Result<()> {
    if !enabled {
        return Ok(());
    }
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM embedding_cache", [], |r| r.get(0))?;
    let excess = count - max_entries as i64;
    if excess <= 0 {
        return Ok(());
    }
    conn.execute(
        "DELETE FROM embedding_cache WHERE rowid IN (
            SELECT rowid FROM embedding_cache ORDER BY updated_at ASC LIMIT ?1
        )",
        params![excess],
    )?;
    tracing::debug!(pruned = excess, "embedding cache pruned");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    fn scope() -> CacheScope {
        CacheScope {
            provider: "stub".into(),
            model: "stub-embed".into(),
            provider_key: "key-a".into(),
        }
    }

    fn entry(hash: &str, seed: f32) -> (String, Vec<f32>) {
        (hash.to_string(), vec![seed, seed + 1.0])
    }

    #[test]
    fn load_returns_only_matching_scope() {
        let store = Store::open_in_memory(false).unwrap();
        let conn = store.conn();
        upsert(conn, &scope(), &[entry("h1", 0.1), entry("h2", 0.2)], true).unwrap();

        let other = CacheScope {
            provider_key: "key-b".into(),
            ..scope()
        };
        upsert(conn, &other, &[entry("h3", 0.3)], true).unwrap();

        let hits = load(
            conn,
            &scope(),
            &["h1".into(), "h2".into(), "h3".into()],
            true,
        )
        .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.contains_key("h1"));
        assert!(hits.contains_key("h2"));
        assert!(!hits.contains_key("h3"), "other deployment's entry leaked");
    }

    #[test]
    fn upsert_replaces_on_conflict() {
        let store = Store::open_in_memory(false).unwrap();
        let conn = store.conn();
        upsert(conn, &scope(), &[entry("h1", 0.1)], true).unwrap();
        upsert(conn, &scope(), &[(String::from("h1"), vec![9.0, 9.0, 9.0])], true).unwrap();

        let hits = load(conn, &scope(), &["h1".into()], true).unwrap();
        assert_eq!(hits["h1"], vec![9.0, 9.0, 9.0]);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM embedding_cache", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let dims: i64 = conn
            .query_row("SELECT dims FROM embedding_cache WHERE hash = 'h1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(dims, 3);
    }

    #[test]
    fn disabled_cache_is_a_no_op() {
        let store = Store::open_in_memory(false).unwrap();
        let conn = store.conn();
        upsert(conn, &scope(), &[entry("h1", 0.1)], false).unwrap();
        let hits = load(conn, &scope(), &["h1".into()], false).unwrap();
        assert!(hits.is_empty());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM embedding_cache", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn prune_removes_oldest_first() {
        let store = Store::open_in_memory(false).unwrap();
        let conn = store.conn();

        // Insert with explicit timestamps so age ordering is deterministic.
        let mut stmt = conn
            .prepare(
                "INSERT INTO embedding_cache (provider, model, provider_key, hash, embedding, dims, updated_at)
                 VALUES ('stub', 'stub-embed', 'key-a', ?1, '[0.0]', 1, ?2)",
            )
            .unwrap();
        for i in 0..10 {
            stmt.execute(params![format!("h{i}"), i as i64]).unwrap();
        }
        drop(stmt);

        prune_if_needed(conn, 4, true).unwrap();

        let remaining: Vec<String> = conn
            .prepare("SELECT hash FROM embedding_cache ORDER BY updated_at")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(remaining, vec!["h6", "h7", "h8", "h9"]);
    }

    #[test]
    fn load_handles_more_hashes_than_one_statement() {
        let store = Store::open_in_memory(false).unwrap();
        let conn = store.conn();

        let entries: Vec<(String, Vec<f32>)> =
            (0..450).map(|i| entry(&format!("h{i}"), i as f32)).collect();
        upsert(conn, &scope(), &entries, true).unwrap();

        let hashes: Vec<String> = (0..450).map(|i| format!("h{i}")).collect();
        let hits = load(conn, &scope(), &hashes, true).unwrap();
        assert_eq!(hits.len(), 450);
    }
}
