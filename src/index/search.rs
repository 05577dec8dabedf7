//! Read path: dense kNN over the vec0 table, BM25 keyword search over FTS5,
//! and the weighted hybrid merge.
//!
//! Scores are max-normalized per list before blending so neither signal
//! dominates by scale alone; chunk identity is preserved across the two
//! lists via `chunks.id`.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;

use super::{embedding_to_bytes, l2_distance_to_similarity};
use crate::db::Store;

/// Snippets carry at most this many characters of chunk text.
pub const SNIPPET_MAX_CHARS: usize = 700;

/// A ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// Chunk id — stable across re-indexing of unchanged content.
    pub id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub snippet: String,
    pub score: f32,
    /// `path#Lstart-Lend`, ready for inclusion in answers.
    pub citation: String,
}

/// Candidate pool size per list: `max_results * multiplier`, at least 1,
/// capped at 200.
pub fn candidate_limit(max_results: usize, multiplier: f32) -> usize {
    let scaled = (max_results as f32 * multiplier).floor() as usize;
    scaled.clamp(1, 200)
}

/// kNN over the vector table, restricted to the given sources and model.
/// Scores are cosine-equivalent similarities in `[0, 1]`.
pub fn vector_search(
    store: &Store,
    query_vec: &[f32],
    sources: &[&str],
    model: &str,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    if !store.vector_available || query_vec.is_empty() || sources.is_empty() {
        return Ok(Vec::new());
    }

    let source_marks: Vec<String> = (0..sources.len()).map(|i| format!("?{}", i + 4)).collect();
    let sql = format!(
        "SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.text, v.distance
         FROM (SELECT id, distance FROM chunks_vec
               WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2) v
         JOIN chunks c ON c.id = v.id
         WHERE c.model = ?3 AND c.source IN ({})
         ORDER BY v.distance",
        source_marks.join(", ")
    );

    let mut stmt = store.conn().prepare(&sql)?;
    let embedding_bytes = embedding_to_bytes(query_vec);
    let limit_i64 = limit as i64;
    let mut bound: Vec<&dyn rusqlite::types::ToSql> =
        vec![&embedding_bytes, &limit_i64, &model];
    for source in sources {
        bound.push(source as &dyn rusqlite::types::ToSql);
    }

    let rows = stmt.query_map(bound.as_slice(), |r| {
        let text: String = r.get(5)?;
        let distance: f64 = r.get(6)?;
        Ok(SearchHit {
            id: r.get(0)?,
            path: r.get(1)?,
            source: r.get(2)?,
            start_line: r.get(3)?,
            end_line: r.get(4)?,
            snippet: snippet(&text),
            score: l2_distance_to_similarity(distance),
            citation: String::new(),
        })
    })?;

    let mut hits = Vec::new();
    for row in rows {
        let mut hit = row?;
        hit.citation = format!("{}#L{}-L{}", hit.path, hit.start_line, hit.end_line);
        hits.push(hit);
    }
    Ok(hits)
}

/// BM25 keyword search over the FTS table. Raw ranks are converted to
/// `1 / (1 + rank)` text scores in `(0, 1]`.
pub fn keyword_search(
    store: &Store,
    query: &str,
    sources: &[&str],
    model: &str,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    if !store.fts_available || sources.is_empty() {
        return Ok(Vec::new());
    }
    let Some(fts_query) = build_fts_query(query) else {
        return Ok(Vec::new());
    };

    let source_marks: Vec<String> = (0..sources.len()).map(|i| format!("?{}", i + 4)).collect();
    let sql = format!(
        "SELECT id, path, source, start_line, end_line, text, bm25(chunks_fts) AS rank
         FROM chunks_fts
         WHERE chunks_fts MATCH ?1 AND model = ?3 AND source IN ({})
         ORDER BY rank ASC LIMIT ?2",
        source_marks.join(", ")
    );

    let mut stmt = store.conn().prepare(&sql)?;
    let limit_i64 = limit as i64;
    let mut bound: Vec<&dyn rusqlite::types::ToSql> = vec![&fts_query, &limit_i64, &model];
    for source in sources {
        bound.push(source as &dyn rusqlite::types::ToSql);
    }

    let rows = stmt.query_map(bound.as_slice(), |r| {
        let text: String = r.get(5)?;
        let rank: f64 = r.get(6)?;
        let start_line: i64 = r.get(3)?;
        let end_line: i64 = r.get(4)?;
        let path: String = r.get(1)?;
        Ok(SearchHit {
            id: r.get(0)?,
            citation: format!("{path}#L{start_line}-L{end_line}"),
            path,
            source: r.get(2)?,
            start_line,
            end_line,
            snippet: snippet(&text),
            score: bm25_rank_to_score(rank),
        })
    })?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Into::into)
}

/// Blend the two candidate lists: normalize each by its own max, then weight.
/// Keyword snippets win when a chunk appears in both lists (they reflect the
/// matched text).
pub fn merge_hybrid(
    vector: Vec<SearchHit>,
    keyword: Vec<SearchHit>,
    vector_weight: f32,
    text_weight: f32,
) -> Vec<SearchHit> {
    let vector_max = vector.iter().map(|h| h.score).fold(0.0f32, f32::max);
    let keyword_max = keyword.iter().map(|h| h.score).fold(0.0f32, f32::max);

    struct Blend {
        vector_score: f32,
        text_score: f32,
        hit: SearchHit,
    }

    let mut by_id: HashMap<String, Blend> = HashMap::new();
    for hit in vector {
        let normalized = if vector_max > 0.0 { hit.score / vector_max } else { 0.0 };
        by_id.insert(
            hit.id.clone(),
            Blend {
                vector_score: normalized,
                text_score: 0.0,
                hit,
            },
        );
    }
    for hit in keyword {
        let normalized = if keyword_max > 0.0 { hit.score / keyword_max } else { 0.0 };
        match by_id.get_mut(&hit.id) {
            Some(blend) => {
                blend.text_score = normalized;
                if !hit.snippet.is_empty() {
                    blend.hit.snippet = hit.snippet;
                }
            }
            None => {
                by_id.insert(
                    hit.id.clone(),
                    Blend {
                        vector_score: 0.0,
                        text_score: normalized,
                        hit,
                    },
                );
            }
        }
    }

    let mut merged: Vec<SearchHit> = by_id
        .into_values()
        .map(|blend| {
            let mut hit = blend.hit;
            hit.score = vector_weight * blend.vector_score + text_weight * blend.text_score;
            hit
        })
        .collect();
    merged.sort_by(|a, b| b.score.total_cmp(&a.score));
    merged
}

/// Sanitize free text into an FTS5 MATCH expression: alphanumeric tokens,
/// each quoted, joined with AND. Returns None when nothing queryable remains.
pub fn build_fts_query(raw: &str) -> Option<String> {
    let tokens: Vec<String> = raw
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" AND "))
    }
}

/// FTS5 bm25() ranks are lower-is-better and can be negative; map to a
/// bounded text score where better ranks score higher.
fn bm25_rank_to_score(rank: f64) -> f32 {
    let normalized = if rank.is_finite() { rank.max(0.0) } else { 999.0 };
    (1.0 / (1.0 + normalized)) as f32
}

/// Leading slice of chunk text, cut at a char boundary.
fn snippet(text: &str) -> String {
    if text.len() <= SNIPPET_MAX_CHARS {
        return text.to_string();
    }
    let end = text
        .char_indices()
        .take_while(|(i, _)| *i < SNIPPET_MAX_CHARS)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(SNIPPET_MAX_CHARS);
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f32, snippet: &str) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            path: "MEMORY.md".into(),
            source: "memory".into(),
            start_line: 1,
            end_line: 2,
            snippet: snippet.to_string(),
            score,
            citation: "MEMORY.md#L1-L2".into(),
        }
    }

    #[test]
    fn build_fts_query_quotes_and_joins() {
        assert_eq!(
            build_fts_query("hello world"),
            Some("\"hello\" AND \"world\"".to_string())
        );
        assert_eq!(
            build_fts_query("c'est déjà-vu"),
            Some("\"c\" AND \"est\" AND \"déjà\" AND \"vu\"".to_string())
        );
        assert_eq!(build_fts_query("snake_case stays"), Some("\"snake_case\" AND \"stays\"".to_string()));
        assert_eq!(build_fts_query("!!!"), None);
        assert_eq!(build_fts_query(""), None);
    }

    #[test]
    fn bm25_rank_conversion_is_monotonic() {
        // Better (lower) rank -> higher score.
        assert!(bm25_rank_to_score(0.0) > bm25_rank_to_score(1.0));
        assert!(bm25_rank_to_score(1.0) > bm25_rank_to_score(5.0));
        // Negative (FTS5-better-than-zero) saturates at 1.0.
        assert_eq!(bm25_rank_to_score(-3.0), 1.0);
        assert!(bm25_rank_to_score(f64::NAN) < 0.01);
    }

    #[test]
    fn snippet_truncates_on_char_boundary() {
        let text = "é".repeat(SNIPPET_MAX_CHARS); // 2 bytes per char
        let s = snippet(&text);
        assert!(s.len() <= SNIPPET_MAX_CHARS);
        assert!(s.chars().all(|c| c == 'é'));

        assert_eq!(snippet("short"), "short");
    }

    #[test]
    fn candidate_limit_bounds() {
        assert_eq!(candidate_limit(6, 3.0), 18);
        assert_eq!(candidate_limit(0, 3.0), 1);
        assert_eq!(candidate_limit(100, 4.0), 200);
    }

    #[test]
    fn merge_normalizes_and_weights() {
        let vector = vec![hit("a", 0.8, "vec a"), hit("b", 0.4, "vec b")];
        let keyword = vec![hit("b", 0.5, "kw b"), hit("c", 0.25, "kw c")];

        let merged = merge_hybrid(vector, keyword, 0.6, 0.4);
        let scores: HashMap<String, f32> =
            merged.iter().map(|h| (h.id.clone(), h.score)).collect();

        // a: vector max -> 0.6 * 1.0
        assert!((scores["a"] - 0.6).abs() < 1e-6);
        // b: 0.6 * (0.4/0.8) + 0.4 * (0.5/0.5) = 0.3 + 0.4
        assert!((scores["b"] - 0.7).abs() < 1e-6);
        // c: keyword only, 0.4 * 0.5
        assert!((scores["c"] - 0.2).abs() < 1e-6);

        // b is first, and its snippet comes from the keyword list.
        assert_eq!(merged[0].id, "b");
        assert_eq!(merged[0].snippet, "kw b");
    }

    #[test]
    fn merge_handles_empty_lists() {
        let merged = merge_hybrid(Vec::new(), vec![hit("a", 0.5, "kw")], 0.7, 0.3);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].score - 0.3).abs() < 1e-6);

        let merged = merge_hybrid(vec![hit("a", 0.5, "v")], Vec::new(), 0.7, 0.3);
        assert!((merged[0].score - 0.7).abs() < 1e-6);

        assert!(merge_hybrid(Vec::new(), Vec::new(), 0.7, 0.3).is_empty());
    }
}
