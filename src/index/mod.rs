//! Core index engine — syncing documents into the store, caching
//! embeddings, parsing session transcripts, and answering queries.
//!
//! The write path lives in [`sync`], the read path in [`search`], the
//! embedding cache in [`cache`], and transcript handling in [`session`].

pub mod cache;
pub mod search;
pub mod session;
pub mod sync;

/// Source tag for workspace memory documents.
pub const SOURCE_MEMORY: &str = "memory";
/// Source tag for session transcripts. Their `files.path` values live under
/// the reserved `sessions/` prefix so they can never collide with memory
/// paths.
pub const SOURCE_SESSIONS: &str = "sessions";

/// Convert an f32 embedding slice to raw bytes for the vec0 table.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Serialize an embedding as the JSON float array stored in `chunks`.
pub fn embedding_to_json(embedding: &[f32]) -> String {
    serde_json::to_string(embedding).unwrap_or_else(|_| "[]".to_string())
}

/// Parse a stored JSON embedding; malformed input yields an empty vector.
pub fn parse_embedding_json(raw: &str) -> Vec<f32> {
    serde_json::from_str::<Vec<f32>>(raw).unwrap_or_default()
}

/// Similarity for unit vectors given their L2 distance:
/// `cos = 1 - d^2 / 2`, clamped to `[0, 1]`.
pub fn l2_distance_to_similarity(distance: f64) -> f32 {
    let sim = 1.0 - (distance * distance) / 2.0;
    sim.clamp(0.0, 1.0) as f32
}
