//! Session transcripts: parsing and append-delta tracking.
//!
//! Transcripts are line-delimited JSON, append-only. Parsing keeps only
//! user/assistant message text and renders each message as a `"Role: text"`
//! line; that derived text is what gets chunked and indexed. The delta
//! tracker is a small per-file state machine over observed sizes — it never
//! re-reads a whole file to decide whether a sync is worth scheduling.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct TranscriptRecord {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<TranscriptMessage>,
}

#[derive(Debug, Deserialize)]
struct TranscriptMessage {
    role: Option<String>,
    content: Option<serde_json::Value>,
}

/// Derive the indexable text of a transcript. Malformed lines are skipped
/// silently; whitespace inside each extracted segment collapses to single
/// spaces.
pub fn transcript_text(raw: &str) -> String {
    let mut lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<TranscriptRecord>(line) else {
            continue;
        };
        if record.kind.as_deref() != Some("message") {
            continue;
        }
        let Some(message) = record.message else {
            continue;
        };
        let role = match message.role.as_deref() {
            Some("user") => "User",
            Some("assistant") => "Assistant",
            _ => continue,
        };
        let Some(text) = extract_content(&message.content) else {
            continue;
        };
        if text.is_empty() {
            continue;
        }
        lines.push(format!("{role}: {text}"));
    }
    lines.join("\n")
}

/// Pull the text out of a message content value: either a plain string or
/// an array of `{type: "text", text}` blocks.
fn extract_content(content: &Option<serde_json::Value>) -> Option<String> {
    match content {
        Some(serde_json::Value::String(s)) => Some(collapse_whitespace(s)),
        Some(serde_json::Value::Array(blocks)) => {
            let mut parts = Vec::new();
            for block in blocks {
                if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        let collapsed = collapse_whitespace(text);
                        if !collapsed.is_empty() {
                            parts.push(collapsed);
                        }
                    }
                }
            }
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(" "))
            }
        }
        _ => None,
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Append-delta tracking ───────────────────────────────────────────────

#[derive(Debug, Default)]
struct FileDelta {
    last_size: u64,
    pending_bytes: u64,
    pending_messages: u64,
}

/// Per-file growth accounting with byte and message thresholds.
///
/// A byte threshold of 0 means any growth triggers; a message threshold of 0
/// disables message counting. On trigger, pending counters are reduced by
/// their thresholds (clamped at zero), never reset outright, so sustained
/// growth past a multiple of the threshold schedules follow-up syncs.
#[derive(Debug)]
pub struct DeltaTracker {
    delta_bytes: u64,
    delta_messages: u64,
    files: HashMap<PathBuf, FileDelta>,
}

impl DeltaTracker {
    pub fn new(delta_bytes: u64, delta_messages: u64) -> Self {
        Self {
            delta_bytes,
            delta_messages,
            files: HashMap::new(),
        }
    }

    /// Record an observed file size. `count_newlines(from, to)` is invoked
    /// only when message counting is enabled and the file grew; it reports
    /// the newline count in the byte range `[from, to)`. Returns true when
    /// the file crossed a threshold and should be marked dirty.
    pub fn record<F>(&mut self, path: &Path, new_size: u64, count_newlines: F) -> bool
    where
        F: FnOnce(u64, u64) -> u64,
    {
        let entry = self.files.entry(path.to_path_buf()).or_default();

        if new_size < entry.last_size {
            // Truncated or rotated: reset the baseline and count the whole
            // new content as fresh.
            entry.pending_bytes += new_size;
        } else {
            entry.pending_bytes += new_size - entry.last_size;
        }

        if self.delta_messages > 0 && new_size > entry.last_size {
            entry.pending_messages += count_newlines(entry.last_size, new_size);
        }
        entry.last_size = new_size;

        let bytes_hit = if self.delta_bytes == 0 {
            entry.pending_bytes > 0
        } else {
            entry.pending_bytes >= self.delta_bytes
        };
        let messages_hit = self.delta_messages > 0 && entry.pending_messages >= self.delta_messages;

        if bytes_hit || messages_hit {
            entry.pending_bytes = if self.delta_bytes == 0 {
                0
            } else {
                entry.pending_bytes.saturating_sub(self.delta_bytes)
            };
            entry.pending_messages = if self.delta_messages == 0 {
                0
            } else {
                entry.pending_messages.saturating_sub(self.delta_messages)
            };
            true
        } else {
            false
        }
    }

    /// Pending counters for a file (bytes, messages); for tests and status.
    pub fn pending(&self, path: &Path) -> (u64, u64) {
        self.files
            .get(path)
            .map(|f| (f.pending_bytes, f.pending_messages))
            .unwrap_or((0, 0))
    }
}
