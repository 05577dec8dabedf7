//! Markdown chunking for the memory index.
//!
//! Documents are split into line-bounded windows sized by a conservative
//! character-per-token estimate, with a configurable line overlap carried
//! into each subsequent window. Chunk hashes are content-only, so unchanged
//! text keeps its hash even when surrounding lines shift.

use sha2::{Digest, Sha256};

/// Characters assumed per token. Deliberately conservative (real tokenisers
/// average ~4 chars/token) so that batch packing against a token budget can
/// never overflow the provider's real limit.
pub const CHARS_PER_TOKEN: usize = 1;

/// Smallest window the chunker will produce, regardless of configuration.
const MIN_WINDOW_CHARS: usize = 32;

/// A line-bounded slice of a document. Line numbers are 1-based inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub start_line: usize,
    pub end_line: usize,
    pub hash: String,
}

/// Hex-encoded SHA-256 of arbitrary text.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Estimate the token count of a text under [`CHARS_PER_TOKEN`].
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Split Markdown into overlapping, line-oriented chunks.
///
/// The window budget is `tokens * CHARS_PER_TOKEN` characters (at least
/// [`MIN_WINDOW_CHARS`]). Fenced code blocks are kept intact where possible:
/// when the window overflows mid-fence, the lines before the fence are
/// flushed and the open fence starts the next window. A fence that alone
/// exceeds the budget is emitted as a single oversized chunk. Overlong
/// single lines are split at whitespace where possible so URLs and other
/// unbroken runs survive intact. Blank-only windows are dropped.
pub fn chunk_markdown(content: &str, tokens: usize, overlap: usize) -> Vec<Chunk> {
    let lines: Vec<&str> = content.split('\n').collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let max_chars = MIN_WINDOW_CHARS.max(tokens * CHARS_PER_TOKEN);
    let overlap_chars = overlap * CHARS_PER_TOKEN;

    let mut chunks: Vec<Chunk> = Vec::new();
    // (text, line number) pairs accumulated for the current window.
    let mut current: Vec<(String, usize)> = Vec::new();
    let mut current_chars = 0usize;
    let mut in_fence = false;
    // Index into `current` where the open fence begins.
    let mut fence_start: Option<usize> = None;

    let flush = |window: &[(String, usize)], out: &mut Vec<Chunk>| {
        if window.is_empty() {
            return;
        }
        let text: String = window
            .iter()
            .map(|(l, _)| l.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if text.trim().is_empty() {
            return;
        }
        out.push(Chunk {
            start_line: window[0].1,
            end_line: window[window.len() - 1].1,
            hash: hash_text(&text),
            text,
        });
    };

    for (i, line) in lines.iter().enumerate() {
        let line_no = i + 1;
        let opens_or_closes_fence = line.trim_start().starts_with("```");

        for segment in split_long_line(line, max_chars) {
            let seg_size = segment.len() + 1;
            if current_chars + seg_size > max_chars && !current.is_empty() {
                match fence_start {
                    Some(0) => {
                        // The fence itself exceeds the window; let it grow and
                        // emit it whole once it closes.
                    }
                    Some(at) => {
                        // Truncate at the fence boundary; the open fence
                        // becomes the head of the next window.
                        flush(&current[..at], &mut chunks);
                        current.drain(..at);
                        current_chars = current.iter().map(|(l, _)| l.len() + 1).sum();
                        fence_start = Some(0);
                    }
                    None => {
                        flush(&current, &mut chunks);
                        carry_overlap(&mut current, &mut current_chars, overlap_chars);
                    }
                }
            }
            current.push((segment, line_no));
            current_chars += seg_size;
        }

        if opens_or_closes_fence {
            in_fence = !in_fence;
            fence_start = if in_fence {
                Some(current.len().saturating_sub(1))
            } else {
                None
            };
        }
    }
    flush(&current, &mut chunks);

    chunks
}

/// Keep the trailing lines of the previous window as the head of the next.
fn carry_overlap(current: &mut Vec<(String, usize)>, current_chars: &mut usize, overlap_chars: usize) {
    if overlap_chars == 0 || current.is_empty() {
        current.clear();
        *current_chars = 0;
        return;
    }
    let mut acc = 0usize;
    let mut keep_from = current.len();
    while keep_from > 0 {
        let candidate = &current[keep_from - 1];
        acc += candidate.0.len() + 1;
        keep_from -= 1;
        if acc >= overlap_chars {
            break;
        }
    }
    current.drain(..keep_from);
    *current_chars = current.iter().map(|(l, _)| l.len() + 1).sum();
}

/// Split an overlong line into segments of roughly `max_chars`, always at
/// whitespace. An unbroken run longer than the budget (a URL, a long token)
/// is kept whole in an oversized segment rather than cut.
fn split_long_line(line: &str, max_chars: usize) -> Vec<String> {
    if line.len() <= max_chars {
        return vec![line.to_string()];
    }
    let mut segments = Vec::new();
    let mut rest = line;
    while rest.len() > max_chars {
        let window = &rest[..floor_char_boundary(rest, max_chars)];
        let split_at = match window.rfind(char::is_whitespace) {
            Some(at) if at > 0 => at + 1,
            _ => {
                // No boundary inside the window: extend to the end of the
                // unbroken run instead of cutting it.
                match rest[window.len()..].find(char::is_whitespace) {
                    Some(extra) => window.len() + extra + 1,
                    None => rest.len(),
                }
            }
        };
        segments.push(rest[..split_at].to_string());
        rest = &rest[split_at..];
    }
    if !rest.is_empty() {
        segments.push(rest.to_string());
    }
    segments
}

/// Largest index `<= at` that falls on a UTF-8 character boundary.
fn floor_char_boundary(s: &str, at: usize) -> usize {
    if at >= s.len() {
        return s.len();
    }
    let mut at = at;
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}
