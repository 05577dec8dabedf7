//! Batch embedding orchestration.
//!
//! Chunks are greedily packed into token-bounded batches. Each provider call
//! is retried on transient failures with capped exponential backoff and
//! jitter, under a timeout that depends on whether the provider is remote.
//! Providers that support server-side batch jobs get the asynchronous path:
//! requests are tagged with deterministic custom ids, submitted as jobs,
//! polled to completion, and correlated back. Repeated batch failures latch
//! batch mode off for the remainder of the process; per-request embedding
//! continues transparently.

use anyhow::{Context, Result};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use super::remote::{BatchJobState, RemoteProvider, BATCH_ENDPOINT_UNAVAILABLE};
use super::Provider;
use crate::chunk::estimate_tokens;
use crate::config::BatchConfig;

/// Token budget per packed batch.
pub const MAX_BATCH_TOKENS: usize = 8000;

/// Failed submissions tolerated before batch mode latches off.
pub const BATCH_FAILURE_LIMIT: u32 = 2;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 8_000;

const QUERY_TIMEOUT_REMOTE: Duration = Duration::from_secs(60);
const QUERY_TIMEOUT_LOCAL: Duration = Duration::from_secs(300);
const BATCH_TIMEOUT_REMOTE: Duration = Duration::from_secs(120);
const BATCH_TIMEOUT_LOCAL: Duration = Duration::from_secs(600);

/// One text awaiting an embedding, tagged with the caller's position and the
/// deterministic id used to correlate provider-side batch results.
#[derive(Debug, Clone)]
pub struct PendingText {
    pub index: usize,
    pub text: String,
    pub custom_id: String,
}

#[derive(Debug, Default)]
struct LatchState {
    failures: u32,
    disabled: bool,
}

/// Orchestrates embedding work for one manager.
pub struct BatchManager {
    cfg: BatchConfig,
    latch: Mutex<LatchState>,
    jobs: Arc<Semaphore>,
}

impl BatchManager {
    pub fn new(cfg: BatchConfig) -> Self {
        let permits = cfg.concurrency.max(1);
        Self {
            cfg,
            latch: Mutex::new(LatchState::default()),
            jobs: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Whether provider-side batch mode is currently usable.
    pub async fn batch_mode_active(&self, provider: &Provider) -> bool {
        if !self.cfg.enabled || provider.batch_client().is_none() {
            return false;
        }
        !self.latch.lock().await.disabled
    }

    /// True once the failure latch has tripped (stays true for the process).
    pub async fn batch_disabled(&self) -> bool {
        self.latch.lock().await.disabled
    }

    /// Embed a single query under the per-kind timeout.
    pub async fn embed_query(&self, provider: &Provider, text: &str) -> Result<Vec<f32>> {
        let timeout = if provider.is_remote() {
            QUERY_TIMEOUT_REMOTE
        } else {
            QUERY_TIMEOUT_LOCAL
        };
        tokio::time::timeout(timeout, provider.embed_query(text))
            .await
            .map_err(|_| anyhow::anyhow!("query embedding timed out after {}s", timeout.as_secs()))?
    }

    /// Embed every pending text, returning vectors aligned with
    /// `items[i].index`. Uses provider-side batch jobs when available and
    /// falls back to per-request batches (for the whole set, or for the
    /// subset a failed job left behind).
    pub async fn embed_texts(
        &self,
        provider: &Provider,
        items: &[PendingText],
    ) -> Result<HashMap<usize, Vec<f32>>> {
        if items.is_empty() {
            return Ok(HashMap::new());
        }

        let mut resolved: HashMap<usize, Vec<f32>> = HashMap::new();
        let mut remaining: Vec<PendingText> = items.to_vec();

        if self.batch_mode_active(provider).await && self.cfg.wait {
            match self.run_batch_jobs(provider, &remaining).await {
                Ok(by_custom_id) => {
                    remaining.retain(|item| {
                        if let Some(v) = by_custom_id.get(&item.custom_id) {
                            resolved.insert(item.index, v.clone());
                            false
                        } else {
                            true
                        }
                    });
                    if !remaining.is_empty() {
                        debug!(
                            missing = remaining.len(),
                            "batch jobs left unresolved items; embedding per-request"
                        );
                    }
                }
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "provider-side batch mode failed; falling back to per-request");
                }
            }
        }

        if !remaining.is_empty() {
            self.embed_per_request(provider, &remaining, &mut resolved)
                .await?;
        }

        Ok(resolved)
    }

    async fn embed_per_request(
        &self,
        provider: &Provider,
        items: &[PendingText],
        resolved: &mut HashMap<usize, Vec<f32>>,
    ) -> Result<()> {
        for pack in pack_batches(items) {
            let texts: Vec<String> = pack.iter().map(|i| items[*i].text.clone()).collect();
            let vectors = self.embed_batch_with_retry(provider, &texts).await?;
            anyhow::ensure!(
                vectors.len() == pack.len(),
                "embedding count mismatch: sent {}, got {}",
                pack.len(),
                vectors.len()
            );
            for (slot, vector) in pack.into_iter().zip(vectors) {
                resolved.insert(items[slot].index, vector);
            }
        }
        Ok(())
    }

    /// One batch call with retry on transient provider errors.
    pub async fn embed_batch_with_retry(
        &self,
        provider: &Provider,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let timeout = if provider.is_remote() {
            BATCH_TIMEOUT_REMOTE
        } else {
            BATCH_TIMEOUT_LOCAL
        };

        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 1..=RETRY_ATTEMPTS {
            let call = tokio::time::timeout(timeout, provider.embed_batch(texts)).await;
            match call {
                Ok(Ok(vectors)) => return Ok(vectors),
                Ok(Err(err)) => {
                    let retryable = is_retryable(&format!("{err:#}"));
                    if !retryable || attempt == RETRY_ATTEMPTS {
                        return Err(err);
                    }
                    warn!(attempt, error = %format!("{err:#}"), "embedding batch failed; retrying");
                    last_err = Some(err);
                }
                Err(_) => {
                    let err = anyhow::anyhow!(
                        "embedding batch timed out after {}s",
                        timeout.as_secs()
                    );
                    if attempt == RETRY_ATTEMPTS {
                        return Err(err);
                    }
                    warn!(attempt, "embedding batch timed out; retrying");
                    last_err = Some(err);
                }
            }
            tokio::time::sleep(with_jitter(delay)).await;
            delay = (delay * 2).min(Duration::from_millis(RETRY_MAX_DELAY_MS));
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("embedding batch failed")))
    }

    // ── Provider-side batch jobs ────────────────────────────────────────

    async fn run_batch_jobs(
        &self,
        provider: &Provider,
        items: &[PendingText],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let client = provider
            .batch_client()
            .context("provider does not support batch jobs")?;

        let mut handles = Vec::new();
        for pack in pack_batches(items) {
            let lines: Vec<serde_json::Value> = pack
                .iter()
                .map(|i| client.batch_request_line(&items[*i].custom_id, &items[*i].text))
                .collect();
            let client = client.clone();
            let jobs = Arc::clone(&self.jobs);
            let poll_interval = Duration::from_millis(self.cfg.poll_interval_ms.max(100));
            let deadline = Duration::from_secs(self.cfg.timeout_minutes.max(1) * 60);
            handles.push(tokio::spawn(async move {
                let _permit = jobs.acquire_owned().await;
                run_one_job(&client, lines, poll_interval, deadline).await
            }));
        }

        let mut merged: HashMap<String, Vec<f32>> = HashMap::new();
        let mut first_err: Option<anyhow::Error> = None;
        for handle in handles {
            match handle.await.context("batch job task panicked")? {
                Ok(rows) => merged.extend(rows),
                Err(err) => {
                    let endpoint_gone = format!("{err:#}").contains(BATCH_ENDPOINT_UNAVAILABLE);
                    self.record_batch_failure(1, endpoint_gone).await;
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }

        match first_err {
            Some(err) if merged.is_empty() => Err(err),
            _ => {
                if !merged.is_empty() {
                    self.record_batch_success().await;
                }
                Ok(merged)
            }
        }
    }

    /// Count a failed batch submission. An "endpoint not available" signal
    /// trips the latch immediately.
    pub async fn record_batch_failure(&self, attempts: u32, endpoint_unavailable: bool) {
        let mut latch = self.latch.lock().await;
        let increment = if endpoint_unavailable {
            BATCH_FAILURE_LIMIT
        } else {
            attempts.max(1)
        };
        latch.failures += increment;
        if latch.failures >= BATCH_FAILURE_LIMIT && !latch.disabled {
            latch.disabled = true;
            warn!(
                failures = latch.failures,
                "batch mode disabled for this process; continuing per-request"
            );
        }
    }

    /// A successful batch resets the failure counter (the disable latch is
    /// permanent once tripped).
    pub async fn record_batch_success(&self) {
        let mut latch = self.latch.lock().await;
        if !latch.disabled {
            latch.failures = 0;
        }
    }
}

async fn run_one_job(
    client: &RemoteProvider,
    lines: Vec<serde_json::Value>,
    poll_interval: Duration,
    deadline: Duration,
) -> Result<HashMap<String, Vec<f32>>> {
    let jsonl: String = lines
        .iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join("\n");

    let file_id = client.upload_batch_input(jsonl).await?;
    let job_id = client.create_batch_job(&file_id).await?;
    debug!(%job_id, requests = lines.len(), "batch job submitted");

    let started = tokio::time::Instant::now();
    loop {
        if started.elapsed() > deadline {
            anyhow::bail!("batch job {job_id} timed out after {}s", deadline.as_secs());
        }
        match client.poll_batch_job(&job_id).await? {
            BatchJobState::Running => tokio::time::sleep(poll_interval).await,
            BatchJobState::Failed { message } => {
                anyhow::bail!("batch job {job_id} failed: {message}")
            }
            BatchJobState::Completed { output_file_id } => {
                let body = client.download_batch_output(&output_file_id).await?;
                let mut rows = HashMap::new();
                for line in body.lines().filter(|l| !l.trim().is_empty()) {
                    if let Some((custom_id, embedding)) = client.parse_batch_output_line(line) {
                        rows.insert(custom_id, embedding);
                    }
                }
                return Ok(rows);
            }
        }
    }
}

/// Greedily pack item indices into groups whose summed token estimate stays
/// within [`MAX_BATCH_TOKENS`]. An oversized item gets its own group.
pub fn pack_batches(items: &[PendingText]) -> Vec<Vec<usize>> {
    let mut packs: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_tokens = 0usize;

    for (i, item) in items.iter().enumerate() {
        let tokens = estimate_tokens(&item.text);
        if !current.is_empty() && current_tokens + tokens > MAX_BATCH_TOKENS {
            packs.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push(i);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        packs.push(current);
    }
    packs
}

/// Transient provider failures worth retrying.
fn is_retryable(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["rate limit", "rate_limit", "too many requests", "429", "resource exhausted", "5xx", "cloudflare"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Apply up to ±20% jitter to a backoff delay.
fn with_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{Provider, StubProvider};

    fn pending(texts: &[&str]) -> Vec<PendingText> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| PendingText {
                index: i,
                text: t.to_string(),
                custom_id: format!("cid-{i}"),
            })
            .collect()
    }

    #[test]
    fn pack_respects_token_budget() {
        let big = "x".repeat(MAX_BATCH_TOKENS * crate::chunk::CHARS_PER_TOKEN);
        let small = "y".repeat(10);
        let items = pending(&[&small, &big, &small, &small]);
        let packs = pack_batches(&items);

        for pack in &packs {
            if pack.len() > 1 {
                let total: usize = pack
                    .iter()
                    .map(|i| estimate_tokens(&items[*i].text))
                    .sum();
                assert!(total <= MAX_BATCH_TOKENS);
            }
        }
        // The oversized item sits alone.
        let big_pack = packs.iter().find(|p| p.contains(&1)).unwrap();
        assert_eq!(big_pack.len(), 1);
        // Every index appears exactly once.
        let mut all: Vec<usize> = packs.into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3]);
    }

    #[test]
    fn retryable_classification() {
        assert!(is_retryable("HTTP 429 Too Many Requests"));
        assert!(is_retryable("upstream rate limit hit"));
        assert!(is_retryable("embeddings request failed (HTTP 503, 5xx): oops"));
        assert!(is_retryable("Resource exhausted: quota"));
        assert!(is_retryable("cloudflare tunnel error"));
        assert!(!is_retryable("invalid api key"));
        assert!(!is_retryable("model not found"));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let jittered = with_jitter(base);
            assert!(jittered >= Duration::from_millis(800));
            assert!(jittered <= Duration::from_millis(1200));
        }
    }

    #[tokio::test]
    async fn stub_provider_embeds_per_request() {
        let manager = BatchManager::new(crate::config::BatchConfig::default());
        let provider = Provider::Stub(StubProvider::new(8));
        let items = pending(&["alpha text", "beta text", "gamma text"]);

        let resolved = manager.embed_texts(&provider, &items).await.unwrap();
        assert_eq!(resolved.len(), 3);
        for item in &items {
            assert!(resolved.contains_key(&item.index));
        }
    }

    #[tokio::test]
    async fn latch_trips_at_limit_and_stays() {
        let manager = BatchManager::new(crate::config::BatchConfig::default());
        assert!(!manager.batch_disabled().await);

        manager.record_batch_failure(1, false).await;
        assert!(!manager.batch_disabled().await);

        manager.record_batch_failure(1, false).await;
        assert!(manager.batch_disabled().await);

        // Success after the latch trips does not re-enable.
        manager.record_batch_success().await;
        assert!(manager.batch_disabled().await);
    }

    #[tokio::test]
    async fn endpoint_unavailable_disables_immediately() {
        let manager = BatchManager::new(crate::config::BatchConfig::default());
        manager.record_batch_failure(1, true).await;
        assert!(manager.batch_disabled().await);
    }

    #[tokio::test]
    async fn success_resets_counter_before_latch() {
        let manager = BatchManager::new(crate::config::BatchConfig::default());
        manager.record_batch_failure(1, false).await;
        manager.record_batch_success().await;
        manager.record_batch_failure(1, false).await;
        // 1 failure after a reset is still below the limit.
        assert!(!manager.batch_disabled().await);
    }

    #[tokio::test]
    async fn batch_mode_inactive_for_non_batch_providers() {
        let manager = BatchManager::new(crate::config::BatchConfig::default());
        let stub = Provider::Stub(StubProvider::new(8));
        assert!(!manager.batch_mode_active(&stub).await);
    }
}
