//! Embedding providers.
//!
//! One tagged [`Provider`] covers the local ONNX engine, OpenAI-compatible
//! and Gemini-compatible remote endpoints, and a deterministic stub used by
//! tests. The orchestrator inspects the tag to decide whether provider-side
//! batch jobs are available; everything else goes through the shared
//! `embed_query` / `embed_batch` surface.

pub mod batch;
pub mod local;
pub mod remote;

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::config::ProviderConfig;
use crate::error::MemoryError;

/// A provider ready to produce embeddings.
#[derive(Clone)]
pub enum Provider {
    Local(local::LocalProvider),
    OpenAi(remote::RemoteProvider),
    Gemini(remote::RemoteProvider),
    /// Deterministic offline embedder for tests. Never chosen by the factory.
    Stub(StubProvider),
}

impl Provider {
    pub fn id(&self) -> &'static str {
        match self {
            Provider::Local(_) => "local",
            Provider::OpenAi(_) => "openai",
            Provider::Gemini(_) => "gemini",
            Provider::Stub(_) => "stub",
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Provider::Local(p) => p.model(),
            Provider::OpenAi(p) | Provider::Gemini(p) => p.model(),
            Provider::Stub(p) => p.model(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Provider::OpenAi(_) | Provider::Gemini(_))
    }

    /// The remote client when this provider supports batch-job submission.
    pub fn batch_client(&self) -> Option<&remote::RemoteProvider> {
        match self {
            Provider::OpenAi(p) | Provider::Gemini(p) => Some(p),
            _ => None,
        }
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        match self {
            Provider::Local(p) => p.embed_query(text).await,
            Provider::OpenAi(p) | Provider::Gemini(p) => p.embed_query(text).await,
            Provider::Stub(_) => {
                let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
                vectors
                    .pop()
                    .ok_or_else(|| anyhow::anyhow!("stub embedding produced no output"))
            }
        }
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match self {
            Provider::Local(p) => p.embed_batch(texts).await,
            Provider::OpenAi(p) | Provider::Gemini(p) => p.embed_batch(texts).await,
            // CPU-bound like the local engine, so it runs off the runtime.
            Provider::Stub(p) => {
                let stub = p.clone();
                let owned: Vec<String> = texts.to_vec();
                tokio::task::spawn_blocking(move || {
                    owned.iter().map(|t| stub.embed(t)).collect()
                })
                .await
                .map_err(|e| anyhow::anyhow!("stub embedding task failed: {e}"))
            }
        }
    }

    /// Deployment discriminator for embedding-cache scoping: a digest over
    /// provider id, base URL, model, and non-secret header entries. Rotating
    /// an API key keeps the same key; pointing the same provider id at a
    /// different deployment gets a new one.
    pub fn provider_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id().as_bytes());
        hasher.update(b"\n");
        match self {
            Provider::Local(p) => {
                hasher.update(p.model().as_bytes());
            }
            Provider::OpenAi(p) | Provider::Gemini(p) => {
                hasher.update(p.base_url().as_bytes());
                hasher.update(b"\n");
                hasher.update(p.model().as_bytes());
                for (name, value) in p.headers() {
                    if is_secret_header(name) {
                        continue;
                    }
                    hasher.update(b"\n");
                    hasher.update(name.to_ascii_lowercase().as_bytes());
                    hasher.update(b"=");
                    hasher.update(value.as_bytes());
                }
            }
            Provider::Stub(p) => {
                hasher.update(p.model().as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())[..16].to_string()
    }
}

fn is_secret_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("authorization") || lower.contains("api-key") || lower.contains("token")
}

/// Result of provider construction, carrying fallback annotations when the
/// configured primary failed and the fallback took over.
pub struct ProviderInit {
    pub provider: Provider,
    pub fallback_from: Option<String>,
    pub fallback_reason: Option<String>,
}

/// Construct the configured provider.
///
/// `auto` prefers local only when the model file is actually present, then
/// tries OpenAI and Gemini in order, skipping providers that fail with a
/// missing API key. A non-auto primary that fails construction gets one
/// attempt at the configured fallback (if different).
pub fn create_provider(cfg: &ProviderConfig) -> Result<ProviderInit> {
    if cfg.primary == "auto" {
        return create_auto(cfg);
    }

    match build_variant(&cfg.primary, cfg) {
        Ok(provider) => Ok(ProviderInit {
            provider,
            fallback_from: None,
            fallback_reason: None,
        }),
        Err(primary_err) => {
            let fallback = cfg.fallback.as_deref().filter(|f| *f != cfg.primary);
            if let Some(name) = fallback {
                let reason = format!("{primary_err:#}");
                let provider = build_variant(name, cfg).map_err(|fallback_err| {
                    anyhow::Error::new(MemoryError::NoProvider {
                        reasons: format!(
                            "{}: {reason}; {name}: {fallback_err:#}",
                            cfg.primary
                        ),
                    })
                })?;
                tracing::warn!(
                    from = %cfg.primary,
                    to = name,
                    %reason,
                    "primary embedding provider unavailable, using fallback"
                );
                Ok(ProviderInit {
                    provider,
                    fallback_from: Some(cfg.primary.clone()),
                    fallback_reason: Some(reason),
                })
            } else {
                Err(primary_err)
            }
        }
    }
}

/// Build one specific provider variant by name.
pub fn build_variant(name: &str, cfg: &ProviderConfig) -> Result<Provider> {
    match name {
        "local" => Ok(Provider::Local(local::LocalProvider::new(&cfg.local)?)),
        "openai" => Ok(Provider::OpenAi(remote::RemoteProvider::new(
            remote::RemoteKind::OpenAi,
            &cfg.openai,
        )?)),
        "gemini" => Ok(Provider::Gemini(remote::RemoteProvider::new(
            remote::RemoteKind::Gemini,
            &cfg.gemini,
        )?)),
        // Offline deterministic embedder; useful for CI and air-gapped runs.
        "stub" => Ok(Provider::Stub(StubProvider::new(64))),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: auto, local, openai, gemini, stub"),
    }
}

fn create_auto(cfg: &ProviderConfig) -> Result<ProviderInit> {
    let model_path = crate::config::expand_tilde(&cfg.local.model_path);
    if !cfg.local.model_path.is_empty() && model_path.is_file() {
        let provider = Provider::Local(local::LocalProvider::new(&cfg.local)?);
        return Ok(ProviderInit {
            provider,
            fallback_from: None,
            fallback_reason: None,
        });
    }

    let mut reasons: Vec<String> = vec![format!(
        "local: no model file at {}",
        model_path.display()
    )];
    for name in ["openai", "gemini"] {
        match build_variant(name, cfg) {
            Ok(provider) => {
                return Ok(ProviderInit {
                    provider,
                    fallback_from: None,
                    fallback_reason: None,
                })
            }
            Err(err) if MemoryError::is_missing_key(&err) => {
                reasons.push(format!("{name}: {err:#}"));
            }
            Err(err) => return Err(err),
        }
    }

    Err(anyhow::Error::new(MemoryError::NoProvider {
        reasons: reasons.join("; "),
    }))
}

/// Deterministic embedding provider for offline tests. Hashes word prefixes
/// into a fixed number of buckets so related words ("fox"/"foxes") land in
/// overlapping dimensions, then L2-normalizes.
#[derive(Clone)]
pub struct StubProvider {
    dims: usize,
}

impl StubProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(4) }
    }

    pub fn model(&self) -> &str {
        "stub-embed"
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            let min_len = 3.min(word.len());
            for (i, c) in word.char_indices() {
                let end = i + c.len_utf8();
                if end < min_len {
                    continue;
                }
                let bucket = (fnv1a(&word[..end]) as usize) % self.dims;
                v[bucket] += 1.0;
            }
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in s.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
