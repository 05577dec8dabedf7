//! Local ONNX Runtime embedding provider.
//!
//! The model and tokenizer are validated at construction but only loaded on
//! the first embedding call, so opening a manager stays cheap when the index
//! is already warm. Inference runs under `spawn_blocking`; token states are
//! pooled with [`masked_mean`], sanitized (non-finite values become zero),
//! and L2 normalized.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;
use tokio::sync::OnceCell;

use crate::config::LocalProviderConfig;
use crate::error::MemoryError;

/// Sequence length cap for sentence-transformer style models.
const MAX_SEQ_LEN: usize = 256;

/// Hidden-state output names emitted by common ONNX exports, in preference
/// order. Unknown exports fall back to the first output.
const HIDDEN_STATE_OUTPUTS: [&str; 2] = ["token_embeddings", "last_hidden_state"];

#[derive(Clone)]
pub struct LocalProvider {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    model_path: PathBuf,
    tokenizer_path: PathBuf,
    model_name: String,
    engine: OnceCell<Arc<LocalEngine>>,
}

struct LocalEngine {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

// Safety: Tokenizer is Send+Sync. Session is behind a Mutex which guarantees
// exclusive access during run().
unsafe impl Send for LocalEngine {}
unsafe impl Sync for LocalEngine {}

impl LocalProvider {
    /// Validate the configured paths without loading anything.
    pub fn new(cfg: &LocalProviderConfig) -> Result<Self> {
        let model_path = crate::config::expand_tilde(&cfg.model_path);
        let tokenizer_path = crate::config::expand_tilde(&cfg.tokenizer_path);

        if !model_path.is_file() || !tokenizer_path.is_file() {
            let details = format!(
                "expected model files:\n  model:     {}\n  tokenizer: {}\n\
                 Place an ONNX sentence-embedding model and its tokenizer.json \
                 at these paths (or point provider.local at them), or configure \
                 a remote provider instead.",
                model_path.display(),
                tokenizer_path.display()
            );
            return Err(MemoryError::ProviderSetup { details }.into());
        }

        Ok(Self {
            inner: Arc::new(LocalInner {
                model_path,
                tokenizer_path,
                model_name: cfg.model.clone(),
                engine: OnceCell::new(),
            }),
        })
    }

    pub fn model(&self) -> &str {
        &self.inner.model_name
    }

    async fn engine(&self) -> Result<Arc<LocalEngine>> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .engine
            .get_or_try_init(|| async move {
                let loaded = tokio::task::spawn_blocking(move || LocalEngine::load(&inner))
                    .await
                    .context("local embedding load task failed")??;
                Ok::<_, anyhow::Error>(Arc::new(loaded))
            })
            .await
            .cloned()
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("local embedding produced no output"))
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let engine = self.engine().await?;
        let owned: Vec<String> = texts.to_vec();
        tokio::task::spawn_blocking(move || engine.embed_batch(&owned))
            .await
            .context("local embedding task failed")?
    }
}

impl LocalEngine {
    fn load(inner: &LocalInner) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .with_intra_threads(4)
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .commit_from_file(&inner.model_path)
            .map_err(|e| MemoryError::ProviderSetup {
                details: format!(
                    "failed to load ONNX model at {}: {e}\n\
                     The file may be corrupt or built for an incompatible runtime.",
                    inner.model_path.display()
                ),
            })?;

        tracing::info!(model = %inner.model_path.display(), "local embedding model loaded");

        let mut tokenizer = Tokenizer::from_file(&inner.tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;

        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;

        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
        })
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;

        let rows = encodings.len();
        let cols = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);

        // Row-major i64 buffers, the layout the model expects.
        let flatten = |pick: fn(&tokenizers::Encoding) -> &[u32]| -> Vec<i64> {
            encodings
                .iter()
                .flat_map(|e| pick(e).iter().map(|&v| v as i64))
                .collect()
        };
        let attention = flatten(|e| e.get_attention_mask());

        let dims = vec![rows as i64, cols as i64];
        let as_tensor =
            |values: Vec<i64>| Tensor::from_array((dims.clone(), values.into_boxed_slice()));

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;

        let outputs = session.run(ort::inputs! {
            "input_ids" => as_tensor(flatten(|e| e.get_ids()))?,
            "attention_mask" => as_tensor(attention.clone())?,
            // single-segment input
            "token_type_ids" => as_tensor(vec![0; rows * cols])?,
        })?;

        let hidden_states = HIDDEN_STATE_OUTPUTS
            .into_iter()
            .find_map(|name| outputs.get(name))
            .unwrap_or_else(|| &outputs[0]);
        let (shape, values) = hidden_states
            .try_extract_tensor::<f32>()
            .context("failed to extract hidden states")?;
        let shape: &[i64] = &shape;

        masked_mean(values, shape, &attention, cols)
    }
}

/// Attention-masked mean pooling: one sentence vector per row, averaging
/// only the token states the mask keeps, then sanitized and normalized.
///
/// `shape` is `[rows, seq, hidden]` as reported by the model. `attention`
/// is the flattened input mask with `padded_cols` entries per row — the
/// model may emit a `seq` shorter than the padded input.
fn masked_mean(
    values: &[f32],
    shape: &[i64],
    attention: &[i64],
    padded_cols: usize,
) -> Result<Vec<Vec<f32>>> {
    anyhow::ensure!(
        shape.len() == 3,
        "unexpected hidden-state shape: {shape:?}, expected [batch, seq, hidden]"
    );
    let (rows, seq, hidden) = (shape[0] as usize, shape[1] as usize, shape[2] as usize);

    let mut pooled = Vec::with_capacity(rows);
    for row in 0..rows {
        let mut acc = vec![0.0f32; hidden];
        let mut kept = 0.0f32;
        for pos in 0..seq.min(padded_cols) {
            if attention[row * padded_cols + pos] == 0 {
                continue;
            }
            let token = &values[(row * seq + pos) * hidden..][..hidden];
            for (a, v) in acc.iter_mut().zip(token) {
                *a += v;
            }
            kept += 1.0;
        }
        if kept > 0.0 {
            for a in &mut acc {
                *a /= kept;
            }
        }
        pooled.push(sanitize_and_normalize(&acc));
    }
    Ok(pooled)
}

/// Zero out non-finite values, then L2-normalize. A vector that sanitizes to
/// all zeros stays zero (callers treat that as "no usable embedding").
fn sanitize_and_normalize(v: &[f32]) -> Vec<f32> {
    let cleaned: Vec<f32> = v
        .iter()
        .map(|x| if x.is_finite() { *x } else { 0.0 })
        .collect();
    let norm: f32 = cleaned.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        cleaned.iter().map(|x| x / norm).collect()
    } else {
        cleaned
    }
}
