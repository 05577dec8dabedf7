//! Remote embedding providers over HTTP.
//!
//! One client type serves both OpenAI-compatible and Gemini-compatible
//! deployments; the [`RemoteKind`] tag selects endpoint shapes, auth header,
//! and response parsing. Both kinds also expose the asynchronous batch-job
//! surface the orchestrator uses: upload a newline-delimited request file,
//! create a job, poll it, download the result file, and map rows back by
//! `custom_id`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::RemoteProviderConfig;
use crate::error::MemoryError;

const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const OPENAI_DEFAULT_MODEL: &str = "text-embedding-3-small";
const GEMINI_DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_DEFAULT_MODEL: &str = "gemini-embedding-001";

/// Marker included in errors when a deployment has no batch endpoint; the
/// orchestrator treats it as an immediate batch-mode disable.
pub const BATCH_ENDPOINT_UNAVAILABLE: &str = "batch endpoint not available";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    OpenAi,
    Gemini,
}

#[derive(Clone)]
pub struct RemoteProvider {
    kind: RemoteKind,
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct GeminiBatchResponse {
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

/// State of a provider-side batch job.
#[derive(Debug, Clone)]
pub enum BatchJobState {
    Running,
    Completed { output_file_id: String },
    Failed { message: String },
}

impl RemoteProvider {
    pub fn new(kind: RemoteKind, cfg: &RemoteProviderConfig) -> Result<Self> {
        let (default_base, default_model, env_hint, provider_name) = match kind {
            RemoteKind::OpenAi => (
                OPENAI_DEFAULT_BASE_URL,
                OPENAI_DEFAULT_MODEL,
                "OPENAI_API_KEY",
                "openai",
            ),
            RemoteKind::Gemini => (
                GEMINI_DEFAULT_BASE_URL,
                GEMINI_DEFAULT_MODEL,
                "GEMINI_API_KEY",
                "gemini",
            ),
        };

        let api_key = cfg
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .ok_or_else(|| MemoryError::MissingApiKey {
                provider: provider_name.into(),
                env_hint: env_hint.into(),
            })?;

        let base_url = if cfg.base_url.trim().is_empty() {
            default_base.to_string()
        } else {
            cfg.base_url.trim_end_matches('/').to_string()
        };
        let model = if cfg.model.trim().is_empty() {
            default_model.to_string()
        } else {
            cfg.model.clone()
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build embedding HTTP client")?;

        Ok(Self {
            kind,
            client,
            base_url,
            model,
            api_key,
            headers: cfg.headers.clone(),
        })
    }

    pub fn kind(&self) -> RemoteKind {
        self.kind
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);
        req = match self.kind {
            RemoteKind::OpenAi => req.header("Authorization", format!("Bearer {}", self.api_key)),
            RemoteKind::Gemini => req.header("x-goog-api-key", &self.api_key),
        };
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }
        req
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("embedding response contained no query vector"))
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match self.kind {
            RemoteKind::OpenAi => self.embed_batch_openai(texts).await,
            RemoteKind::Gemini => self.embed_batch_gemini(texts).await,
        }
    }

    async fn embed_batch_openai(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let raw = self.post_json(&url, &body).await?;
        let mut parsed: OpenAiEmbeddingResponse =
            serde_json::from_str(&raw).context("failed to parse embeddings response")?;
        if parsed.data.len() != texts.len() {
            anyhow::bail!(
                "embeddings response count mismatch: sent {}, got {}",
                texts.len(),
                parsed.data.len()
            );
        }
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn embed_batch_gemini(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!(
            "{}/models/{}:batchEmbedContents",
            self.base_url, self.model
        );
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|t| {
                serde_json::json!({
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [ { "text": t } ] },
                })
            })
            .collect();
        let body = serde_json::json!({ "requests": requests });
        let raw = self.post_json(&url, &body).await?;
        let parsed: GeminiBatchResponse =
            serde_json::from_str(&raw).context("failed to parse embeddings response")?;
        if parsed.embeddings.len() != texts.len() {
            anyhow::bail!(
                "embeddings response count mismatch: sent {}, got {}",
                texts.len(),
                parsed.embeddings.len()
            );
        }
        Ok(parsed.embeddings.into_iter().map(|e| e.values).collect())
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<String> {
        let resp = self
            .request(reqwest::Method::POST, url.to_string())
            .json(body)
            .send()
            .await
            .with_context(|| format!("embedding request to {url} failed"))?;
        Self::read_body(resp).await
    }

    /// Read a response body, converting HTTP errors into messages the retry
    /// classifier understands (status code plus a `5xx` tag for server-side
    /// failures).
    async fn read_body(resp: reqwest::Response) -> Result<String> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.is_success() {
            return Ok(body);
        }
        let snippet: String = body.chars().take(300).collect();
        if status.is_server_error() {
            anyhow::bail!("embeddings request failed (HTTP {status}, 5xx): {snippet}")
        }
        anyhow::bail!("embeddings request failed (HTTP {status}): {snippet}")
    }

    // ── Provider-side batch jobs ────────────────────────────────────────

    /// One request line for the batch input file, tagged with `custom_id`.
    pub fn batch_request_line(&self, custom_id: &str, text: &str) -> serde_json::Value {
        match self.kind {
            RemoteKind::OpenAi => serde_json::json!({
                "custom_id": custom_id,
                "method": "POST",
                "url": "/v1/embeddings",
                "body": { "model": self.model, "input": text },
            }),
            RemoteKind::Gemini => serde_json::json!({
                "custom_id": custom_id,
                "request": {
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [ { "text": text } ] },
                },
            }),
        }
    }

    /// Upload a newline-delimited request file; returns the file id.
    pub async fn upload_batch_input(&self, jsonl: String) -> Result<String> {
        let url = format!("{}/files", self.base_url);
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part(
                "file",
                reqwest::multipart::Part::text(jsonl)
                    .file_name("embeddings.jsonl")
                    .mime_str("application/jsonl")?,
            );
        let resp = self
            .request(reqwest::Method::POST, url)
            .multipart(form)
            .send()
            .await
            .context("batch input upload failed")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("{BATCH_ENDPOINT_UNAVAILABLE} (upload returned 404)");
        }
        let body = Self::read_body(resp).await?;
        extract_id(&body, &["id", "name"])
            .ok_or_else(|| anyhow::anyhow!("batch upload response missing file id: {body}"))
    }

    /// Create a batch job over an uploaded input file; returns the job id.
    pub async fn create_batch_job(&self, input_file_id: &str) -> Result<String> {
        let (url, body) = match self.kind {
            RemoteKind::OpenAi => (
                format!("{}/batches", self.base_url),
                serde_json::json!({
                    "input_file_id": input_file_id,
                    "endpoint": "/v1/embeddings",
                    "completion_window": "24h",
                }),
            ),
            RemoteKind::Gemini => (
                format!("{}/batches", self.base_url),
                serde_json::json!({
                    "model": format!("models/{}", self.model),
                    "input_file": input_file_id,
                }),
            ),
        };
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(&body)
            .send()
            .await
            .context("batch job creation failed")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("{BATCH_ENDPOINT_UNAVAILABLE} (create returned 404)");
        }
        let body = Self::read_body(resp).await?;
        extract_id(&body, &["id", "name"])
            .ok_or_else(|| anyhow::anyhow!("batch create response missing job id: {body}"))
    }

    /// Poll a batch job's state.
    pub async fn poll_batch_job(&self, job_id: &str) -> Result<BatchJobState> {
        let url = format!("{}/batches/{}", self.base_url, job_id);
        let resp = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .context("batch job poll failed")?;
        let body = Self::read_body(resp).await?;
        let value: serde_json::Value =
            serde_json::from_str(&body).context("failed to parse batch job status")?;

        let status = value
            .get("status")
            .or_else(|| value.get("state"))
            .and_then(|s| s.as_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        if status.contains("complet") || status.contains("succeed") {
            let output = value
                .get("output_file_id")
                .or_else(|| value.get("output_file"))
                .and_then(|s| s.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    anyhow::anyhow!("completed batch job {job_id} has no output file")
                })?;
            Ok(BatchJobState::Completed {
                output_file_id: output,
            })
        } else if status.contains("fail") || status.contains("cancel") || status.contains("expire") {
            let message = value
                .get("error")
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("batch job ended with status {status}"));
            Ok(BatchJobState::Failed { message })
        } else {
            Ok(BatchJobState::Running)
        }
    }

    /// Download the result file of a completed batch job.
    pub async fn download_batch_output(&self, output_file_id: &str) -> Result<String> {
        let url = format!("{}/files/{}/content", self.base_url, output_file_id);
        let resp = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .context("batch output download failed")?;
        Self::read_body(resp).await
    }

    /// Parse one line of a batch result file into `(custom_id, embedding)`.
    /// Malformed or unrecognized lines yield `None` and are skipped.
    pub fn parse_batch_output_line(&self, line: &str) -> Option<(String, Vec<f32>)> {
        let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
        let custom_id = value
            .get("custom_id")
            .or_else(|| value.get("key"))
            .and_then(|s| s.as_str())?
            .to_string();
        let response = value.get("response")?;

        // Minimal contract: response.embedding, or the wrapped shapes each
        // provider family actually returns.
        let embedding = response
            .get("embedding")
            .and_then(parse_float_array)
            .or_else(|| {
                response
                    .get("body")
                    .and_then(|b| b.get("data"))
                    .and_then(|d| d.get(0))
                    .and_then(|d| d.get("embedding"))
                    .and_then(parse_float_array)
            })
            .or_else(|| {
                response
                    .get("embedding")
                    .and_then(|e| e.get("values"))
                    .and_then(parse_float_array)
            })
            .or_else(|| {
                response
                    .get("embeddings")
                    .and_then(|e| e.get(0))
                    .and_then(|e| e.get("values"))
                    .and_then(parse_float_array)
            })?;

        Some((custom_id, embedding))
    }
}

fn parse_float_array(value: &serde_json::Value) -> Option<Vec<f32>> {
    let arr = value.as_array()?;
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        out.push(v.as_f64()? as f32);
    }
    Some(out)
}

fn extract_id(body: &str, keys: &[&str]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    keys.iter()
        .find_map(|k| value.get(k).and_then(|v| v.as_str()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteProviderConfig;

    fn openai_config() -> RemoteProviderConfig {
        RemoteProviderConfig {
            base_url: String::new(),
            model: String::new(),
            api_key: Some("sk-test".into()),
            headers: BTreeMap::new(),
        }
    }

    #[test]
    fn defaults_fill_empty_fields() {
        let p = RemoteProvider::new(RemoteKind::OpenAi, &openai_config()).unwrap();
        assert_eq!(p.base_url(), OPENAI_DEFAULT_BASE_URL);
        assert_eq!(p.model(), OPENAI_DEFAULT_MODEL);

        let g = RemoteProvider::new(
            RemoteKind::Gemini,
            &RemoteProviderConfig {
                api_key: Some("g-test".into()),
                ..RemoteProviderConfig::default()
            },
        )
        .unwrap();
        assert_eq!(g.base_url(), GEMINI_DEFAULT_BASE_URL);
        assert_eq!(g.model(), GEMINI_DEFAULT_MODEL);
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let cfg = RemoteProviderConfig {
            base_url: "https://proxy.example/v1/".into(),
            ..openai_config()
        };
        let p = RemoteProvider::new(RemoteKind::OpenAi, &cfg).unwrap();
        assert_eq!(p.base_url(), "https://proxy.example/v1");
    }

    #[test]
    fn missing_or_blank_key_is_rejected() {
        for key in [None, Some(String::new()), Some("   ".into())] {
            let cfg = RemoteProviderConfig {
                api_key: key,
                ..RemoteProviderConfig::default()
            };
            let err = RemoteProvider::new(RemoteKind::OpenAi, &cfg).unwrap_err();
            assert!(MemoryError::is_missing_key(&err));
        }
    }

    #[test]
    fn batch_request_line_shapes() {
        let p = RemoteProvider::new(RemoteKind::OpenAi, &openai_config()).unwrap();
        let line = p.batch_request_line("cid-1", "hello");
        assert_eq!(line["custom_id"], "cid-1");
        assert_eq!(line["url"], "/v1/embeddings");
        assert_eq!(line["body"]["input"], "hello");

        let g = RemoteProvider::new(
            RemoteKind::Gemini,
            &RemoteProviderConfig {
                api_key: Some("g".into()),
                ..RemoteProviderConfig::default()
            },
        )
        .unwrap();
        let line = g.batch_request_line("cid-2", "hola");
        assert_eq!(line["custom_id"], "cid-2");
        assert_eq!(line["request"]["content"]["parts"][0]["text"], "hola");
    }

    #[test]
    fn parse_batch_output_openai_shape() {
        let p = RemoteProvider::new(RemoteKind::OpenAi, &openai_config()).unwrap();

        // Flat contract shape
        let (id, emb) = p
            .parse_batch_output_line(r#"{"custom_id":"a","response":{"embedding":[0.1,0.2]}}"#)
            .unwrap();
        assert_eq!(id, "a");
        assert_eq!(emb.len(), 2);

        // Wrapped body shape
        let (id, emb) = p
            .parse_batch_output_line(
                r#"{"custom_id":"b","response":{"body":{"data":[{"embedding":[1.0,2.0,3.0]}]}}}"#,
            )
            .unwrap();
        assert_eq!(id, "b");
        assert_eq!(emb, vec![1.0, 2.0, 3.0]);

        assert!(p.parse_batch_output_line("not json").is_none());
        assert!(p.parse_batch_output_line(r#"{"custom_id":"c"}"#).is_none());
    }

    #[test]
    fn parse_batch_output_gemini_shape() {
        let g = RemoteProvider::new(
            RemoteKind::Gemini,
            &RemoteProviderConfig {
                api_key: Some("g".into()),
                ..RemoteProviderConfig::default()
            },
        )
        .unwrap();
        let (id, emb) = g
            .parse_batch_output_line(
                r#"{"key":"k1","response":{"embeddings":[{"values":[0.5,0.5]}]}}"#,
            )
            .unwrap();
        assert_eq!(id, "k1");
        assert_eq!(emb, vec![0.5, 0.5]);
    }
}
