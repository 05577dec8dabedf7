use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level configuration for a memory index.
///
/// Every section has serde defaults so a partial TOML file (or none at all)
/// yields a working configuration. Environment variables override the file
/// for deployment-sensitive values.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MnemosConfig {
    pub storage: StorageConfig,
    pub sources: SourcesConfig,
    pub chunking: ChunkingConfig,
    pub query: QueryConfig,
    pub provider: ProviderConfig,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Index database path. Empty means `<workspace>/.mnemos/index.db`.
    pub db_path: String,
    /// Whether to attempt the vector virtual table at all.
    pub vector_enabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SourcesConfig {
    /// Index workspace memory files (MEMORY.md, memory.md, memory/**.md).
    pub memory: bool,
    /// Index the agent's session transcripts.
    pub sessions: bool,
    /// Additional Markdown files or directories outside the usual layout.
    pub extra_paths: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub tokens: usize,
    pub overlap: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct QueryConfig {
    pub max_results: usize,
    pub min_score: f32,
    /// Blend BM25 keyword scores with vector scores.
    pub hybrid: bool,
    pub vector_weight: f32,
    pub text_weight: f32,
    /// Candidate pool per list = max_results * candidate_multiplier, capped at 200.
    pub candidate_multiplier: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ProviderConfig {
    /// `auto`, `local`, `openai`, or `gemini`.
    pub primary: String,
    /// Provider to fall back to when the primary fails.
    pub fallback: Option<String>,
    pub local: LocalProviderConfig,
    pub openai: RemoteProviderConfig,
    pub gemini: RemoteProviderConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LocalProviderConfig {
    /// Path to the ONNX model file. Auto-selection only picks the local
    /// provider when this resolves to an existing file.
    pub model_path: String,
    /// Path to the matching tokenizer.json.
    pub tokenizer_path: String,
    /// Model identifier recorded in the index fingerprint.
    pub model: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RemoteProviderConfig {
    /// API base URL; empty uses the provider's canonical endpoint.
    pub base_url: String,
    /// Embedding model; empty uses the provider's default model.
    pub model: String,
    /// API key; when unset the provider reads its environment variable.
    pub api_key: Option<String>,
    /// Extra request headers. Authorization-like headers are excluded from
    /// the provider key so rotating credentials never invalidates the cache.
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BatchConfig {
    /// Use the provider-side batch job API where the provider supports it.
    pub enabled: bool,
    /// Wait for submitted batch jobs inside the sync that created them.
    pub wait: bool,
    /// Cap on simultaneously running batch jobs.
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub timeout_minutes: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    /// Kick a background sync when a search finds the index dirty.
    pub on_search: bool,
    /// Warm the index once per session key.
    pub on_session_start: bool,
    /// Watch memory files and sync on change.
    pub watch: bool,
    pub watch_debounce_ms: u64,
    /// Repeating sync interval; 0 disables.
    pub interval_minutes: u64,
    /// Transcript growth in bytes before a session file is marked dirty.
    /// 0 means any growth triggers.
    pub session_delta_bytes: u64,
    /// Appended transcript lines before a session file is marked dirty.
    /// 0 disables message counting.
    pub session_delta_messages: u64,
}

impl Default for MnemosConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            sources: SourcesConfig::default(),
            chunking: ChunkingConfig::default(),
            query: QueryConfig::default(),
            provider: ProviderConfig::default(),
            batch: BatchConfig::default(),
            cache: CacheConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: String::new(),
            vector_enabled: true,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            memory: true,
            sessions: true,
            extra_paths: Vec::new(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            tokens: 512,
            overlap: 64,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_results: 6,
            min_score: 0.0,
            hybrid: true,
            vector_weight: 0.7,
            text_weight: 0.3,
            candidate_multiplier: 3.0,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            primary: "auto".into(),
            fallback: None,
            local: LocalProviderConfig::default(),
            openai: RemoteProviderConfig::default(),
            gemini: RemoteProviderConfig::default(),
        }
    }
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        let models_dir = default_mnemos_dir().join("models");
        Self {
            model_path: models_dir.join("model.onnx").to_string_lossy().into_owned(),
            tokenizer_path: models_dir
                .join("tokenizer.json")
                .to_string_lossy()
                .into_owned(),
            model: "all-MiniLM-L6-v2".into(),
        }
    }
}

impl Default for RemoteProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            model: String::new(),
            api_key: None,
            headers: BTreeMap::new(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wait: true,
            concurrency: 2,
            poll_interval_ms: 2000,
            timeout_minutes: 30,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 50_000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            on_search: true,
            on_session_start: true,
            watch: true,
            watch_debounce_ms: 1500,
            interval_minutes: 0,
            session_delta_bytes: 8192,
            session_delta_messages: 20,
        }
    }
}

/// Returns `~/.mnemos/`
pub fn default_mnemos_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".mnemos")
}

/// Returns the default config file path: `~/.mnemos/config.toml`
pub fn default_config_path() -> PathBuf {
    default_mnemos_dir().join("config.toml")
}

impl MnemosConfig {
    /// Load config from the default TOML file, then apply env overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MnemosConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment overrides (MNEMOS_DB, OPENAI_API_KEY, GEMINI_API_KEY).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MNEMOS_DB") {
            self.storage.db_path = val;
        }
        if self.provider.openai.api_key.is_none() {
            if let Ok(val) = std::env::var("OPENAI_API_KEY") {
                self.provider.openai.api_key = Some(val);
            }
        }
        if self.provider.gemini.api_key.is_none() {
            if let Ok(val) = std::env::var("GEMINI_API_KEY") {
                self.provider.gemini.api_key = Some(val);
            }
        }
    }

    /// Resolve the index database path for a given workspace.
    pub fn resolved_db_path(&self, workspace: &Path) -> PathBuf {
        if self.storage.db_path.is_empty() {
            workspace.join(".mnemos").join("index.db")
        } else {
            expand_tilde(&self.storage.db_path)
        }
    }

    /// Stable digest of the settings that shape index identity. Two managers
    /// for the same agent and workspace share state only when this matches.
    pub fn settings_fingerprint(&self) -> String {
        let encoded = serde_json::to_string(self).unwrap_or_default();
        let digest = crate::chunk::hash_text(&encoded);
        digest[..16].to_string()
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}
