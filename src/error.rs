//! Error kinds that callers need to tell apart.
//!
//! Everything else inside the crate travels as `anyhow::Error` with context,
//! matching how the rest of the codebase reports failures. These variants
//! exist where behaviour depends on the kind: the provider factory skips
//! missing-key providers in auto mode, the facade rejects confined paths,
//! and the reindex swap reports rollback separately from ordinary failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// A remote provider cannot be constructed because no API key was found
    /// in config or the environment.
    #[error("{provider} embedding provider has no API key configured; set it in the provider config or the {env_hint} environment variable")]
    MissingApiKey { provider: String, env_hint: String },

    /// No embedding provider could be constructed at all.
    #[error("no embedding provider available: {reasons}")]
    NoProvider { reasons: String },

    /// The local inference stack is missing or unloadable.
    #[error("local embedding setup failed:\n{details}")]
    ProviderSetup { details: String },

    /// The vector extension could not be registered within the load timeout.
    /// Stores opened afterwards degrade to keyword-only search.
    #[error("vector extension unavailable: {details}")]
    VectorExtension { details: String },

    /// `read_file` was asked for something outside the allowed roots.
    #[error("path not allowed: {reason}")]
    PathDenied { reason: String },

    /// The atomic reindex swap failed mid-rename; prior state was restored.
    #[error("index swap failed ({stage}): {details}")]
    SwapFailed { stage: String, details: String },
}

impl MemoryError {
    /// True when an `anyhow` chain bottoms out in a missing-API-key error.
    pub fn is_missing_key(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<MemoryError>(),
            Some(MemoryError::MissingApiKey { .. })
        )
    }
}
