//! TOML configuration.
//!
//! Every section is optional; a missing config file yields [`Config::default`].
//! Validation happens in [`load_config`] so that `serve` fails at startup
//! rather than deep inside a provider call.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable holding the OpenAI API key.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default = "default_vectorstores_dir")]
    pub vectorstores_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            vectorstores_dir: default_vectorstores_dir(),
        }
    }
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("./uploads")
}
fn default_vectorstores_dir() -> PathBuf {
    PathBuf::from("./vectorstores")
}

impl StorageConfig {
    /// Directory holding the serialized index for one session.
    pub fn index_dir(&self, session_id: &str) -> PathBuf {
        self.vectorstores_dir.join(session_id)
    }

    /// Durable path of an uploaded file: `{session_id}_{filename}`.
    pub fn upload_path(&self, session_id: &str, filename: &str) -> PathBuf {
        self.uploads_dir.join(format!("{}_{}", session_id, filename))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_top_k() -> usize {
    3
}
fn default_preview_chars() -> usize {
    150
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            url: None,
            temperature: 0.0,
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_llm_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// When false the guard is constructed but no route requires it.
    #[serde(default)]
    pub enforce: bool,
    #[serde(default = "default_auth_provider")]
    pub provider: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_upload_role")]
    pub upload_role: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enforce: false,
            provider: default_auth_provider(),
            project_id: None,
            secret: None,
            upload_role: default_upload_role(),
        }
    }
}

fn default_auth_provider() -> String {
    "firebase".to_string()
}
fn default_upload_role() -> String {
    "teacher".to_string()
}

impl Config {
    /// Whether any configured provider talks to the OpenAI API.
    pub fn needs_openai_key(&self) -> bool {
        self.embedding.provider == "openai" || self.llm.provider == "openai"
    }
}

/// Load and validate a config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    validate(&config)?;
    Ok(config)
}

/// Range and consistency checks shared by file and programmatic configs.
pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }

    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
    }

    if config.indexing.workers == 0 {
        anyhow::bail!("indexing.workers must be >= 1");
    }
    if config.indexing.queue_capacity == 0 {
        anyhow::bail!("indexing.queue_capacity must be >= 1");
    }

    if config.auth.enforce {
        match config.auth.provider.as_str() {
            "firebase" => {
                if config.auth.project_id.is_none() {
                    anyhow::bail!("auth.project_id is required for the firebase provider");
                }
            }
            "hs256" => {
                if config.auth.secret.as_deref().map_or(true, str::is_empty) {
                    anyhow::bail!("auth.secret is required for the hs256 provider");
                }
            }
            other => anyhow::bail!(
                "Unknown auth provider: '{}'. Must be firebase or hs256.",
                other
            ),
        }
    }

    Ok(())
}

/// Fail fast when an OpenAI-backed provider is configured without a key.
pub fn require_api_key(config: &Config) -> Result<()> {
    if !config.needs_openai_key() {
        return Ok(());
    }
    match std::env::var(OPENAI_API_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => Ok(()),
        _ => anyhow::bail!(
            "{} environment variable not set (required by the openai provider)",
            OPENAI_API_KEY_ENV
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_pipeline() {
        let config = Config::default();
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.retrieval.preview_chars, 150);
        assert_eq!(config.llm.model, "gpt-3.5-turbo");
        assert_eq!(config.llm.temperature, 0.0);
        assert!(!config.auth.enforce);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
[server]
bind = "127.0.0.1:9999"

[retrieval]
top_k = 5
"#,
        )
        .unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:9999");
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.storage.uploads_dir, PathBuf::from("./uploads"));
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let mut config = Config::default();
        config.chunking.chunk_overlap = 1000;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn unknown_provider_rejected() {
        let mut config = Config::default();
        config.embedding.provider = "cohere".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn enforced_hs256_needs_secret() {
        let mut config = Config::default();
        config.auth.enforce = true;
        config.auth.provider = "hs256".to_string();
        assert!(validate(&config).is_err());
        config.auth.secret = Some("s3cret".to_string());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn disabled_providers_need_no_key() {
        let mut config = Config::default();
        config.embedding.provider = "disabled".to_string();
        config.llm.provider = "disabled".to_string();
        assert!(require_api_key(&config).is_ok());
    }

    #[test]
    fn storage_paths() {
        let storage = StorageConfig::default();
        assert_eq!(
            storage.upload_path("abc", "doc.pdf"),
            PathBuf::from("./uploads/abc_doc.pdf")
        );
        assert_eq!(storage.index_dir("abc"), PathBuf::from("./vectorstores/abc"));
    }
}
