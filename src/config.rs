//! TOML configuration.
//!
//! Everything except credentials lives in the config file. API keys are read
//! from the environment when the clients are built:
//!
//! | Variable | Used by |
//! |----------|---------|
//! | `PINECONE_API_KEY` | Pinecone embedding provider and vector index |
//! | `PINECONE_INDEX_NAME` | overrides `[index].name` |
//! | `OPENAI_API_KEY` | OpenAI embedding provider and generator |

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chunk::ChunkProfile;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub assistants: Vec<AssistantSeed>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Profile for directly submitted text.
    #[serde(default = "default_text_profile")]
    pub text: ChunkProfile,
    /// Profile for loader-extracted text (PDF, websites).
    #[serde(default = "default_loader_profile")]
    pub loader: ChunkProfile,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            text: ChunkProfile::TEXT,
            loader: ChunkProfile::LOADER,
        }
    }
}

fn default_text_profile() -> ChunkProfile {
    ChunkProfile::TEXT
}
fn default_loader_profile() -> ChunkProfile {
    ChunkProfile::LOADER
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"pinecone"` or `"openai"`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL for OpenAI-compatible endpoints.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            url: None,
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

fn default_embedding_provider() -> String {
    "pinecone".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_batch_delay_ms() -> u64 {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `"pinecone"` or `"memory"`.
    #[serde(default = "default_index_provider")]
    pub provider: String,
    /// Pinecone index name (overridden by `PINECONE_INDEX_NAME`).
    #[serde(default)]
    pub name: Option<String>,
    /// Data-plane host; resolved from the control plane when absent.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            provider: default_index_provider(),
            name: None,
            host: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl IndexConfig {
    pub fn resolved_name(&self) -> Option<String> {
        std::env::var("PINECONE_INDEX_NAME")
            .ok()
            .filter(|n| !n.is_empty())
            .or_else(|| self.name.clone())
    }
}

fn default_index_provider() -> String {
    "pinecone".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_generation_url")]
    pub url: String,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_generation_model(),
            url: default_generation_url(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_generation_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    120
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
    "127.0.0.1:7341".to_string()
}
fn default_max_upload_bytes() -> usize {
    2 * 1024 * 1024
}

/// An assistant created or refreshed by `docent init`.
#[derive(Debug, Deserialize, Clone)]
pub struct AssistantSeed {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    for (name, profile) in [
        ("chunking.text", &config.chunking.text),
        ("chunking.loader", &config.chunking.loader),
    ] {
        if profile.max_chunk_size == 0 {
            anyhow::bail!("{}.max_chunk_size must be > 0", name);
        }
        if profile.overlap >= profile.max_chunk_size {
            anyhow::bail!("{}.overlap must be smaller than max_chunk_size", name);
        }
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "pinecone" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be pinecone or openai.",
            other
        ),
    }

    match config.index.provider.as_str() {
        "memory" => {}
        "pinecone" => {
            if config.index.host.is_none() && config.index.resolved_name().is_none() {
                anyhow::bail!(
                    "index.name (or PINECONE_INDEX_NAME) or index.host is required for the pinecone index"
                );
            }
        }
        other => anyhow::bail!(
            "Unknown index provider: '{}'. Must be pinecone or memory.",
            other
        ),
    }

    if config.server.max_upload_bytes == 0 {
        anyhow::bail!("server.max_upload_bytes must be > 0");
    }

    Ok(())
}
