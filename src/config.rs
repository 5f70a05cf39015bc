use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub summarize: SummarizeConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// `"memory"` or `"json"`.
    #[serde(default = "default_memory_backend")]
    pub backend: String,
    /// Records file for the json backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Only `"memory"` is built in; real vector stores plug in behind the
    /// `VectorIndexStore` trait.
    #[serde(default = "default_memory_backend")]
    pub backend: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            dims: default_dims(),
        }
    }
}

fn default_memory_backend() -> String {
    "memory".to_string()
}
fn default_dims() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"disabled"`, `"hash"` (local, deterministic), or `"http"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable holding the bearer token, if the endpoint
    /// requires one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            endpoint: None,
            model: None,
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizeConfig {
    /// `"disabled"` or `"http"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// At most this many hits are sent to the summarizer.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_summarize_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            endpoint: None,
            model: None,
            api_key_env: None,
            top_n: default_top_n(),
            timeout_secs: default_summarize_timeout_secs(),
        }
    }
}

impl SummarizeConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    /// Hits scoring below this are dropped after the kNN query. Unset
    /// means no cutoff: negative-similarity hits are still hits.
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_k: default_max_k(),
            min_score: default_min_score(),
            snippet_chars: default_snippet_chars(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Records reconciled concurrently inside a batch sync.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub call_timeout_secs: u64,
    /// When set, the orchestrator runs a scheduled full resync at this
    /// interval; otherwise syncs are on-demand only.
    #[serde(default)]
    pub auto_interval_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_ms(),
            call_timeout_secs: default_timeout_secs(),
            auto_interval_secs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_summarize_timeout_secs() -> u64 {
    45
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_top_n() -> usize {
    10
}
fn default_max_k() -> usize {
    50
}
fn default_min_score() -> f32 {
    f32::NEG_INFINITY
}
fn default_snippet_chars() -> usize {
    240
}
fn default_page_size() -> usize {
    100
}
fn default_concurrency() -> usize {
    8
}
fn default_bind() -> String {
    "127.0.0.1:7810".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.index.dims == 0 {
        anyhow::bail!("index.dims must be > 0");
    }

    if config.search.max_k == 0 {
        anyhow::bail!("search.max_k must be >= 1");
    }

    if config.sync.page_size == 0 || config.sync.concurrency == 0 {
        anyhow::bail!("sync.page_size and sync.concurrency must be >= 1");
    }

    if config.sync.max_attempts == 0 {
        anyhow::bail!("sync.max_attempts must be >= 1");
    }

    match config.source.backend.as_str() {
        "memory" => {}
        "json" => {
            if config.source.path.is_none() {
                anyhow::bail!("source.path is required when source.backend is 'json'");
            }
        }
        other => anyhow::bail!("Unknown source backend: '{}'. Must be memory or json.", other),
    }

    if config.index.backend != "memory" {
        anyhow::bail!(
            "Unknown index backend: '{}'. Only memory is built in.",
            config.index.backend
        );
    }

    if config.embedding.provider == "http" {
        if config.embedding.endpoint.is_none() {
            anyhow::bail!(
                "embedding.endpoint must be set when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be set when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    if config.summarize.is_enabled() && config.summarize.endpoint.is_none() {
        anyhow::bail!(
            "summarize.endpoint must be set when provider is '{}'",
            config.summarize.provider
        );
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "http" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, or http.",
            other
        ),
    }

    match config.summarize.provider.as_str() {
        "disabled" | "http" => {}
        other => anyhow::bail!(
            "Unknown summarization provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    Ok(config)
}
