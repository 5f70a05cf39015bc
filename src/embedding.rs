//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and three backends:
//! - **[`DisabledEmbedder`]** — returns errors; used when embeddings are
//!   not configured.
//! - **[`HashEmbedder`]** — deterministic local feature hashing; no
//!   external service, useful for local operation and tests.
//! - **[`HttpEmbedder`]** — calls an OpenAI-style `/v1/embeddings`
//!   endpoint.
//!
//! Providers perform a single attempt and classify the failure; the retry
//! layer ([`crate::retry`]) decides whether to re-issue the call:
//! - HTTP 429 (rate limited) and 5xx (server error) → transient
//! - network error or timeout → transient
//! - any other 4xx → not retried

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::EmbeddingConfig;
use crate::error::{Dependency, PipelineError, Result};

/// Converts text into a fixed-length numeric vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed one text. Fails transiently on provider outage or timeout.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// A no-op embedding provider that always returns errors.
pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingProvider for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(PipelineError::validation("embedding provider is disabled"))
    }
}

/// Deterministic local embedding via feature hashing.
///
/// Tokens are lowercased alphanumeric runs; each token adds a signed unit
/// to one bucket of the vector, which is then L2-normalized. Semantically
/// weak, but stable across processes, which is all local operation and
/// tests need: identical text always maps to an identical vector.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

fn fnv1a(token: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in token.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "feature-hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(token);
            let bucket = (hash % self.dims as u64) as usize;
            let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

/// Embedding provider backed by an OpenAI-style HTTP endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dims: usize,
    api_key: Option<String>,
}

impl HttpEmbedder {
    /// Build a provider from configuration.
    ///
    /// Reads the bearer token from the environment variable named by
    /// `api_key_env`, when one is configured.
    pub fn new(config: &EmbeddingConfig, dims: usize) -> anyhow::Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.endpoint required for http provider"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for http provider"))?;

        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                anyhow::anyhow!("environment variable {var} not set (embedding.api_key_env)")
            })?),
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            model,
            dims,
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            PipelineError::transient(Dependency::Embedding, format!("request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("HTTP {status}: {text}");
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(PipelineError::transient(Dependency::Embedding, message));
            }
            return Err(PipelineError::validation(format!(
                "embedding endpoint rejected request: {message}"
            )));
        }

        let json: Value = response.json().await.map_err(|e| {
            PipelineError::transient(Dependency::Embedding, format!("invalid response body: {e}"))
        })?;
        parse_embedding_response(&json)
    }
}

/// Extract the first `data[].embedding` array from an OpenAI-style
/// embeddings response.
fn parse_embedding_response(json: &Value) -> Result<Vec<f32>> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            PipelineError::transient(
                Dependency::Embedding,
                "response missing data[0].embedding".to_string(),
            )
        })?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Create the configured [`EmbeddingProvider`].
pub fn create_embedder(
    config: &EmbeddingConfig,
    dims: usize,
) -> anyhow::Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbedder)),
        "hash" => Ok(Box::new(HashEmbedder::new(dims))),
        "http" => Ok(Box::new(HttpEmbedder::new(config, dims)?)),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}
