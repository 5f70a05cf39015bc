//! Summarization provider abstraction and the chat-completions backend.
//!
//! Summarization is best-effort enrichment: the search engine attaches a
//! summary when this provider succeeds and degrades to raw hits when it
//! does not. Failure classification mirrors [`crate::embedding`]: 429/5xx
//! and network errors are transient, other 4xx are not.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::SummarizeConfig;
use crate::error::{Dependency, PipelineError, Result};
use crate::models::MetadataValue;

/// The slice of a hit that is worth sending to the language model.
///
/// The full document body is not forwarded; an excerpt plus metadata keeps
/// the prompt bounded no matter how large the indexed records are.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryDocument {
    pub title: String,
    pub excerpt: String,
    pub metadata: BTreeMap<String, MetadataValue>,
}

/// Produces a natural-language summary of candidate documents for a query.
#[async_trait]
pub trait SummarizationProvider: Send + Sync {
    async fn summarize(&self, query: &str, documents: &[SummaryDocument]) -> Result<String>;
}

/// A summarizer that always fails; used when summarization is not
/// configured. The search path treats this as "summary unavailable".
pub struct DisabledSummarizer;

#[async_trait]
impl SummarizationProvider for DisabledSummarizer {
    async fn summarize(&self, _query: &str, _documents: &[SummaryDocument]) -> Result<String> {
        Err(PipelineError::transient(
            Dependency::Summarization,
            "summarization provider is disabled",
        ))
    }
}

const SYSTEM_CONTEXT: &str = "You are a concise assistant that summarizes search results for \
analysts. Answer with a single paragraph and no preamble.";

/// Build the summarization prompt for a query and its candidate documents.
fn build_prompt(query: &str, documents: &[SummaryDocument]) -> String {
    let payload = serde_json::to_string(documents).unwrap_or_else(|_| "[]".to_string());
    format!(
        "You are a highly skilled AI trained in language comprehension and summarization. \
Understand the user's topic: '{query}' and summarize the following JSON documents into a \
concise abstract paragraph about the topic without exceeding 150 words. Retain the most \
important points so a reader understands the main findings without reading every document. \
If the documents do not contain information relevant to the topic, reply that there is \
insufficient information to summarize it. Start the paragraph with the topic itself, and \
avoid meta phrases such as 'the provided document'.\n\nJSON documents: {payload}"
    )
}

/// Summarization backed by an OpenAI-style chat-completions endpoint.
pub struct HttpSummarizer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpSummarizer {
    pub fn new(config: &SummarizeConfig) -> anyhow::Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("summarize.endpoint required for http provider"))?;
        let model = config.model.clone().unwrap_or_else(|| "gpt-4".to_string());

        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                anyhow::anyhow!("environment variable {var} not set (summarize.api_key_env)")
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
            api_key,
        })
    }
}

#[async_trait]
impl SummarizationProvider for HttpSummarizer {
    async fn summarize(&self, query: &str, documents: &[SummaryDocument]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_CONTEXT},
                {"role": "user", "content": build_prompt(query, documents)},
            ],
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            PipelineError::transient(Dependency::Summarization, format!("request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("HTTP {status}: {text}");
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(PipelineError::transient(Dependency::Summarization, message));
            }
            return Err(PipelineError::validation(format!(
                "summarization endpoint rejected request: {message}"
            )));
        }

        let json: Value = response.json().await.map_err(|e| {
            PipelineError::transient(
                Dependency::Summarization,
                format!("invalid response body: {e}"),
            )
        })?;
        parse_chat_response(&json)
    }
}

/// Extract `choices[0].message.content` from a chat-completions response.
fn parse_chat_response(json: &Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            PipelineError::transient(
                Dependency::Summarization,
                "response missing choices[0].message.content".to_string(),
            )
        })
}

/// Create the configured [`SummarizationProvider`].
pub fn create_summarizer(
    config: &SummarizeConfig,
) -> anyhow::Result<Box<dyn SummarizationProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledSummarizer)),
        "http" => Ok(Box::new(HttpSummarizer::new(config)?)),
        other => anyhow::bail!("Unknown summarization provider: {}", other),
    }
}
