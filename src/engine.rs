//! Query-side pipeline: validation, embedding, kNN retrieval, and the
//! best-effort summary.
//!
//! A query either fails validation up front or produces a ranked hit list;
//! summarization can only ever change the `summary` field of the response,
//! never the hits. Two identical queries against an unchanged index return
//! identical hit lists because the index ordering contract is total
//! (score, then fingerprint, then id) and is re-asserted here after
//! retrieval.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{SearchConfig, SummarizeConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{Dependency, PipelineError, Result};
use crate::index::{self, ScoredDocument, VectorIndexStore};
use crate::models::{SearchHit, SearchQuery, SearchResponse, SummaryOutcome};
use crate::retry::{self, RetryPolicy};
use crate::summarize::{SummarizationProvider, SummaryDocument};

pub struct SearchEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndexStore>,
    summarizer: Arc<dyn SummarizationProvider>,
    config: SearchConfig,
    summarize_top_n: usize,
    summarize_timeout: Duration,
    policy: RetryPolicy,
}

impl SearchEngine {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndexStore>,
        summarizer: Arc<dyn SummarizationProvider>,
        search: SearchConfig,
        summarize: &SummarizeConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            embedder,
            index,
            summarizer,
            config: search,
            summarize_top_n: summarize.top_n.max(1),
            summarize_timeout: Duration::from_secs(summarize.timeout_secs),
            policy,
        }
    }

    /// Run one search query end to end.
    ///
    /// Validation failures return immediately; embedding or index failures
    /// propagate after retries; summarization failures degrade to
    /// [`SummaryOutcome::Unavailable`] without touching the hits.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse> {
        let text = sanitize_query(&query.text);
        if text.is_empty() {
            return Err(PipelineError::validation("query text is empty"));
        }
        if query.k == 0 || query.k > self.config.max_k {
            return Err(PipelineError::validation(format!(
                "k must be between 1 and {}, got {}",
                self.config.max_k, query.k
            )));
        }

        let vector = retry::with_backoff(self.policy, Dependency::Embedding, || {
            self.embedder.embed(&text)
        })
        .await?;

        let scored = retry::with_backoff(self.policy, Dependency::Index, || {
            self.index.knn_search(&vector, query.k, &query.filters)
        })
        .await?;

        let mut scored: Vec<ScoredDocument> = scored
            .into_iter()
            .filter(|hit| hit.score >= self.config.min_score)
            .collect();
        index::order_hits(&mut scored);

        let hits: Vec<SearchHit> = scored
            .iter()
            .map(|hit| SearchHit {
                id: hit.document.id,
                score: hit.score,
                title: hit.document.title.clone(),
                snippet: snippet(&hit.document.body, self.config.snippet_chars),
                metadata: hit.document.metadata.clone(),
                fingerprint: hit.document.fingerprint,
            })
            .collect();

        // The summarizer gets the query as the user wrote it; sanitization
        // only protects the retrieval backend.
        let summary = if !query.summarize || hits.is_empty() {
            SummaryOutcome::Skipped
        } else {
            self.summarize(&query.text, &hits).await
        };

        tracing::debug!(
            query = %text,
            k = query.k,
            hits = hits.len(),
            "search completed"
        );
        Ok(SearchResponse { hits, summary })
    }

    /// Best-effort: a single attempt, never a retry loop on the query path,
    /// and any failure maps to `Unavailable`.
    async fn summarize(&self, text: &str, hits: &[SearchHit]) -> SummaryOutcome {
        let documents: Vec<SummaryDocument> = hits
            .iter()
            .take(self.summarize_top_n)
            .map(|hit| SummaryDocument {
                title: hit.title.clone(),
                excerpt: hit.snippet.clone(),
                metadata: hit.metadata.clone(),
            })
            .collect();

        let attempt = tokio::time::timeout(
            self.summarize_timeout,
            self.summarizer.summarize(text, &documents),
        );
        match attempt.await {
            Ok(Ok(summary)) => SummaryOutcome::Ready(summary),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "summarization unavailable, returning raw hits");
                SummaryOutcome::Unavailable
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.summarize_timeout.as_secs(),
                    "summarization timed out, returning raw hits"
                );
                SummaryOutcome::Unavailable
            }
        }
    }
}

/// Strip characters outside `[A-Za-z0-9_ ]` and collapse the remainder, so
/// query text cannot smuggle operator syntax into a backend query DSL.
fn sanitize_query(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn snippet(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let mut out: String = body.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
