//! Orchestrator tying the pipeline together behind one service facade.
//!
//! The [`Orchestrator`] owns the configured backends and exposes the four
//! operations the HTTP server and CLI share: fetch, sync, search, and
//! delete. Deleting goes through the source of truth first and then
//! reconciles, so the index never disagrees with the source about a
//! deletion for longer than one sync pass.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{create_embedder, EmbeddingProvider};
use crate::engine::SearchEngine;
use crate::error::{Dependency, PipelineError, Result};
use crate::index::MemoryIndex;
use crate::jobs::JobRegistry;
use crate::models::{InsightRecord, RecordId, SearchQuery, SearchResponse, SyncReport, SyncScope};
use crate::reconciler::Reconciler;
use crate::retry::{self, RetryPolicy};
use crate::source::{JsonFileSource, MemorySource, SourceRepository};
use crate::summarize::{create_summarizer, SummarizationProvider};
use crate::writer::IndexWriter;

pub struct Orchestrator {
    source: Arc<dyn SourceRepository>,
    reconciler: Reconciler,
    engine: SearchEngine,
    jobs: JobRegistry,
    policy: RetryPolicy,
    auto_interval: Option<Duration>,
}

impl Orchestrator {
    /// Build the full pipeline from configuration.
    pub async fn from_config(config: &Config) -> anyhow::Result<Arc<Self>> {
        let source: Arc<dyn SourceRepository> = match config.source.backend.as_str() {
            "json" => {
                let path = config
                    .source
                    .path
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("source.path is required for json backend"))?;
                Arc::new(JsonFileSource::load(path).await.map_err(|e| {
                    anyhow::anyhow!("failed to load source records: {e}")
                })?)
            }
            _ => Arc::new(MemorySource::new()),
        };
        Self::with_source(config, source)
    }

    /// Build the pipeline around an existing source repository. Used by
    /// `from_config` and by callers that bring their own backend.
    pub fn with_source(
        config: &Config,
        source: Arc<dyn SourceRepository>,
    ) -> anyhow::Result<Arc<Self>> {
        let index = Arc::new(MemoryIndex::new());
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::from(create_embedder(&config.embedding, config.index.dims)?);
        let summarizer: Arc<dyn SummarizationProvider> =
            Arc::from(create_summarizer(&config.summarize)?);

        let policy = RetryPolicy::new(
            config.sync.max_attempts,
            Duration::from_millis(config.sync.backoff_base_ms),
            Duration::from_secs(config.sync.call_timeout_secs),
        );

        let writer = IndexWriter::new(embedder.clone(), index.clone(), policy);
        let reconciler = Reconciler::new(source.clone(), index.clone(), writer, &config.sync);
        let engine = SearchEngine::new(
            embedder,
            index,
            summarizer,
            config.search.clone(),
            &config.summarize,
            policy,
        );

        Ok(Arc::new(Self {
            source,
            reconciler,
            engine,
            jobs: JobRegistry::default(),
            policy,
            auto_interval: config.sync.auto_interval_secs.map(Duration::from_secs),
        }))
    }

    /// Current state of one record from the source of truth.
    ///
    /// Tombstoned records read as [`PipelineError::NotFound`]; the flag is
    /// an internal reconciliation detail, not part of the read surface.
    pub async fn fetch(&self, id: RecordId) -> Result<InsightRecord> {
        let record = retry::with_backoff(self.policy, Dependency::Source, || {
            self.source.get_by_id(id)
        })
        .await?;
        match record {
            Some(record) if !record.deleted => Ok(record),
            _ => Err(PipelineError::NotFound(id)),
        }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse> {
        self.engine.search(query).await
    }

    /// Run a sync to completion and return its report.
    pub async fn sync(&self, scope: SyncScope) -> Result<SyncReport> {
        self.reconciler.sync(scope).await
    }

    /// Tombstone a record in the source and converge the index.
    ///
    /// Idempotent: deleting an id the source never held is not an error,
    /// and the reconciliation pass still runs so a stale indexed document
    /// under that id is removed either way.
    pub async fn delete(&self, id: RecordId) -> Result<SyncReport> {
        let marked = retry::with_backoff(self.policy, Dependency::Source, || {
            self.source.mark_deleted(id)
        })
        .await;
        match marked {
            Ok(()) | Err(PipelineError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.sync(SyncScope::One(id)).await
    }

    /// Start a background sync and return the job id to poll.
    pub fn start_sync_job(self: &Arc<Self>, scope: SyncScope) -> Uuid {
        let job_id = self.jobs.create(scope_label(&scope));
        let service = self.clone();
        tokio::spawn(async move {
            match service.sync(scope).await {
                Ok(report) => service.jobs.complete(job_id, report),
                Err(err) => {
                    tracing::error!(%job_id, error = %err, "sync job failed");
                    service.jobs.fail(job_id, err.to_string());
                }
            }
        });
        job_id
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    /// Spawn the periodic full-resync loop, when one is configured.
    pub fn spawn_scheduler(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.auto_interval?;
        let service = self.clone();
        Some(tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "scheduled resync enabled");
            loop {
                tokio::time::sleep(interval).await;
                match service.sync(SyncScope::All).await {
                    Ok(report) => tracing::info!(
                        upserted = report.upserted,
                        deleted = report.deleted,
                        failed = report.failed,
                        "scheduled resync finished"
                    ),
                    Err(err) => tracing::error!(error = %err, "scheduled resync failed"),
                }
            }
        }))
    }
}

fn scope_label(scope: &SyncScope) -> String {
    match scope {
        SyncScope::All => "all".to_string(),
        SyncScope::Since(since) => format!("since {}", since.to_rfc3339()),
        SyncScope::One(id) => format!("one {id}"),
    }
}
