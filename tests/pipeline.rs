//! End-to-end pipeline tests against the in-memory backends.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::Semaphore;

use insight_sync::config::{Config, SyncConfig};
use insight_sync::embedding::{EmbeddingProvider, HashEmbedder};
use insight_sync::error::{PipelineError, Result};
use insight_sync::index::{MemoryIndex, VectorIndexStore};
use insight_sync::models::{InsightRecord, RecordId, SearchQuery, SyncScope};
use insight_sync::reconciler::{Reconciler, TaskOutcome};
use insight_sync::retry::RetryPolicy;
use insight_sync::service::Orchestrator;
use insight_sync::source::{MemorySource, SourceRepository};
use insight_sync::writer::IndexWriter;

fn record(id: RecordId, minute: u32, title: &str, body: &str) -> InsightRecord {
    InsightRecord {
        id,
        title: title.to_string(),
        body: body.to_string(),
        metadata: BTreeMap::new(),
        updated_at: Utc.with_ymd_and_hms(2025, 7, 1, 12, minute, 0).unwrap(),
        deleted: false,
    }
}

fn query(text: &str, k: usize) -> SearchQuery {
    SearchQuery {
        text: text.to_string(),
        filters: BTreeMap::new(),
        k,
        summarize: false,
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.embedding.provider = "hash".to_string();
    config.index.dims = 64;
    config.sync.backoff_base_ms = 1;
    config
}

fn fast_sync_config() -> SyncConfig {
    SyncConfig {
        page_size: 10,
        concurrency: 4,
        max_attempts: 2,
        backoff_base_ms: 1,
        call_timeout_secs: 5,
        auto_interval_secs: None,
    }
}

#[tokio::test]
async fn sync_search_delete_round_trip() {
    let source = Arc::new(MemorySource::new());
    source.put(record(1, 0, "Brake wear", "Elevated brake pad wear across the NA fleet."));
    source.put(record(2, 1, "Charging taper", "DC charging tapers early in cold climates."));
    source.put(record(3, 2, "Range estimate", "Range estimates drift upward on highway trips."));

    let service = Orchestrator::with_source(&test_config(), source.clone()).unwrap();

    let report = service.sync(SyncScope::All).await.unwrap();
    assert_eq!(report.upserted, 3);
    assert_eq!(report.failed, 0);

    let response = service.search(&query("brake pad wear", 3)).await.unwrap();
    assert_eq!(response.hits[0].id, 1);

    // Delete converges both stores; the hit disappears.
    service.delete(1).await.unwrap();
    let response = service.search(&query("brake pad wear", 3)).await.unwrap();
    assert!(response.hits.iter().all(|hit| hit.id != 1));
    assert!(matches!(
        service.fetch(1).await,
        Err(PipelineError::NotFound(1))
    ));
}

#[tokio::test]
async fn repeated_syncs_are_idempotent() {
    let source = Arc::new(MemorySource::new());
    source.put(record(1, 0, "Brake wear", "Elevated wear."));
    source.put(record(2, 1, "Charging taper", "Early taper."));

    let service = Orchestrator::with_source(&test_config(), source).unwrap();
    service.sync(SyncScope::All).await.unwrap();

    let again = service.sync(SyncScope::All).await.unwrap();
    assert_eq!(again.upserted, 0);
    assert_eq!(again.unchanged, 2);

    let first = service.search(&query("charging taper", 5)).await.unwrap();
    let second = service.search(&query("charging taper", 5)).await.unwrap();
    assert_eq!(first.hits, second.hits);
}

#[tokio::test]
async fn incremental_sync_converges_updates() {
    let source = Arc::new(MemorySource::new());
    source.put(record(1, 0, "Brake wear", "Elevated wear."));
    source.put(record(2, 1, "Charging taper", "Early taper."));

    let service = Orchestrator::with_source(&test_config(), source.clone()).unwrap();
    service.sync(SyncScope::All).await.unwrap();

    // Update one record after the first sync.
    let updated = record(2, 30, "Charging taper", "Taper threshold has been revised upward.");
    let cutoff = Utc.with_ymd_and_hms(2025, 7, 1, 12, 10, 0).unwrap();
    source.put(updated);

    let report = service.sync(SyncScope::Since(cutoff)).await.unwrap();
    assert_eq!(report.upserted, 1);

    let response = service.search(&query("taper threshold revised", 2)).await.unwrap();
    assert_eq!(response.hits[0].id, 2);
    assert!(response.hits[0].snippet.contains("revised"));
}

/// Embedder that parks its first call until released, so a test can hold a
/// sync mid-flight while the source changes underneath it.
struct GatedEmbedder {
    inner: HashEmbedder,
    first_call: AtomicBool,
    started: Arc<Semaphore>,
    release: Arc<Semaphore>,
}

#[async_trait]
impl EmbeddingProvider for GatedEmbedder {
    fn model_name(&self) -> &str {
        "gated"
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.first_call.swap(false, Ordering::SeqCst) {
            self.started.add_permits(1);
            let permit = self.release.acquire().await;
            permit.unwrap().forget();
        }
        self.inner.embed(text).await
    }
}

#[tokio::test]
async fn update_during_inflight_sync_is_not_lost() {
    let source = Arc::new(MemorySource::new());
    let index = Arc::new(MemoryIndex::new());

    let started = Arc::new(Semaphore::new(0));
    let release = Arc::new(Semaphore::new(0));
    let embedder = Arc::new(GatedEmbedder {
        inner: HashEmbedder::new(64),
        first_call: AtomicBool::new(true),
        started: started.clone(),
        release: release.clone(),
    });

    let policy = RetryPolicy::new(1, Duration::from_millis(1), Duration::from_secs(10));
    let writer = IndexWriter::new(embedder, index.clone(), policy);
    let reconciler = Reconciler::new(source.clone(), index.clone(), writer, &fast_sync_config());

    let v1 = record(1, 0, "Brake wear", "Initial observation.");
    source.put(v1);

    // First sync parks inside the embedder.
    let first = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.sync_one(1).await })
    };
    started.acquire().await.unwrap().forget();

    // The record changes while that sync is still in flight.
    let v2 = record(1, 45, "Brake wear", "Observation corrected after recall data.");
    let v2_fingerprint = v2.fingerprint();
    source.put(v2);

    // A second sync request for the same id must not return until the
    // update is reflected, even though it collapses onto the running task.
    let second = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.sync_one(1).await })
    };

    release.add_permits(1);
    assert!(!matches!(first.await.unwrap(), TaskOutcome::Failed(_)));
    assert!(!matches!(second.await.unwrap(), TaskOutcome::Failed(_)));

    let stored = index.get(1).await.unwrap().unwrap();
    assert_eq!(stored.fingerprint, v2_fingerprint);
    assert!(stored.body.contains("corrected"));
}

#[tokio::test]
async fn full_sync_removes_documents_missing_from_source() {
    let source = Arc::new(MemorySource::new());
    source.put(record(1, 0, "Brake wear", "Elevated wear."));
    source.put(record(2, 1, "Charging taper", "Early taper."));

    let service = Orchestrator::with_source(&test_config(), source.clone()).unwrap();
    service.sync(SyncScope::All).await.unwrap();

    source.mark_deleted(2).await.unwrap();
    let report = service.sync(SyncScope::All).await.unwrap();
    assert_eq!(report.deleted, 1);

    let response = service.search(&query("charging taper", 5)).await.unwrap();
    assert!(response.hits.iter().all(|hit| hit.id != 2));
}
