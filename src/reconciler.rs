//! Reconciliation between the source of truth and the vector index.
//!
//! The [`Reconciler`] drives every sync scope through the same per-record
//! path, [`Reconciler::sync_one`]:
//!
//! 1. read the record's current state from the source,
//! 2. compare fingerprints against the indexed document,
//! 3. upsert, delete, or leave the index untouched.
//!
//! Concurrent syncs of the same id collapse onto one in-flight task: a
//! caller that finds a task already running joins it, then runs one fresh
//! pass of its own so an update issued after the running task started is
//! never lost. The fingerprint check makes that second pass cheap when the
//! joined task already wrote the latest version.
//!
//! Batch syncs reconcile records concurrently with a bounded width and
//! never abort on a single bad record: per-record failures are counted in
//! the [`SyncReport`] and logged, while a failure to read a scan page from
//! the source aborts the batch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::stream::{self, StreamExt};
use futures::FutureExt;

use crate::config::SyncConfig;
use crate::error::{Dependency, Result};
use crate::index::VectorIndexStore;
use crate::models::{InsightRecord, RecordId, SyncReport, SyncScope};
use crate::retry::{self, RetryPolicy};
use crate::source::SourceRepository;
use crate::writer::IndexWriter;

/// Result of reconciling one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Upserted,
    Deleted,
    Unchanged,
    Failed(String),
}

type SharedTask = Shared<BoxFuture<'static, TaskOutcome>>;

// A named fn rather than a closure: the batch futures end up inside
// spawned `'static` tasks, and rustc cannot generalize a `&InsightRecord`
// closure over the lifetimes that requires.
fn record_id(record: &InsightRecord) -> RecordId {
    record.id
}

struct Inner {
    source: Arc<dyn SourceRepository>,
    index: Arc<dyn VectorIndexStore>,
    writer: IndexWriter,
    policy: RetryPolicy,
    page_size: usize,
    concurrency: usize,
    in_flight: Mutex<HashMap<RecordId, SharedTask>>,
}

/// Keeps the vector index convergent with the source repository.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn SourceRepository>,
        index: Arc<dyn VectorIndexStore>,
        writer: IndexWriter,
        config: &SyncConfig,
    ) -> Self {
        let policy = RetryPolicy::new(
            config.max_attempts,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_secs(config.call_timeout_secs),
        );
        Self {
            inner: Arc::new(Inner {
                source,
                index,
                writer,
                policy,
                page_size: config.page_size.max(1),
                concurrency: config.concurrency.max(1),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Dispatch a sync request by scope.
    pub async fn sync(&self, scope: SyncScope) -> Result<SyncReport> {
        match scope {
            SyncScope::All => self.sync_all().await,
            SyncScope::Since(since) => self.sync_since(since).await,
            SyncScope::One(id) => {
                let mut report = SyncReport::default();
                tally(&mut report, self.sync_one(id).await);
                Ok(report)
            }
        }
    }

    /// Reconcile one record with the index.
    ///
    /// If a task for this id is already in flight the caller joins it and
    /// then runs one pass of its own, so the outcome always reflects a
    /// source read started at or after this call.
    pub async fn sync_one(&self, id: RecordId) -> TaskOutcome {
        let mut joined = false;
        loop {
            let (task, created) = self.obtain_task(id);
            let outcome = task.await;
            if created || joined {
                return outcome;
            }
            joined = true;
        }
    }

    /// Join the in-flight task for `id` or start a new one. The boolean is
    /// true when this call created the task.
    fn obtain_task(&self, id: RecordId) -> (SharedTask, bool) {
        let mut in_flight = self.inner.in_flight.lock().unwrap();
        if let Some(task) = in_flight.get(&id) {
            return (task.clone(), false);
        }

        // The task is driven by the runtime, not the caller, so a caller
        // dropping its future mid-sync cannot leave a half-written record.
        // Holding the map lock across the spawn means the task's own
        // cleanup cannot run before its entry exists.
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let outcome = match reconcile_record(&inner, id).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(id, error = %err, "failed to reconcile record");
                    TaskOutcome::Failed(err.to_string())
                }
            };
            inner.in_flight.lock().unwrap().remove(&id);
            outcome
        });

        let task: SharedTask = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(err) => TaskOutcome::Failed(format!("sync task panicked: {err}")),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(id, task.clone());
        (task, true)
    }

    /// Full reconciliation: every source record, then removal of indexed
    /// documents whose id no longer exists in the source.
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut seen: HashSet<RecordId> = HashSet::new();
        let mut after: Option<RecordId> = None;

        loop {
            let page = retry::with_backoff(self.inner.policy, Dependency::Source, || {
                self.inner.source.list_page(after, self.inner.page_size)
            })
            .await?;
            if page.is_empty() {
                break;
            }
            after = page.last().map(record_id);
            seen.extend(page.iter().map(record_id));
            self.reconcile_batch(page.iter().map(record_id), &mut report)
                .await;
        }

        let indexed = retry::with_backoff(self.inner.policy, Dependency::Index, || {
            self.inner.index.list_ids()
        })
        .await?;
        let orphans: Vec<RecordId> = indexed
            .into_iter()
            .filter(|id| !seen.contains(id))
            .collect();
        if !orphans.is_empty() {
            tracing::info!(count = orphans.len(), "removing orphaned index documents");
            self.reconcile_batch(orphans.into_iter(), &mut report).await;
        }

        tracing::info!(
            upserted = report.upserted,
            deleted = report.deleted,
            unchanged = report.unchanged,
            failed = report.failed,
            "full sync finished"
        );
        Ok(report)
    }

    /// Incremental reconciliation of records modified at or after `since`.
    /// Does not scan for orphans; deletions flow through tombstones.
    pub async fn sync_since(&self, since: DateTime<Utc>) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut after: Option<RecordId> = None;

        loop {
            let page = retry::with_backoff(self.inner.policy, Dependency::Source, || {
                self.inner
                    .source
                    .changed_page(since, after, self.inner.page_size)
            })
            .await?;
            if page.is_empty() {
                break;
            }
            after = page.last().map(record_id);
            self.reconcile_batch(page.iter().map(record_id), &mut report)
                .await;
        }

        tracing::info!(
            %since,
            upserted = report.upserted,
            deleted = report.deleted,
            unchanged = report.unchanged,
            failed = report.failed,
            "incremental sync finished"
        );
        Ok(report)
    }

    async fn reconcile_batch(
        &self,
        ids: impl Iterator<Item = RecordId>,
        report: &mut SyncReport,
    ) {
        let outcomes: Vec<TaskOutcome> = stream::iter(ids.map(|id| self.sync_one(id)))
            .buffer_unordered(self.inner.concurrency)
            .collect()
            .await;
        for outcome in outcomes {
            tally(report, outcome);
        }
    }
}

fn tally(report: &mut SyncReport, outcome: TaskOutcome) {
    match outcome {
        TaskOutcome::Upserted => report.upserted += 1,
        TaskOutcome::Deleted => report.deleted += 1,
        TaskOutcome::Unchanged => report.unchanged += 1,
        TaskOutcome::Failed(_) => report.failed += 1,
    }
}

/// The per-record reconciliation pass.
async fn reconcile_record(inner: &Inner, id: RecordId) -> Result<TaskOutcome> {
    let record = retry::with_backoff(inner.policy, Dependency::Source, || {
        inner.source.get_by_id(id)
    })
    .await?;

    let record = match record {
        Some(record) if !record.deleted => record,
        // Absent or tombstoned: converge by removing the indexed copy.
        // Nothing indexed means nothing to do, so repeat syncs over a
        // tombstone report it unchanged rather than deleted again.
        _ => {
            let current =
                retry::with_backoff(inner.policy, Dependency::Index, || inner.index.get(id))
                    .await?;
            if current.is_none() {
                return Ok(TaskOutcome::Unchanged);
            }
            inner.writer.delete(id).await?;
            return Ok(TaskOutcome::Deleted);
        }
    };

    let desired = record.fingerprint();
    let current = retry::with_backoff(inner.policy, Dependency::Index, || inner.index.get(id))
        .await?;
    if let Some(document) = current {
        // Equal or newer fingerprint in the index means this version (or a
        // later one) was already written; re-embedding would be wasted work.
        if document.fingerprint >= desired {
            return Ok(TaskOutcome::Unchanged);
        }
    }

    inner.writer.upsert(&record).await?;
    Ok(TaskOutcome::Upserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingProvider;
    use crate::error::PipelineError;
    use crate::index::MemoryIndex;
    use crate::models::InsightRecord;
    use crate::source::MemorySource;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        fn model_name(&self) -> &str {
            "stub"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains("poison") {
                return Err(PipelineError::transient(Dependency::Embedding, "HTTP 503"));
            }
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    fn record(id: RecordId, minute: u32) -> InsightRecord {
        InsightRecord {
            id,
            title: format!("insight {id}"),
            body: "observed behavior in the fleet".into(),
            metadata: BTreeMap::new(),
            updated_at: Utc.with_ymd_and_hms(2025, 5, 1, 10, minute, 0).unwrap(),
            deleted: false,
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            page_size: 2,
            concurrency: 4,
            max_attempts: 2,
            backoff_base_ms: 1,
            call_timeout_secs: 5,
            auto_interval_secs: None,
        }
    }

    fn build(source: Arc<MemorySource>, index: Arc<MemoryIndex>) -> Reconciler {
        let config = fast_config();
        let policy = RetryPolicy::new(
            config.max_attempts,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_secs(config.call_timeout_secs),
        );
        let writer = IndexWriter::new(Arc::new(StubEmbedder), index.clone(), policy);
        Reconciler::new(source, index, writer, &config)
    }

    #[tokio::test]
    async fn sync_all_indexes_every_record_across_pages() {
        let source = Arc::new(MemorySource::new());
        let index = Arc::new(MemoryIndex::new());
        for id in 1..=5 {
            source.put(record(id, id as u32));
        }

        let reconciler = build(source, index.clone());
        let report = reconciler.sync_all().await.unwrap();
        assert_eq!(report.upserted, 5);
        assert_eq!(report.failed, 0);
        assert_eq!(index.len(), 5);
    }

    #[tokio::test]
    async fn batch_syncs_run_inside_spawned_tasks() {
        let source = Arc::new(MemorySource::new());
        let index = Arc::new(MemoryIndex::new());
        for id in 1..=4 {
            source.put(record(id, id as u32));
        }

        // Background jobs and the scheduler hand these futures to
        // tokio::spawn, which requires them to be 'static.
        let reconciler = build(source, index);
        let all = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.sync_all().await }
        });
        let report = all.await.unwrap().unwrap();
        assert_eq!(report.upserted, 4);

        let since = Utc.with_ymd_and_hms(2025, 5, 1, 10, 2, 0).unwrap();
        let incremental =
            tokio::spawn(async move { reconciler.sync_since(since).await });
        let report = incremental.await.unwrap().unwrap();
        assert_eq!(report.unchanged, 3);
    }

    #[tokio::test]
    async fn second_full_sync_is_all_unchanged() {
        let source = Arc::new(MemorySource::new());
        let index = Arc::new(MemoryIndex::new());
        for id in 1..=3 {
            source.put(record(id, id as u32));
        }

        let reconciler = build(source, index);
        reconciler.sync_all().await.unwrap();
        let report = reconciler.sync_all().await.unwrap();
        assert_eq!(report.upserted, 0);
        assert_eq!(report.unchanged, 3);
    }

    #[tokio::test]
    async fn tombstones_and_orphans_are_removed() {
        let source = Arc::new(MemorySource::new());
        let index = Arc::new(MemoryIndex::new());
        source.put(record(1, 1));
        source.put(record(2, 2));

        let reconciler = build(source.clone(), index.clone());
        reconciler.sync_all().await.unwrap();
        assert_eq!(index.len(), 2);

        // Tombstone one record; plant an orphan the source never had.
        source.mark_deleted(1).await.unwrap();
        index
            .upsert(crate::models::IndexedDocument {
                id: 99,
                title: "stale".into(),
                body: String::new(),
                metadata: BTreeMap::new(),
                embedding: vec![1.0, 0.0],
                fingerprint: 1,
            })
            .await
            .unwrap();

        let report = reconciler.sync_all().await.unwrap();
        assert_eq!(report.deleted, 2);
        assert!(index.get(1).await.unwrap().is_none());
        assert!(index.get(99).await.unwrap().is_none());
        assert!(index.get(2).await.unwrap().is_some());

        // The tombstone is already converged; a repeat sync must not count
        // it as deleted again.
        let repeat = reconciler.sync_all().await.unwrap();
        assert_eq!(repeat.deleted, 0);
        assert_eq!(repeat.unchanged, 2);
    }

    #[tokio::test]
    async fn one_poison_record_does_not_abort_the_batch() {
        let source = Arc::new(MemorySource::new());
        let index = Arc::new(MemoryIndex::new());
        for id in 1..=5 {
            let mut r = record(id, id as u32);
            if id == 3 {
                r.body = "poison".into();
            }
            source.put(r);
        }

        let reconciler = build(source, index.clone());
        let report = reconciler.sync_all().await.unwrap();
        assert_eq!(report.upserted, 4);
        assert_eq!(report.failed, 1);
        assert!(index.get(3).await.unwrap().is_none());
        assert_eq!(index.len(), 4);
    }

    #[tokio::test]
    async fn sync_since_skips_unmodified_records() {
        let source = Arc::new(MemorySource::new());
        let index = Arc::new(MemoryIndex::new());
        source.put(record(1, 5));
        source.put(record(2, 30));

        let reconciler = build(source, index.clone());
        let since = Utc.with_ymd_and_hms(2025, 5, 1, 10, 20, 0).unwrap();
        let report = reconciler.sync_since(since).await.unwrap();
        assert_eq!(report.upserted, 1);
        assert!(index.get(1).await.unwrap().is_none());
        assert!(index.get(2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sync_one_of_missing_id_clears_only_indexed_state() {
        let source = Arc::new(MemorySource::new());
        let index = Arc::new(MemoryIndex::new());
        let reconciler = build(source, index.clone());

        // Unknown id with no indexed document: already converged.
        assert_eq!(reconciler.sync_one(42).await, TaskOutcome::Unchanged);

        // Unknown id with a stale document: the document goes away.
        index
            .upsert(crate::models::IndexedDocument {
                id: 42,
                title: "stale".into(),
                body: String::new(),
                metadata: BTreeMap::new(),
                embedding: vec![1.0, 0.0],
                fingerprint: 1,
            })
            .await
            .unwrap();
        assert_eq!(reconciler.sync_one(42).await, TaskOutcome::Deleted);
        assert!(index.get(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_sync_one_calls_collapse() {
        let source = Arc::new(MemorySource::new());
        let index = Arc::new(MemoryIndex::new());
        source.put(record(1, 1));

        let reconciler = build(source, index.clone());
        let a = reconciler.sync_one(1);
        let b = reconciler.sync_one(1);
        let (left, right) = tokio::join!(a, b);
        // One call wrote the document, the other observed it fresh (or
        // joined the same write); either way the index holds one copy.
        assert_eq!(index.len(), 1);
        for outcome in [left, right] {
            assert!(matches!(
                outcome,
                TaskOutcome::Upserted | TaskOutcome::Unchanged
            ));
        }
    }

    #[tokio::test]
    async fn stale_index_version_is_replaced() {
        let source = Arc::new(MemorySource::new());
        let index = Arc::new(MemoryIndex::new());
        source.put(record(1, 1));

        let reconciler = build(source.clone(), index.clone());
        reconciler.sync_one(1).await;
        let old = index.get(1).await.unwrap().unwrap().fingerprint;

        source.put(record(1, 45));
        assert_eq!(reconciler.sync_one(1).await, TaskOutcome::Upserted);
        let new = index.get(1).await.unwrap().unwrap().fingerprint;
        assert!(new > old);
    }
}
