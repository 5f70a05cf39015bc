//! Source-of-truth repository abstraction.
//!
//! The [`SourceRepository`] trait is the pipeline's read contract against
//! the authoritative relational store. Scans are keyset-paged (ordered by
//! id) so full and incremental syncs can stream arbitrarily large record
//! sets without holding them in memory at once.
//!
//! Two backends ship with the crate: [`MemorySource`] for tests and demos,
//! and [`JsonFileSource`], which reads a records file from disk so the CLI
//! and server run end to end without a database.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Dependency, PipelineError, Result};
use crate::models::{InsightRecord, RecordId};

/// Read contract against the authoritative store of insight records.
///
/// Scan pages are ordered by ascending id and include records flagged as
/// deleted, so reconciliation sees tombstones as well as live rows.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Current state of one record, or `None` if the id was never present.
    async fn get_by_id(&self, id: RecordId) -> Result<Option<InsightRecord>>;

    /// Next page of all records with id greater than `after`.
    async fn list_page(&self, after: Option<RecordId>, limit: usize)
        -> Result<Vec<InsightRecord>>;

    /// Next page of records modified at or after `since`, id greater than
    /// `after`.
    async fn changed_page(
        &self,
        since: DateTime<Utc>,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<InsightRecord>>;

    /// Flag a record as deleted and bump its last-modified timestamp.
    ///
    /// Returns [`PipelineError::NotFound`] if the id was never present.
    async fn mark_deleted(&self, id: RecordId) -> Result<()>;
}

fn page_from_map(
    records: &BTreeMap<RecordId, InsightRecord>,
    since: Option<DateTime<Utc>>,
    after: Option<RecordId>,
    limit: usize,
) -> Vec<InsightRecord> {
    let start = match after {
        Some(id) => id + 1,
        None => RecordId::MIN,
    };
    records
        .range(start..)
        .map(|(_, record)| record)
        .filter(|record| since.map_or(true, |ts| record.updated_at >= ts))
        .take(limit)
        .cloned()
        .collect()
}

// ============ In-memory source ============

/// In-memory source repository for tests and the `memory` backend.
#[derive(Default)]
pub struct MemorySource {
    records: RwLock<BTreeMap<RecordId, InsightRecord>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record, standing in for a write through the
    /// authoritative store.
    pub fn put(&self, record: InsightRecord) {
        self.records.write().unwrap().insert(record.id, record);
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }
}

#[async_trait]
impl SourceRepository for MemorySource {
    async fn get_by_id(&self, id: RecordId) -> Result<Option<InsightRecord>> {
        Ok(self.records.read().unwrap().get(&id).cloned())
    }

    async fn list_page(
        &self,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<InsightRecord>> {
        Ok(page_from_map(
            &self.records.read().unwrap(),
            None,
            after,
            limit,
        ))
    }

    async fn changed_page(
        &self,
        since: DateTime<Utc>,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<InsightRecord>> {
        Ok(page_from_map(
            &self.records.read().unwrap(),
            Some(since),
            after,
            limit,
        ))
    }

    async fn mark_deleted(&self, id: RecordId) -> Result<()> {
        let mut records = self.records.write().unwrap();
        match records.get_mut(&id) {
            Some(record) => {
                record.deleted = true;
                record.updated_at = Utc::now();
                Ok(())
            }
            None => Err(PipelineError::NotFound(id)),
        }
    }
}

// ============ JSON file source ============

/// File-backed source repository for local operation.
///
/// Loads the whole records file at startup and rewrites it on deletion.
/// Intended for modest local datasets, not as a production store.
pub struct JsonFileSource {
    path: PathBuf,
    records: RwLock<BTreeMap<RecordId, InsightRecord>>,
}

impl JsonFileSource {
    /// Load records from a JSON array file.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            PipelineError::transient(
                Dependency::Source,
                format!("failed to read {}: {e}", path.display()),
            )
        })?;
        let list: Vec<InsightRecord> = serde_json::from_str(&content).map_err(|e| {
            PipelineError::transient(
                Dependency::Source,
                format!("failed to parse {}: {e}", path.display()),
            )
        })?;
        let records = list.into_iter().map(|r| (r.id, r)).collect();
        Ok(Self {
            path: path.to_path_buf(),
            records: RwLock::new(records),
        })
    }

    async fn persist(&self) -> Result<()> {
        let snapshot: Vec<InsightRecord> =
            self.records.read().unwrap().values().cloned().collect();
        let content = serde_json::to_string_pretty(&snapshot).map_err(|e| {
            PipelineError::transient(Dependency::Source, format!("serialize records: {e}"))
        })?;
        tokio::fs::write(&self.path, content).await.map_err(|e| {
            PipelineError::transient(
                Dependency::Source,
                format!("failed to write {}: {e}", self.path.display()),
            )
        })
    }
}

#[async_trait]
impl SourceRepository for JsonFileSource {
    async fn get_by_id(&self, id: RecordId) -> Result<Option<InsightRecord>> {
        Ok(self.records.read().unwrap().get(&id).cloned())
    }

    async fn list_page(
        &self,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<InsightRecord>> {
        Ok(page_from_map(
            &self.records.read().unwrap(),
            None,
            after,
            limit,
        ))
    }

    async fn changed_page(
        &self,
        since: DateTime<Utc>,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<InsightRecord>> {
        Ok(page_from_map(
            &self.records.read().unwrap(),
            Some(since),
            after,
            limit,
        ))
    }

    async fn mark_deleted(&self, id: RecordId) -> Result<()> {
        {
            let mut records = self.records.write().unwrap();
            match records.get_mut(&id) {
                Some(record) => {
                    record.deleted = true;
                    record.updated_at = Utc::now();
                }
                None => return Err(PipelineError::NotFound(id)),
            }
        }
        self.persist().await
    }
}
