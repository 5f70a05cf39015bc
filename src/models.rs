//! Core data models for the sync-and-search pipeline.
//!
//! These types flow between the source repository, the reconciler, the
//! index writer, and the search engine. Records are immutable snapshots
//! once read from the source; an indexed document is derived from exactly
//! one such snapshot and carries its fingerprint.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifier shared by a source record and its indexed document.
pub type RecordId = i64;

/// A scalar metadata value attached to an insight record.
///
/// Untagged so that JSON metadata maps (`{"region": "NA", "views": 12}`)
/// deserialize without ceremony.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Authoritative entity owned by the source repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightRecord {
    pub id: RecordId,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetadataValue>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

impl InsightRecord {
    /// Version marker used for staleness detection between source and index.
    ///
    /// The last-modified timestamp in epoch milliseconds when it is usable;
    /// a content hash otherwise, so records with a missing or zeroed
    /// timestamp still get change detection. Hash fingerprints are only
    /// comparable for (in)equality with other hash fingerprints; a record
    /// that later gains a real timestamp switches regimes and simply looks
    /// changed once.
    pub fn fingerprint(&self) -> i64 {
        let ts = self.updated_at.timestamp_millis();
        if ts > 0 {
            ts
        } else {
            self.content_fingerprint()
        }
    }

    fn content_fingerprint(&self) -> i64 {
        let mut hasher = Sha256::new();
        hasher.update(self.title.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.body.as_bytes());
        for (key, value) in &self.metadata {
            hasher.update(key.as_bytes());
            hasher.update(serde_json::to_string(value).unwrap_or_default().as_bytes());
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        // Mask to 63 bits: every hash-regime fingerprint is non-negative,
        // with no wraparound for any digest value.
        i64::from_le_bytes(bytes) & i64::MAX
    }
}

/// Derived entity stored in the vector index.
///
/// Invariant: all fields are taken from the single source snapshot whose
/// version is recorded in `fingerprint` — never a mix of an old metadata
/// copy and a new embedding or vice versa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: RecordId,
    pub title: String,
    pub body: String,
    pub metadata: BTreeMap<String, MetadataValue>,
    pub embedding: Vec<f32>,
    pub fingerprint: i64,
}

/// What a sync request covers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncScope {
    /// Full reconciliation of every record, including orphan removal.
    All,
    /// Records modified at or after the given instant.
    Since(DateTime<Utc>),
    /// A single record, used by write-path triggers.
    One(RecordId),
}

/// Aggregate counts returned by every sync operation, partial failures
/// included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub upserted: u64,
    pub deleted: u64,
    pub unchanged: u64,
    pub failed: u64,
}

impl SyncReport {
    pub fn total(&self) -> u64 {
        self.upserted + self.deleted + self.unchanged + self.failed
    }
}

/// A semantic search request.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    /// Free-text query.
    pub text: String,
    /// Metadata equality filters; all must match.
    #[serde(default)]
    pub filters: BTreeMap<String, MetadataValue>,
    /// Maximum number of hits to return (1..=max_k).
    pub k: usize,
    /// Request a best-effort LLM summary of the top hits.
    #[serde(default)]
    pub summarize: bool,
}

/// One ranked hit. Carries the indexed document's text fields and version,
/// but not the raw embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: RecordId,
    pub score: f32,
    pub title: String,
    pub snippet: String,
    pub metadata: BTreeMap<String, MetadataValue>,
    pub fingerprint: i64,
}

/// Outcome of the optional summarization step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "text", rename_all = "snake_case")]
pub enum SummaryOutcome {
    /// Summarization was not requested, or there was nothing to summarize.
    Skipped,
    Ready(String),
    /// The summarizer failed or timed out; hits are still valid.
    Unavailable,
}

/// Ranked hits plus the summarization outcome. Produced fresh per query.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub summary: SummaryOutcome,
}
