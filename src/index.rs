//! Vector index abstraction and the built-in in-memory backend.
//!
//! The [`VectorIndexStore`] trait defines the write and query contract the
//! pipeline needs from a vector database: idempotent replace-by-id upsert,
//! idempotent delete, point reads for fingerprint checks, and filtered kNN
//! search. Implementations must honor the ordering contract of
//! [`knn_search`](VectorIndexStore::knn_search) so search stays
//! deterministic regardless of backend:
//!
//! 1. similarity score, descending
//! 2. fingerprint, descending (newer document wins a score tie)
//! 3. id, ascending
//!
//! [`MemoryIndex`] is a brute-force cosine-similarity backend used for
//! tests and local operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{IndexedDocument, MetadataValue, RecordId};

/// One kNN hit: the stored document and its similarity to the query vector.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: IndexedDocument,
    pub score: f32,
}

/// Write and query contract against the vector index.
///
/// All operations are idempotent or naturally idempotent, so the retry
/// layer may re-issue any of them after a transient failure.
#[async_trait]
pub trait VectorIndexStore: Send + Sync {
    /// Replace-by-id upsert. Writing the same document twice leaves
    /// exactly one stored copy with identical content.
    async fn upsert(&self, document: IndexedDocument) -> Result<()>;

    /// Delete-by-id. Deleting an absent id is not an error.
    async fn delete(&self, id: RecordId) -> Result<()>;

    /// Point read, used for fingerprint staleness checks.
    async fn get(&self, id: RecordId) -> Result<Option<IndexedDocument>>;

    /// All stored ids, used by full reconciliation to find orphans.
    async fn list_ids(&self) -> Result<Vec<RecordId>>;

    /// Up to `k` nearest documents matching every metadata filter, in the
    /// module-level ordering.
    async fn knn_search(
        &self,
        vector: &[f32],
        k: usize,
        filters: &BTreeMap<String, MetadataValue>,
    ) -> Result<Vec<ScoredDocument>>;
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

fn matches_filters(
    document: &IndexedDocument,
    filters: &BTreeMap<String, MetadataValue>,
) -> bool {
    filters
        .iter()
        .all(|(key, value)| document.metadata.get(key) == Some(value))
}

/// Sort hits by the trait's ordering contract.
pub fn order_hits(hits: &mut [ScoredDocument]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.document.fingerprint.cmp(&a.document.fingerprint))
            .then(a.document.id.cmp(&b.document.id))
    });
}

/// In-memory vector index with brute-force cosine search.
#[derive(Default)]
pub struct MemoryIndex {
    documents: RwLock<HashMap<RecordId, IndexedDocument>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().unwrap().is_empty()
    }
}

#[async_trait]
impl VectorIndexStore for MemoryIndex {
    async fn upsert(&self, document: IndexedDocument) -> Result<()> {
        self.documents
            .write()
            .unwrap()
            .insert(document.id, document);
        Ok(())
    }

    async fn delete(&self, id: RecordId) -> Result<()> {
        self.documents.write().unwrap().remove(&id);
        Ok(())
    }

    async fn get(&self, id: RecordId) -> Result<Option<IndexedDocument>> {
        Ok(self.documents.read().unwrap().get(&id).cloned())
    }

    async fn list_ids(&self) -> Result<Vec<RecordId>> {
        let mut ids: Vec<RecordId> = self.documents.read().unwrap().keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn knn_search(
        &self,
        vector: &[f32],
        k: usize,
        filters: &BTreeMap<String, MetadataValue>,
    ) -> Result<Vec<ScoredDocument>> {
        let documents = self.documents.read().unwrap();
        let mut hits: Vec<ScoredDocument> = documents
            .values()
            .filter(|doc| matches_filters(doc, filters))
            .map(|doc| ScoredDocument {
                score: cosine_similarity(vector, &doc.embedding),
                document: doc.clone(),
            })
            .collect();
        order_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }
}
