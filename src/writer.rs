//! Builds embedding-bearing documents and writes them to the vector index.
//!
//! The writer owns the two invariants the index depends on:
//! - an [`IndexedDocument`] is derived from exactly one source snapshot
//!   (embedding, text fields, metadata, and fingerprint all come from the
//!   same [`InsightRecord`]), and
//! - both `upsert` and `delete` are idempotent, so a retried or repeated
//!   sync can never produce duplicates or partial documents.

use std::sync::Arc;

use crate::embedding::EmbeddingProvider;
use crate::error::{Dependency, PipelineError, Result};
use crate::index::VectorIndexStore;
use crate::models::{IndexedDocument, InsightRecord, RecordId};
use crate::retry::{self, RetryPolicy};

pub struct IndexWriter {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndexStore>,
    policy: RetryPolicy,
}

impl IndexWriter {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndexStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            embedder,
            index,
            policy,
        }
    }

    /// Deterministic text fed to the embedding provider: title, body, then
    /// metadata in key order. Identical records always embed identical
    /// text.
    pub fn embedding_text(record: &InsightRecord) -> String {
        let mut text = String::with_capacity(record.title.len() + record.body.len() + 64);
        text.push_str(record.title.trim());
        text.push_str("\n\n");
        text.push_str(record.body.trim());
        for (key, value) in &record.metadata {
            text.push('\n');
            text.push_str(key);
            text.push_str(": ");
            text.push_str(&serde_json::to_string(value).unwrap_or_default());
        }
        text
    }

    /// Embed `record` and write its indexed document with a
    /// replace-by-id upsert.
    ///
    /// Transient embedding or index failures are retried here and
    /// propagate to the caller once the attempt cap is reached; a record
    /// with no text at all is rejected as permanently malformed.
    pub async fn upsert(&self, record: &InsightRecord) -> Result<IndexedDocument> {
        if record.title.trim().is_empty() && record.body.trim().is_empty() {
            return Err(PipelineError::PermanentRecord {
                id: record.id,
                reason: "empty title and body".to_string(),
            });
        }

        let text = Self::embedding_text(record);
        let embedding = retry::with_backoff(self.policy, Dependency::Embedding, || {
            self.embedder.embed(&text)
        })
        .await?;

        if embedding.is_empty() {
            return Err(PipelineError::transient(
                Dependency::Embedding,
                "provider returned an empty vector",
            ));
        }

        let document = IndexedDocument {
            id: record.id,
            title: record.title.clone(),
            body: record.body.clone(),
            metadata: record.metadata.clone(),
            embedding,
            fingerprint: record.fingerprint(),
        };

        let stored = document.clone();
        retry::with_backoff(self.policy, Dependency::Index, || {
            self.index.upsert(stored.clone())
        })
        .await?;

        tracing::debug!(id = record.id, fingerprint = document.fingerprint, "indexed record");
        Ok(document)
    }

    /// Idempotent delete-by-id; absent ids are not an error.
    pub async fn delete(&self, id: RecordId) -> Result<()> {
        retry::with_backoff(self.policy, Dependency::Index, || self.index.delete(id)).await?;
        tracing::debug!(id, "removed record from index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::time::Duration;

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
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_secs(1))
    }

    fn record(id: RecordId) -> InsightRecord {
        InsightRecord {
            id,
            title: "Charging curve".into(),
            body: "DC fast charging tapers early at low ambient temperature.".into(),
            metadata: BTreeMap::new(),
            updated_at: Utc.with_ymd_and_hms(2025, 4, 2, 8, 0, 0).unwrap(),
            deleted: false,
        }
    }

    #[test]
    fn embedding_text_is_deterministic_and_ordered() {
        let mut r = record(1);
        r.metadata
            .insert("region".into(), crate::models::MetadataValue::Text("NA".into()));
        r.metadata
            .insert("draft".into(), crate::models::MetadataValue::Bool(false));
        let a = IndexWriter::embedding_text(&r);
        let b = IndexWriter::embedding_text(&r);
        assert_eq!(a, b);
        // BTreeMap iteration puts draft before region.
        assert!(a.find("draft").unwrap() < a.find("region").unwrap());
    }

    #[tokio::test]
    async fn upsert_twice_stores_one_identical_document() {
        let index = Arc::new(MemoryIndex::new());
        let writer = IndexWriter::new(Arc::new(StubEmbedder), index.clone(), policy());

        let r = record(7);
        let first = writer.upsert(&r).await.unwrap();
        let second = writer.upsert(&r).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(7).await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn rejects_textless_records_permanently() {
        let writer = IndexWriter::new(Arc::new(StubEmbedder), Arc::new(MemoryIndex::new()), policy());
        let mut r = record(9);
        r.title = "  ".into();
        r.body = String::new();
        let err = writer.upsert(&r).await.unwrap_err();
        assert!(matches!(err, PipelineError::PermanentRecord { id: 9, .. }));
    }

    #[tokio::test]
    async fn delete_missing_id_is_ok() {
        let writer = IndexWriter::new(Arc::new(StubEmbedder), Arc::new(MemoryIndex::new()), policy());
        writer.delete(12345).await.unwrap();
    }
}
