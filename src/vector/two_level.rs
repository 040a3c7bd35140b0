use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::Row;
use tracing::{debug, warn};

use super::math::{cosine_similarity, unpack_embedding};
use super::store::{NewDocument, ScoredChunk, VectorIndex, VectorStore};

/// Minimum summary similarity for a document to enter stage two.
pub const DEFAULT_DOC_FILTER_THRESHOLD: f32 = 0.6;
/// Stage-two scan is capped to this many documents.
pub const DEFAULT_MAX_DOCUMENTS: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummaryInfo {
    pub document_id: i64,
    pub summary_text: String,
    pub chunk_count: i64,
    pub avg_chunk_length: f64,
}

/// Two-stage funnel over a large corpus: document summaries prefilter the
/// candidate set, then the flat scan runs only over the surviving
/// documents' chunks. Worth the extra bookkeeping once a tenant holds
/// more than ~1000 chunks.
pub struct TwoLevelIndex {
    store: Arc<VectorStore>,
    doc_filter_threshold: f32,
    max_documents: usize,
}

impl TwoLevelIndex {
    pub fn new(store: Arc<VectorStore>) -> Self {
        Self {
            store,
            doc_filter_threshold: DEFAULT_DOC_FILTER_THRESHOLD,
            max_documents: DEFAULT_MAX_DOCUMENTS,
        }
    }

    pub fn with_tuning(store: Arc<VectorStore>, threshold: f32, max_documents: usize) -> Self {
        Self {
            store,
            doc_filter_threshold: threshold,
            max_documents: max_documents.max(1),
        }
    }

    /// Stage one: rank document summaries, keep those above the filter
    /// threshold, best-first, capped.
    async fn select_documents(
        &self,
        query_embedding: &[f32],
        conversation_id: i64,
    ) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT document_id, summary_embedding FROM document_summaries \
             WHERE conversation_id = ? ORDER BY id",
        )
        .bind(conversation_id)
        .fetch_all(self.store.pool())
        .await?;

        let mut scored: Vec<(i64, f32)> = rows
            .iter()
            .map(|row| {
                let doc_id: i64 = row.get(0);
                let embedding = unpack_embedding(row.get::<&[u8], _>(1));
                (doc_id, cosine_similarity(&embedding, query_embedding))
            })
            .filter(|(_, similarity)| *similarity >= self.doc_filter_threshold)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.max_documents);

        debug!(
            candidates = rows.len(),
            selected = scored.len(),
            conversation_id,
            "Document-level prefilter"
        );
        Ok(scored.into_iter().map(|(id, _)| id).collect())
    }

    pub async fn document_summary(&self, document_id: i64) -> Result<Option<DocumentSummaryInfo>> {
        let row = sqlx::query(
            "SELECT document_id, summary_text, chunk_count, avg_chunk_length \
             FROM document_summaries WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_optional(self.store.pool())
        .await?;

        Ok(row.map(|row| DocumentSummaryInfo {
            document_id: row.get(0),
            summary_text: row.get(1),
            chunk_count: row.get(2),
            avg_chunk_length: row.get(3),
        }))
    }
}

#[async_trait]
impl VectorIndex for TwoLevelIndex {
    async fn add_document(&self, doc: NewDocument<'_>) -> Result<i64> {
        if doc.summary.is_none() {
            // Without a summary the document can never pass stage one.
            warn!(
                filename = doc.filename,
                "Two-level ingest without summary; document will be unreachable"
            );
        }
        self.store.add_document(&doc).await
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        conversation_id: Option<i64>,
    ) -> Result<Vec<ScoredChunk>> {
        let Some(conversation_id) = conversation_id else {
            warn!("Two-level search without conversation_id, returning empty");
            return Ok(Vec::new());
        };

        let selected = self
            .select_documents(query_embedding, conversation_id)
            .await?;
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        self.store
            .search_scoped(query_embedding, top_k, conversation_id, Some(&selected))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(direction: f32) -> Vec<f32> {
        vec![direction.cos(), direction.sin(), 0.0]
    }

    async fn two_docs_store() -> Arc<VectorStore> {
        let store = Arc::new(VectorStore::open_in_memory().await.unwrap());

        // Document A points along 0.0, document B along ~1.4 (sim ~0.17).
        for (name, direction, text) in [
            ("a.pdf", 0.0f32, "about apples"),
            ("b.pdf", 1.4, "about bridges"),
        ] {
            let chunk_embedding = embedding(direction);
            let summary_embedding = embedding(direction);
            store
                .add_document(&NewDocument {
                    filename: name,
                    chunks: &[text.to_string()],
                    embeddings: std::slice::from_ref(&chunk_embedding),
                    summary: Some((text, &summary_embedding)),
                    conversation_id: 1,
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn prefilter_excludes_dissimilar_documents() {
        let index = TwoLevelIndex::new(two_docs_store().await);
        let results = index.search(&embedding(0.0), 10, Some(1)).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_text, "about apples");
    }

    #[tokio::test]
    async fn no_conversation_returns_empty() {
        let index = TwoLevelIndex::new(two_docs_store().await);
        assert!(index.search(&embedding(0.0), 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn threshold_zero_admits_everything_up_to_cap() {
        let index = TwoLevelIndex::with_tuning(two_docs_store().await, -1.0, 10);
        let results = index.search(&embedding(0.0), 10, Some(1)).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_text, "about apples");
    }

    #[tokio::test]
    async fn wrong_conversation_sees_nothing() {
        let index = TwoLevelIndex::new(two_docs_store().await);
        assert!(index.search(&embedding(0.0), 10, Some(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summary_metadata_is_stored() {
        let index = TwoLevelIndex::new(two_docs_store().await);
        let summary = index.document_summary(1).await.unwrap().unwrap();
        assert_eq!(summary.chunk_count, 1);
        assert!(!summary.summary_text.is_empty());
    }
}
