use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, info, warn};

use super::math::{batch_cosine_similarity, pack_embedding, top_k_indices, unpack_embedding};

/// A search result: chunk text with its cosine similarity to the query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk_text: String,
    pub similarity: f32,
}

/// Document payload for ingestion. The summary is used only by the
/// two-level index; the flat index ignores it.
pub struct NewDocument<'a> {
    pub filename: &'a str,
    pub chunks: &'a [String],
    pub embeddings: &'a [Vec<f32>],
    pub summary: Option<(&'a str, &'a [f32])>,
    pub conversation_id: i64,
}

/// A conversation-scoped vector index over one tenant's chunk store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn add_document(&self, doc: NewDocument<'_>) -> Result<i64>;

    /// A search without a conversation id returns the empty set: chunks
    /// are only ever visible inside the conversation they were ingested
    /// into, and orphaned (NULL-bound) chunks are visible nowhere.
    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        conversation_id: Option<i64>,
    ) -> Result<Vec<ScoredChunk>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorStoreStats {
    pub documents: i64,
    pub chunks: i64,
}

/// One tenant's vector database: a dedicated SQLite file holding the
/// documents and chunk embeddings for that user only. Tenant isolation is
/// structural — different users never share a file.
pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .with_context(|| format!("Invalid vector store path: {}", path.display()))?
            .create_if_missing(true);
        Self::build(options, 4).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::build(options, 1).await
    }

    async fn build(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .pragma("temp_store", "MEMORY");

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .context("Failed to open vector store")?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL,
                file_hash TEXT UNIQUE NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )"#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                conversation_id INTEGER,
                chunk_text TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                embedding BLOB NOT NULL
            )"#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS document_summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                conversation_id INTEGER,
                summary_text TEXT NOT NULL,
                summary_embedding BLOB NOT NULL,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                avg_chunk_length REAL NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&pool)
        .await?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_conversation ON chunks(conversation_id)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_doc_conv \
             ON chunks(document_id, conversation_id)",
            "CREATE INDEX IF NOT EXISTS idx_summaries_conversation \
             ON document_summaries(conversation_id)",
            "CREATE INDEX IF NOT EXISTS idx_summaries_document \
             ON document_summaries(document_id)",
        ] {
            sqlx::query(stmt).execute(&pool).await?;
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Upsert the document row (replacing an earlier upload of the same
    /// file) and bulk-insert its chunks inside one transaction.
    pub async fn add_document(&self, doc: &NewDocument<'_>) -> Result<i64> {
        anyhow::ensure!(
            doc.chunks.len() == doc.embeddings.len(),
            "chunk/embedding count mismatch: {} != {}",
            doc.chunks.len(),
            doc.embeddings.len()
        );

        let file_hash = filename_fingerprint(doc.filename);
        let mut tx = self.pool.begin().await?;

        // REPLACE drops the old document row on re-upload; its chunks and
        // summary go with it via the cascade.
        let doc_id: i64 = sqlx::query(
            "INSERT OR REPLACE INTO documents (filename, file_hash) VALUES (?, ?) RETURNING id",
        )
        .bind(doc.filename)
        .bind(&file_hash)
        .fetch_one(&mut *tx)
        .await?
        .get(0);

        if let Some((summary_text, summary_embedding)) = doc.summary {
            let avg_chunk_length = if doc.chunks.is_empty() {
                0.0
            } else {
                doc.chunks.iter().map(|c| c.chars().count()).sum::<usize>() as f64
                    / doc.chunks.len() as f64
            };
            sqlx::query(
                r#"INSERT INTO document_summaries
                   (document_id, conversation_id, summary_text, summary_embedding,
                    chunk_count, avg_chunk_length)
                   VALUES (?, ?, ?, ?, ?, ?)"#,
            )
            .bind(doc_id)
            .bind(doc.conversation_id)
            .bind(summary_text)
            .bind(pack_embedding(summary_embedding))
            .bind(doc.chunks.len() as i64)
            .bind(avg_chunk_length)
            .execute(&mut *tx)
            .await?;
        }

        for (index, (chunk, embedding)) in doc.chunks.iter().zip(doc.embeddings.iter()).enumerate()
        {
            sqlx::query(
                r#"INSERT INTO chunks
                   (document_id, conversation_id, chunk_text, chunk_index, embedding)
                   VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(doc_id)
            .bind(doc.conversation_id)
            .bind(chunk)
            .bind(index as i64)
            .bind(pack_embedding(embedding))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            filename = doc.filename,
            chunks = doc.chunks.len(),
            conversation_id = doc.conversation_id,
            "Bulk inserted document"
        );
        Ok(doc_id)
    }

    /// Conversation-scoped candidate load and vectorized top-k.
    pub async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        conversation_id: Option<i64>,
    ) -> Result<Vec<ScoredChunk>> {
        let Some(conversation_id) = conversation_id else {
            warn!("Search without conversation_id, returning empty");
            return Ok(Vec::new());
        };
        self.search_scoped(query_embedding, top_k, conversation_id, None)
            .await
    }

    /// Shared scan used by both index flavors. `document_ids` restricts
    /// the candidate set for the two-level funnel.
    pub(super) async fn search_scoped(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        conversation_id: i64,
        document_ids: Option<&[i64]>,
    ) -> Result<Vec<ScoredChunk>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        // Load enough candidates for a meaningful ranking without pulling
        // the whole conversation into memory.
        let limit = (top_k * 50).clamp(100, 500) as i64;

        let rows = match document_ids {
            Some(ids) if !ids.is_empty() => {
                let placeholders = vec!["?"; ids.len()].join(",");
                let sql = format!(
                    "SELECT chunk_text, embedding FROM chunks \
                     WHERE conversation_id = ? AND document_id IN ({}) \
                     ORDER BY id LIMIT ?",
                    placeholders
                );
                let mut query = sqlx::query(&sql).bind(conversation_id);
                for id in ids {
                    query = query.bind(*id);
                }
                query.bind(limit).fetch_all(&self.pool).await?
            }
            Some(_) => return Ok(Vec::new()),
            None => {
                sqlx::query(
                    "SELECT chunk_text, embedding FROM chunks \
                     WHERE conversation_id = ? ORDER BY id LIMIT ?",
                )
                .bind(conversation_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut texts = Vec::with_capacity(rows.len());
        let mut matrix = Vec::with_capacity(rows.len());
        for row in &rows {
            texts.push(row.get::<String, _>(0));
            matrix.push(unpack_embedding(row.get::<&[u8], _>(1)));
        }

        let similarities = batch_cosine_similarity(&matrix, query_embedding);
        let results: Vec<ScoredChunk> = top_k_indices(&similarities, top_k)
            .into_iter()
            .map(|i| ScoredChunk {
                chunk_text: texts[i].clone(),
                similarity: similarities[i],
            })
            .collect();

        debug!(
            scanned = rows.len(),
            returned = results.len(),
            conversation_id,
            "Vector search complete"
        );
        Ok(results)
    }

    pub async fn chunk_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn has_conversation_chunks(&self, conversation_id: i64) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE conversation_id = ?")
                .bind(conversation_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Remove pre-migration chunks with no conversation binding. They are
    /// already invisible to search; this reclaims the space.
    pub async fn purge_orphans(&self) -> Result<u64> {
        let affected = sqlx::query("DELETE FROM chunks WHERE conversation_id IS NULL")
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected > 0 {
            info!(purged = affected, "Purged orphan chunks");
        }
        Ok(affected)
    }

    pub async fn delete_conversation_chunks(&self, conversation_id: i64) -> Result<u64> {
        let affected = sqlx::query("DELETE FROM chunks WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM document_summaries WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(affected)
    }

    pub async fn stats(&self) -> Result<VectorStoreStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunks = self.chunk_count().await?;
        Ok(VectorStoreStats { documents, chunks })
    }
}

#[async_trait]
impl VectorIndex for VectorStore {
    async fn add_document(&self, doc: NewDocument<'_>) -> Result<i64> {
        VectorStore::add_document(self, &doc).await
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        conversation_id: Option<i64>,
    ) -> Result<Vec<ScoredChunk>> {
        VectorStore::search(self, query_embedding, top_k, conversation_id).await
    }
}

/// Stable fingerprint for a filename, used for upsert-on-reupload.
fn filename_fingerprint(filename: &str) -> String {
    hex::encode(Sha256::digest(filename.as_bytes()))
}

/// Opens and caches one `VectorStore` per tenant. The index flavor is
/// picked per tenant: flat until the corpus outgrows the two-level
/// threshold, two-level after.
pub struct VectorStoreManager {
    data_dir: PathBuf,
    two_level_threshold: i64,
    stores: DashMap<String, Arc<VectorStore>>,
}

impl VectorStoreManager {
    pub fn new(data_dir: impl Into<PathBuf>, two_level_threshold: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            two_level_threshold: two_level_threshold as i64,
            stores: DashMap::new(),
        }
    }

    pub async fn store_for(&self, username: &str) -> Result<Arc<VectorStore>> {
        if let Some(store) = self.stores.get(username) {
            return Ok(store.clone());
        }

        let path = self
            .data_dir
            .join(format!("vector_store_{}.db", sanitize_tenant(username)));
        let store = Arc::new(VectorStore::open(&path).await?);
        self.stores.insert(username.to_string(), store.clone());
        info!(username, path = %path.display(), "Opened tenant vector store");
        Ok(store)
    }

    /// Strategy selection: large corpora get the summary-prefiltered index.
    pub async fn index_for(&self, username: &str) -> Result<Arc<dyn VectorIndex>> {
        let store = self.store_for(username).await?;
        let chunks = store.chunk_count().await?;
        if chunks > self.two_level_threshold {
            debug!(username, chunks, "Using two-level index");
            Ok(Arc::new(super::two_level::TwoLevelIndex::new(store)))
        } else {
            Ok(store)
        }
    }
}

/// Tenant names become file names; keep them path-safe.
fn sanitize_tenant(username: &str) -> String {
    username
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(direction: f32) -> Vec<f32> {
        vec![direction.cos(), direction.sin(), 0.0]
    }

    async fn store_with_chunks(
        conversation_id: i64,
        chunks: &[(&str, Vec<f32>)],
    ) -> VectorStore {
        let store = VectorStore::open_in_memory().await.unwrap();
        let texts: Vec<String> = chunks.iter().map(|(t, _)| t.to_string()).collect();
        let embeddings: Vec<Vec<f32>> = chunks.iter().map(|(_, e)| e.clone()).collect();
        store
            .add_document(&NewDocument {
                filename: "doc.pdf",
                chunks: &texts,
                embeddings: &embeddings,
                summary: None,
                conversation_id,
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn search_without_conversation_returns_empty() {
        let store = store_with_chunks(5, &[("hello", embedding(0.0))]).await;
        let results = store.search(&embedding(0.0), 5, None).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn search_is_conversation_scoped() {
        let store = VectorStore::open_in_memory().await.unwrap();
        let shared = embedding(0.0);
        for (conv, text) in [(1i64, "alpha"), (2, "beta")] {
            store
                .add_document(&NewDocument {
                    filename: &format!("doc{}.pdf", conv),
                    chunks: &[text.to_string()],
                    embeddings: std::slice::from_ref(&shared),
                    summary: None,
                    conversation_id: conv,
                })
                .await
                .unwrap();
        }

        let results = store.search(&shared, 10, Some(1)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_text, "alpha");
    }

    #[tokio::test]
    async fn orphan_chunks_are_invisible_and_purgeable() {
        let store = store_with_chunks(1, &[("kept", embedding(0.0))]).await;
        // Simulate pre-migration data.
        sqlx::query(
            "INSERT INTO chunks (document_id, conversation_id, chunk_text, chunk_index, embedding) \
             VALUES (1, NULL, 'orphan', 99, ?)",
        )
        .bind(pack_embedding(&embedding(0.0)))
        .execute(store.pool())
        .await
        .unwrap();

        let results = store.search(&embedding(0.0), 10, Some(1)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_text, "kept");

        assert_eq!(store.purge_orphans().await.unwrap(), 1);
        assert_eq!(store.chunk_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn search_ranks_by_similarity() {
        let store = store_with_chunks(
            1,
            &[
                ("far", embedding(1.2)),
                ("near", embedding(0.1)),
                ("exact", embedding(0.0)),
            ],
        )
        .await;

        let results = store.search(&embedding(0.0), 2, Some(1)).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_text, "exact");
        assert_eq!(results[1].chunk_text, "near");
        assert!(results[0].similarity >= results[1].similarity);
    }

    #[tokio::test]
    async fn embeddings_survive_storage_bit_exact() {
        let original = vec![0.123f32, -45.678, 1e-20, 3.2e12];
        let store = store_with_chunks(1, &[("c", original.clone())]).await;

        let blob: Vec<u8> = sqlx::query_scalar("SELECT embedding FROM chunks LIMIT 1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let decoded = unpack_embedding(&blob);
        for (a, b) in original.iter().zip(decoded.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[tokio::test]
    async fn reupload_replaces_document() {
        let store = store_with_chunks(1, &[("v1", embedding(0.0))]).await;
        store
            .add_document(&NewDocument {
                filename: "doc.pdf",
                chunks: &["v2".to_string()],
                embeddings: &[embedding(0.0)],
                summary: None,
                conversation_id: 1,
            })
            .await
            .unwrap();

        let results = store.search(&embedding(0.0), 10, Some(1)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_text, "v2");
    }

    #[tokio::test]
    async fn tenant_files_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let manager = VectorStoreManager::new(dir.path(), 1000);

        let alice = manager.store_for("alice").await.unwrap();
        let bob = manager.store_for("bob").await.unwrap();

        alice
            .add_document(&NewDocument {
                filename: "secret.pdf",
                chunks: &["alice secret".to_string()],
                embeddings: &[embedding(0.0)],
                summary: None,
                conversation_id: 1,
            })
            .await
            .unwrap();

        // Bob searching the same conversation id sees nothing.
        let results = bob.search(&embedding(0.0), 10, Some(1)).await.unwrap();
        assert!(results.is_empty());

        assert!(dir.path().join("vector_store_alice.db").exists());
        assert!(dir.path().join("vector_store_bob.db").exists());
    }
}
