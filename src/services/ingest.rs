use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::{Repository, User};
use crate::document::{is_pdf, ChunkStrategy, PdfExtractor, SmartChunker};
use crate::services::session_validator::SessionValidator;
use crate::store::AppStore;
use crate::utils::error::ApiError;
use crate::utils::rate_limit::RateLimiter;
use crate::utils::retry::{retry_provider_call, RetryPolicy};
use crate::vector::{NewDocument, VectorStoreManager};

/// Leading window of the extracted text used as the document summary for
/// the two-level index.
const SUMMARY_WINDOW_CHARS: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub filename: String,
    pub conversation_id: i64,
    pub chunks_created: usize,
}

/// PDF -> chunks -> batched embeddings -> conversation-bound bulk insert.
pub struct IngestService {
    repository: Arc<Repository>,
    validator: Arc<SessionValidator>,
    vector_stores: Arc<VectorStoreManager>,
    app_store: Arc<AppStore>,
    rate_limiter: Arc<RateLimiter>,
    chunker: SmartChunker,
    embed_batch_size: usize,
    upload_dir: PathBuf,
    retry: RetryPolicy,
}

impl IngestService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<Repository>,
        validator: Arc<SessionValidator>,
        vector_stores: Arc<VectorStoreManager>,
        app_store: Arc<AppStore>,
        rate_limiter: Arc<RateLimiter>,
        chunker: SmartChunker,
        embed_batch_size: usize,
        upload_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repository,
            validator,
            vector_stores,
            app_store,
            rate_limiter,
            chunker,
            embed_batch_size: embed_batch_size.max(1),
            upload_dir: upload_dir.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Ingest an uploaded file into the user's vector store, bound to the
    /// given conversation. Everything after the temp write cleans up the
    /// file on failure.
    pub async fn upload(
        &self,
        user: &User,
        conversation_id: Option<i64>,
        filename: &str,
        data: &[u8],
    ) -> Result<UploadOutcome, ApiError> {
        if let Err(retry_after) = self.rate_limiter.check(&user.username, "upload", 1) {
            return Err(ApiError::RateLimited { retry_after });
        }

        let conversation_id = conversation_id.ok_or_else(|| {
            ApiError::Validation("conversation_id is required for document upload".into())
        })?;
        self.validator
            .validate_access(conversation_id, user.id, true)
            .await?;

        if !is_pdf(filename) {
            return Err(ApiError::Validation("Only PDF files are supported".into()));
        }

        if !self.app_store.has_config(&user.username) {
            return Err(ApiError::ConfigMissing);
        }

        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .map_err(|e| ApiError::Ingest(format!("Failed to prepare upload dir: {}", e)))?;
        let stored_name = format!("{}_{}", Uuid::new_v4(), sanitize_filename(filename));
        let file_path = self.upload_dir.join(&stored_name);
        tokio::fs::write(&file_path, data)
            .await
            .map_err(|e| ApiError::Ingest(format!("Failed to persist upload: {}", e)))?;

        match self
            .ingest_file(user, conversation_id, filename, &file_path)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&file_path).await {
                    warn!(path = %file_path.display(), "Failed to remove temp file: {}", rm);
                }
                Err(e)
            }
        }
    }

    async fn ingest_file(
        &self,
        user: &User,
        conversation_id: i64,
        filename: &str,
        file_path: &Path,
    ) -> Result<UploadOutcome, ApiError> {
        let config = self
            .app_store
            .get_config(&user.username)
            .ok_or(ApiError::ConfigMissing)?;

        // PDF parsing is CPU-bound; keep it off the request loop.
        let extract_path = file_path.to_path_buf();
        let parsed = tokio::task::spawn_blocking(move || PdfExtractor::extract(&extract_path))
            .await
            .map_err(|e| ApiError::Internal(format!("Extraction task failed: {}", e)))?
            .map_err(|e| ApiError::Ingest(e.to_string()))?;

        info!(
            filename,
            chars = parsed.content.chars().count(),
            pages = parsed.page_count,
            "Extracted PDF text"
        );

        let chunks = self.chunker.chunk(&parsed.content, ChunkStrategy::Auto);
        if chunks.is_empty() {
            return Err(ApiError::Ingest("No chunks created from document".into()));
        }
        debug!(chunks = chunks.len(), "Chunked document");

        let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
        for (batch_idx, batch) in chunks.chunks(self.embed_batch_size).enumerate() {
            let embedder = config.embedder.clone();
            let batch_owned = batch.to_vec();
            let batch_embeddings = retry_provider_call(self.retry, "embed_batch", move || {
                let embedder = embedder.clone();
                let batch = batch_owned.clone();
                async move { embedder.embed(&batch).await }
            })
            .await
            .map_err(ApiError::Provider)?;
            embeddings.extend(batch_embeddings);
            debug!(batch = batch_idx + 1, "Embedded chunk batch");
        }

        let summary_text: String = parsed.content.chars().take(SUMMARY_WINDOW_CHARS).collect();
        let embedder = config.embedder.clone();
        let summary_owned = summary_text.clone();
        let summary_embedding = retry_provider_call(self.retry, "embed_summary", move || {
            let embedder = embedder.clone();
            let summary = summary_owned.clone();
            async move { embedder.embed_one(&summary).await }
        })
        .await
        .map_err(ApiError::Provider)?;

        let index = self
            .vector_stores
            .index_for(&user.username)
            .await
            .map_err(|e| ApiError::Ingest(e.to_string()))?;
        index
            .add_document(NewDocument {
                filename,
                chunks: &chunks,
                embeddings: &embeddings,
                summary: Some((&summary_text, &summary_embedding)),
                conversation_id,
            })
            .await
            .map_err(|e| ApiError::Ingest(e.to_string()))?;

        self.repository
            .add_user_document(
                user.id,
                conversation_id,
                filename,
                &file_path.display().to_string(),
            )
            .await
            .map_err(ApiError::from)?;

        let path_string = file_path.display().to_string();
        self.app_store.update_session(&user.username, |session| {
            session.documents_loaded = true;
            session.documents.push(path_string.clone());
            if !session.conversations.contains(&conversation_id) {
                session.conversations.push(conversation_id);
            }
        });

        info!(
            user_id = user.id,
            conversation_id,
            filename,
            chunks = chunks.len(),
            "Document ingested"
        );

        Ok(UploadOutcome {
            filename: filename.to_string(),
            conversation_id,
            chunks_created: chunks.len(),
        })
    }

    /// Forget the user's uploaded documents: relational rows plus the
    /// in-memory session flag. Vector chunks stay conversation-bound and
    /// are removed with their conversations.
    pub async fn clear_documents(&self, user: &User) -> Result<u64, ApiError> {
        let removed = self
            .repository
            .delete_user_documents(user.id)
            .await
            .map_err(ApiError::from)?;
        self.app_store.update_session(&user.username, |session| {
            session.documents_loaded = false;
            session.documents.clear();
        });
        info!(user_id = user.id, removed, "Cleared user documents");
        Ok(removed)
    }
}

fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
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

    #[test]
    fn filenames_are_path_safe() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("my file (1).pdf"), "my_file__1_.pdf");
    }
}
