use std::sync::Arc;

use axum::{
    extract::{Multipart, Query, State},
    Extension, Json,
};
use tracing::info;

use crate::auth::CurrentUser;
use crate::models::{DocumentsStatusResponse, SuccessResponse, UploadQuery, UploadResponse};
use crate::state::AppState;
use crate::utils::error::ApiError;

/// POST /documents/upload?conversation_id=N (multipart `file`)
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut filename: Option<String> = None;
    let mut data: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("Malformed multipart body: {}", e)))?
    {
        if field.name() == Some("file") {
            filename = field.file_name().map(|s| s.to_string());
            data = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Validation(format!("Failed to read file: {}", e)))?
                    .to_vec(),
            );
        }
    }

    let filename = filename.ok_or_else(|| ApiError::Validation("file is required".into()))?;
    let data = data.ok_or_else(|| ApiError::Validation("file is required".into()))?;

    info!(username = %user.username, filename, bytes = data.len(), "Upload received");

    let outcome = state
        .ingest_service
        .upload(&user, query.conversation_id, &filename, &data)
        .await?;

    Ok(Json(UploadResponse {
        success: true,
        filename: outcome.filename,
        conversation_id: outcome.conversation_id,
    }))
}

/// GET /documents/status
pub async fn status(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Json<DocumentsStatusResponse> {
    let session = state.app_store.ensure_session(&user.username);
    Json(DocumentsStatusResponse {
        documents_loaded: session.documents_loaded,
    })
}

/// POST /documents/clear
pub async fn clear(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state.ingest_service.clear_documents(&user).await?;
    Ok(Json(SuccessResponse { success: true }))
}
