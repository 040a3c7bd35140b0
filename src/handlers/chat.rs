use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use tracing::{info, warn};

use crate::auth::CurrentUser;
use crate::models::{
    ChatRequest, ChatResponse, ConversationListItem, SuccessResponse, UpdateTitleRequest,
};
use crate::services::{CleanupReport, ConversationHealth};
use crate::state::AppState;
use crate::utils::error::ApiError;

/// POST /chat/message
pub async fn message(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let outcome = state
        .chat_service
        .chat_message(
            &user,
            req.conversation_id,
            &req.content,
            req.system_prompt.as_deref(),
        )
        .await?;

    Ok(Json(ChatResponse {
        success: true,
        response: outcome.response,
        conversation_id: outcome.conversation_id,
        suggested_questions: outcome.suggested_questions,
    }))
}

/// GET /chat/conversations
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<Vec<ConversationListItem>>, ApiError> {
    let summaries = state
        .repository
        .get_user_conversations(user.id)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(
        summaries
            .into_iter()
            .map(|c| ConversationListItem {
                id: c.id,
                title: c.title,
                created_at: c.created_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
                updated_at: c.updated_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
                message_count: c.message_count,
            })
            .collect(),
    ))
}

/// DELETE /chat/conversations/{id}
pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let deleted = state
        .repository
        .delete_conversation(conversation_id, user.id)
        .await
        .map_err(ApiError::from)?;

    if !deleted {
        return Err(ApiError::AccessDenied(
            "Conversation not found or access denied".into(),
        ));
    }

    // Vector chunks live in the tenant file; drop them with the
    // conversation so a recreated id can never see stale context.
    if let Ok(store) = state.vector_stores.store_for(&user.username).await {
        if let Err(e) = store.delete_conversation_chunks(conversation_id).await {
            warn!(conversation_id, "Failed to drop conversation chunks: {}", e);
        }
    }

    info!(conversation_id, user_id = user.id, "Conversation deleted");
    Ok(Json(SuccessResponse { success: true }))
}

/// PATCH /chat/conversations/{id}
pub async fn update_title(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(conversation_id): Path<i64>,
    Json(req): Json<UpdateTitleRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let title = req.title.trim();
    if title.is_empty() {
        return Err(ApiError::Validation("Title cannot be empty".into()));
    }

    let updated = state
        .repository
        .update_conversation_title(conversation_id, user.id, title)
        .await
        .map_err(ApiError::from)?;

    if !updated {
        return Err(ApiError::AccessDenied(
            "Conversation not found or access denied".into(),
        ));
    }
    Ok(Json(SuccessResponse { success: true }))
}

/// GET /chat/conversations/{id}/health
pub async fn conversation_health(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let health: ConversationHealth = state.validator.health(conversation_id, user.id).await?;
    Ok(Json(serde_json::json!({ "health": health })))
}

/// POST /chat/conversations/cleanup-expired
pub async fn cleanup_expired(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<CleanupReport>, ApiError> {
    let report = state.validator.cleanup_expired(user.id).await?;

    if !report.deleted_ids.is_empty() {
        if let Ok(store) = state.vector_stores.store_for(&user.username).await {
            for conversation_id in &report.deleted_ids {
                if let Err(e) = store.delete_conversation_chunks(*conversation_id).await {
                    warn!(conversation_id, "Failed to drop conversation chunks: {}", e);
                }
            }
        }
    }

    info!(
        user_id = user.id,
        deleted = report.deleted_count,
        "Expired conversation cleanup"
    );
    Ok(Json(report))
}
