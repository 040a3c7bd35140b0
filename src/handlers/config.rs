use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, Extension, Json};
use tracing::info;

use crate::auth::CurrentUser;
use crate::models::{ConfigRequest, ConfigResponse, SuccessResponse};
use crate::services::{HttpEmbedder, HttpLlmClient, HttpReranker};
use crate::state::AppState;
use crate::store::UserConfig;
use crate::utils::error::ApiError;
use crate::utils::sanitize::sanitize_error_message;

const DEFAULT_MODEL: &str = "gpt-4-turbo";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-large";
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// POST /config — build and store the user's provider clients.
pub async fn set_config(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<ConfigRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    if let Err(retry_after) = state.rate_limiter.check(&user.username, "config_update", 1) {
        return Err(ApiError::RateLimited { retry_after });
    }

    if req.api_key.trim().is_empty() {
        return Err(ApiError::Validation("apiKey is required".into()));
    }
    if req.base_url.trim().is_empty() || !req.base_url.starts_with("http") {
        return Err(ApiError::Validation("baseUrl must be an http(s) URL".into()));
    }

    let model = req.model.as_deref().unwrap_or(DEFAULT_MODEL).to_string();
    let embedding_model = req
        .embedding_model
        .as_deref()
        .unwrap_or(DEFAULT_EMBEDDING_MODEL)
        .to_string();

    let embedder = Arc::new(HttpEmbedder::new(
        &req.api_key,
        &req.base_url,
        &embedding_model,
        Some(state.limiters.clone()),
    ));
    let llm = Arc::new(HttpLlmClient::new(
        &req.api_key,
        &req.base_url,
        &model,
        Some(state.limiters.clone()),
    ));

    // Lazy and bounded: a slow reranker endpoint downgrades this user to
    // no-rerank instead of stalling the config save past the ceiling.
    let reranker = match (&req.reranker_key, &req.reranker_base_url) {
        (Some(key), Some(base)) if !key.trim().is_empty() && !base.trim().is_empty() => {
            HttpReranker::initialize(key, base)
                .await
                .map(|r| Arc::new(r) as Arc<dyn crate::services::RerankerProvider>)
        }
        _ => None,
    };

    state.app_store.set_config(
        &user.username,
        UserConfig {
            api_key: req.api_key,
            base_url: req.base_url,
            model,
            embedding_model,
            reranker_key: req.reranker_key,
            reranker_base_url: req.reranker_base_url,
            llm,
            embedder,
            reranker,
        },
    );

    info!(username = %user.username, "API configuration saved");
    Ok(Json(SuccessResponse { success: true }))
}

/// GET /config — redacted view; the key never leaves the process.
pub async fn get_config(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Json<ConfigResponse> {
    match state.app_store.get_config(&user.username) {
        Some(config) => Json(ConfigResponse {
            configured: true,
            api_key: Some("***".into()),
            base_url: Some(config.base_url),
            model: Some(config.model),
            embedding_model: Some(config.embedding_model),
            reranker_configured: config.reranker.is_some(),
        }),
        None => Json(ConfigResponse {
            configured: false,
            api_key: None,
            base_url: None,
            model: None,
            embedding_model: None,
            reranker_configured: false,
        }),
    }
}

/// POST /config/test — probe each configured provider with a short
/// timeout; the result map never carries raw provider errors.
pub async fn test_config(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<HashMap<String, String>>, ApiError> {
    let config = state
        .app_store
        .get_config(&user.username)
        .ok_or(ApiError::ConfigMissing)?;

    let mut status = HashMap::new();

    let llm_status = match tokio::time::timeout(TEST_TIMEOUT, config.llm.test_connection()).await {
        Ok(Ok(())) => "ok".to_string(),
        Ok(Err(e)) => format!("error: {}", sanitize_error_message(e.kind.user_message())),
        Err(_) => "error: timeout".to_string(),
    };
    status.insert("llm".into(), llm_status);

    let embed_status =
        match tokio::time::timeout(TEST_TIMEOUT, config.embedder.embed_one("ping")).await {
            Ok(Ok(_)) => "ok".to_string(),
            Ok(Err(e)) => format!("error: {}", sanitize_error_message(e.kind.user_message())),
            Err(_) => "error: timeout".to_string(),
        };
    status.insert("embedding".into(), embed_status);

    status.insert(
        "reranker".into(),
        if config.reranker.is_some() {
            "ok".to_string()
        } else {
            "not_configured".to_string()
        },
    );

    Ok(Json(status))
}
