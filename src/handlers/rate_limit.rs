use std::collections::HashMap;
use std::sync::Arc;

use axum::{extract::State, Extension, Json};

use crate::auth::CurrentUser;
use crate::state::AppState;
use crate::utils::rate_limit::QuotaInfo;

const QUOTA_OPERATIONS: &[&str] = &[
    "chat",
    "upload",
    "voice",
    "login",
    "register",
    "config_update",
    "search",
    "api_default",
];

/// GET /rate-limit/quota
pub async fn quota(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Json<HashMap<String, QuotaInfo>> {
    let quotas = QUOTA_OPERATIONS
        .iter()
        .map(|op| (op.to_string(), state.rate_limiter.quota(&user.username, op)))
        .collect();
    Json(quotas)
}
