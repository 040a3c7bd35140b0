use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::database::User;
use crate::state::AppState;
use crate::utils::error::ApiError;

/// The authenticated user, attached to the request by the auth layer.
#[derive(Clone)]
pub struct CurrentUser(pub User);

/// Bearer-token gate for everything outside `/auth/*` and `/health`.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Auth("Missing bearer token".into()))?;

    let claims = state
        .jwt
        .validate_token(token)
        .map_err(|_| ApiError::Auth("Invalid or expired token".into()))?;

    let user = state
        .repository
        .get_user_by_id(claims.user_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::Auth("User no longer exists".into()))?;

    request.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(request).await)
}
