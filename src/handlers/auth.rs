use std::sync::Arc;

use axum::{extract::State, Extension, Json};
use rand::Rng;
use tracing::info;

use crate::auth::{hash_password, validate_password_policy, verify_password, CurrentUser};
use crate::models::{
    LoginRequest, LoginResponse, MeResponse, RegisterRequest, ResetPasswordRequest,
    SendCodeRequest, SendCodeResponse, SuccessResponse,
};
use crate::state::AppState;
use crate::utils::error::ApiError;

fn generate_code() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000))
}

fn validate_email(email: &str) -> Result<(), ApiError> {
    let valid = email.contains('@') && email.len() >= 3 && !email.starts_with('@');
    if valid {
        Ok(())
    } else {
        Err(ApiError::Validation("Invalid email address".into()))
    }
}

/// POST /auth/send-code
pub async fn send_code(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendCodeRequest>,
) -> Result<Json<SendCodeResponse>, ApiError> {
    validate_email(&req.email)?;

    if state
        .repository
        .email_exists(&req.email)
        .await
        .map_err(ApiError::from)?
    {
        return Err(ApiError::Validation("Email already registered".into()));
    }

    let code = generate_code();
    state.app_store.set_verification_code(&req.email, &code);
    state
        .email
        .send_verification_code(&req.email, &code)
        .await
        .map_err(ApiError::Provider)?;

    info!(email = %req.email, "Verification code issued");
    Ok(Json(SendCodeResponse {
        success: true,
        message: "Verification code sent".into(),
        dev_code: state.email.reveals_dev_code().then_some(code),
    }))
}

/// POST /auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    if let Err(retry_after) = state.rate_limiter.check(&req.username, "register", 1) {
        return Err(ApiError::RateLimited { retry_after });
    }

    if req.username.trim().is_empty() {
        return Err(ApiError::Validation("Username is required".into()));
    }
    validate_email(&req.email)?;
    validate_password_policy(&req.password).map_err(ApiError::Validation)?;

    if !state.app_store.verify_code(&req.email, &req.verification_code) {
        return Err(ApiError::Validation(
            "Invalid or expired verification code".into(),
        ));
    }

    let hashed = hash_password(&req.password)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let user = state
        .repository
        .create_user(req.username.trim(), &req.email, &hashed)
        .await
        .map_err(ApiError::from)?;

    info!(user_id = user.id, username = %user.username, "User registered");
    Ok(Json(SuccessResponse { success: true }))
}

/// POST /auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    if let Err(retry_after) = state.rate_limiter.check(&req.username, "login", 1) {
        return Err(ApiError::RateLimited { retry_after });
    }

    let user = state
        .repository
        .get_user_by_username(&req.username)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::Auth("Invalid username or password".into()))?;

    let valid = verify_password(&req.password, &user.hashed_password)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if !valid {
        return Err(ApiError::Auth("Invalid username or password".into()));
    }

    let token = state
        .jwt
        .generate_token(user.id, &user.username)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(user_id = user.id, "Login successful");
    Ok(Json(LoginResponse {
        access_token: token,
        token_type: "bearer".into(),
    }))
}

/// POST /auth/reset-password
pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    validate_email(&req.email)?;
    validate_password_policy(&req.new_password).map_err(ApiError::Validation)?;

    if !state.app_store.verify_code(&req.email, &req.verification_code) {
        return Err(ApiError::Validation(
            "Invalid or expired verification code".into(),
        ));
    }

    let hashed = hash_password(&req.new_password)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let updated = state
        .repository
        .update_user_password(&req.email, &hashed)
        .await
        .map_err(ApiError::from)?;

    if !updated {
        return Err(ApiError::Validation("No account for this email".into()));
    }

    Ok(Json(SuccessResponse { success: true }))
}

/// GET /auth/me
pub async fn me(Extension(CurrentUser(user)): Extension<CurrentUser>) -> Json<MeResponse> {
    Json(MeResponse {
        id: user.id,
        nickname: user.username.clone(),
        username: user.username,
    })
}
