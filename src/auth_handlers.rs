use crate::app::AppState;
use crate::auth::extract_session_token;
use crate::error::{AppError, AppResult};
use crate::users::{AuthError, MIN_PASSWORD_LEN};
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct PasswordRequest {
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub success: bool,
    pub session_id: String,
    pub expires_at: String,
    pub message: &'static str,
}

fn required_password(body: PasswordRequest) -> AppResult<String> {
    body.password.filter(|p| !p.is_empty()).ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "password_required",
            "Password is required",
        )
        .with_param("password")
    })
}

pub async fn check_init(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let initialized = state
        .user_store
        .is_initialized()
        .await
        .map_err(AppError::internal)?;
    let message = if initialized {
        "User exists"
    } else {
        "No user found"
    };
    Ok(Json(json!({ "needsInit": !initialized, "message": message })))
}

pub async fn init(
    State(state): State<AppState>,
    Json(body): Json<PasswordRequest>,
) -> AppResult<impl IntoResponse> {
    let password = required_password(body)?;
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_password",
            format!("Password must be at least {MIN_PASSWORD_LEN} characters long"),
        )
        .with_param("password"));
    }

    match state.user_store.initialize_user(&password).await {
        Ok(user) => {
            tracing::info!(user_id = %user.id, "single user initialized");
            Ok(Json(json!({
                "success": true,
                "message": "User initialized successfully",
            })))
        }
        Err(AuthError::AlreadyInitialized) => Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "already_initialized",
            AuthError::AlreadyInitialized.to_string(),
        )),
        Err(err) => Err(AppError::internal(err.to_string())),
    }
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<PasswordRequest>,
) -> AppResult<impl IntoResponse> {
    let password = required_password(body)?;
    let user_id = match state.user_store.authenticate(&password).await {
        Ok(user_id) => user_id,
        Err(err @ (AuthError::NotInitialized | AuthError::InvalidPassword)) => {
            tracing::debug!("login rejected: {err}");
            return Err(AppError::new(
                StatusCode::UNAUTHORIZED,
                "invalid_credentials",
                err.to_string(),
            ));
        }
        Err(err) => return Err(AppError::internal(err.to_string())),
    };

    let session = state
        .user_store
        .create_session(&user_id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(LoginResponse {
        success: true,
        session_id: session.token,
        expires_at: session.expires_at.to_rfc3339(),
        message: "Login successful",
    }))
}

/// Deletes the session named in the body, or the caller's own session when the
/// body names none. Always succeeds for unknown sessions.
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let body: LogoutRequest = serde_json::from_slice(&body).unwrap_or_default();
    let token = body
        .session_id
        .filter(|v| !v.trim().is_empty())
        .or_else(|| extract_session_token(&headers));

    if let Some(token) = token {
        state
            .user_store
            .delete_session(&token)
            .await
            .map_err(AppError::internal)?;
    }

    Ok(Json(json!({
        "success": true,
        "message": "Logout successful",
    })))
}

pub async fn session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let session = state.auth.require_session(&headers).await?;
    Ok(Json(json!({
        "valid": true,
        "expiresAt": session.expires_at.to_rfc3339(),
    })))
}
