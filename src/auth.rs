use crate::error::{AppError, AppResult};
use crate::users::{Session, UserStore};
use axum::http::HeaderMap;

pub const SESSION_HEADER: &str = "x-session-id";

/// Session validator shared by the gated routes.
#[derive(Clone)]
pub struct AuthState {
    user_store: UserStore,
}

impl AuthState {
    pub fn new(user_store: UserStore) -> Self {
        Self { user_store }
    }

    /// Resolves the caller's session, or fails with a 401.
    pub async fn require_session(&self, headers: &HeaderMap) -> AppResult<Session> {
        let token = extract_session_token(headers)
            .ok_or_else(|| AppError::unauthorized("No session provided"))?;
        let session = self
            .user_store
            .validate_session(&token)
            .await
            .map_err(AppError::internal)?;
        session.ok_or_else(|| AppError::unauthorized("Invalid or expired session"))
    }
}

/// `x-session-id` first, then `Authorization: Bearer`.
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn session_header_wins_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer from-bearer"));
        assert_eq!(extract_session_token(&headers).as_deref(), Some("from-bearer"));

        headers.insert(SESSION_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(extract_session_token(&headers).as_deref(), Some("from-header"));
    }

    #[test]
    fn blank_tokens_are_missing() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("  "));
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(extract_session_token(&headers).is_none());
    }
}
