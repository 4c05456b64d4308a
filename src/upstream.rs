use crate::config::UpstreamConfig;
use crate::error::AppError;
use axum::http::StatusCode;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

impl UpstreamErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamErrorKind::Network => "network",
            UpstreamErrorKind::Http => "http",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

impl From<UpstreamCallError> for AppError {
    fn from(err: UpstreamCallError) -> Self {
        match err.kind {
            UpstreamErrorKind::Network => {
                AppError::new(StatusCode::BAD_GATEWAY, "upstream_unreachable", err.message)
                    .with_type("upstream_error")
            }
            UpstreamErrorKind::Http => {
                let status = err.status.unwrap_or(StatusCode::BAD_GATEWAY);
                let code = err.code.unwrap_or_else(|| "upstream_error".to_string());
                AppError::new(status, code, err.message).with_type("upstream_error")
            }
        }
    }
}

/// Per-request header values that do not come from config.
#[derive(Debug, Clone, Default)]
pub struct UpstreamRequestMeta<'a> {
    /// Client `Origin`, forwarded as `HTTP-Referer`.
    pub origin: Option<&'a str>,
}

/// Opens a streamed chat completion. A non-2xx reply is read in full and
/// turned into an error before any byte is relayed.
pub async fn call_chat_completions_stream(
    client: &reqwest::Client,
    config: &UpstreamConfig,
    api_key: &str,
    meta: UpstreamRequestMeta<'_>,
    body: &Value,
) -> Result<reqwest::Response, UpstreamCallError> {
    let url = join_url(&config.base_url, "/v1/chat/completions");
    let referer = meta
        .origin
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(&config.default_referer);
    let resp = client
        .post(url)
        .bearer_auth(api_key)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .header("HTTP-Referer", referer)
        .header("X-Title", config.app_title.as_str())
        .json(body)
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let message = extract_error_message(&text).unwrap_or_else(|| {
            format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            )
        });
        return Err(
            UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), message)
                .with_code(extract_error_code(&text)),
        );
    }
    Ok(resp)
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn error_field(text: &str, field: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get(field))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

fn extract_error_message(text: &str) -> Option<String> {
    error_field(text, "message")
}

fn extract_error_code(text: &str) -> Option<String> {
    error_field(text, "code")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_collapses_version_prefix() {
        assert_eq!(
            join_url("https://openrouter.ai/api/v1", "/v1/chat/completions"),
            "https://openrouter.ai/api/v1/chat/completions"
        );
        assert_eq!(
            join_url("http://127.0.0.1:9000/", "/v1/chat/completions"),
            "http://127.0.0.1:9000/v1/chat/completions"
        );
    }

    #[test]
    fn error_message_read_from_envelope() {
        let body = r#"{"error":{"message":"Rate limited","code":"rate_limit"}}"#;
        assert_eq!(extract_error_message(body).as_deref(), Some("Rate limited"));
        assert_eq!(extract_error_code(body).as_deref(), Some("rate_limit"));
        // OpenRouter sends numeric codes; those fall back to the default code
        assert_eq!(extract_error_code(r#"{"error":{"code":429}}"#), None);
        assert_eq!(extract_error_message("<html>bad gateway</html>"), None);
    }

    #[test]
    fn http_error_keeps_upstream_status() {
        let err = UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(StatusCode::TOO_MANY_REQUESTS),
            "Rate limited".to_string(),
        );
        let app: AppError = err.into();
        assert_eq!(app.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(app.code, "upstream_error");
        assert_eq!(app.message, "Rate limited");
        assert_eq!(app.error_type, "upstream_error");
    }

    #[test]
    fn network_error_is_bad_gateway() {
        let err = UpstreamCallError::new(
            UpstreamErrorKind::Network,
            None,
            "connection refused".to_string(),
        );
        let app: AppError = err.into();
        assert_eq!(app.status, StatusCode::BAD_GATEWAY);
        assert_eq!(app.code, "upstream_unreachable");
    }
}
