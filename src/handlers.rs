use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::prompt::{self, EvaluateRequest};
use crate::prompt_store::{self, PromptConfig};
use crate::relay::{self, CLIENT_STREAM_HEADER, RelayMode};
use crate::upstream::{self, UpstreamRequestMeta};
use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{AsHeaderName, CACHE_CONTROL, CONTENT_TYPE, HeaderName, ORIGIN};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::convert::Infallible;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

fn parse_json_body<T: DeserializeOwned>(body: &[u8]) -> AppResult<T> {
    serde_json::from_slice(body).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("invalid JSON body: {err}"),
        )
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub async fn evaluate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let Some(api_key) = state.upstream.api_key.as_deref() else {
        return Err(AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "api_key_missing",
            "OpenRouter API key not configured",
        ));
    };

    let req: EvaluateRequest = parse_json_body(&body)?;
    let (Some(model), Some(user_prompt)) = (req.model(), req.prompt()) else {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Model and prompt are required",
        ));
    };

    let mode = RelayMode::from_header(header_str(&headers, CLIENT_STREAM_HEADER));
    metrics::counter!("masseval_evaluate_requests_total", "mode" => mode.as_str()).increment(1);

    let system_prompt = prompt::compose_system_prompt(&req);
    let upstream_body = prompt::build_upstream_body(
        &state.upstream,
        model,
        system_prompt.as_deref(),
        user_prompt,
    );
    let meta = UpstreamRequestMeta {
        origin: header_str(&headers, ORIGIN),
    };

    let resp = match upstream::call_chat_completions_stream(
        &state.http,
        &state.upstream,
        api_key,
        meta,
        &upstream_body,
    )
    .await
    {
        Ok(resp) => resp,
        Err(err) => {
            metrics::counter!("masseval_upstream_errors_total", "kind" => err.kind.as_str())
                .increment(1);
            tracing::warn!(
                model = %model,
                kind = err.kind.as_str(),
                status = ?err.status,
                "upstream call failed: {}",
                err.message
            );
            return Err(err.into());
        }
    };

    tracing::info!(
        model = %model,
        mode = mode.as_str(),
        has_system_prompt = system_prompt.is_some(),
        "relay started"
    );
    let rx = relay::spawn_relay(resp.bytes_stream(), mode, model.to_string());
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok::<_, Infallible>);

    Ok((
        [
            (CONTENT_TYPE, mode.content_type().to_string()),
            (CACHE_CONTROL, "no-cache".to_string()),
            (X_ACCEL_BUFFERING, "no".to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

fn prompt_config_json(config: PromptConfig) -> Value {
    json!({
        "systemPrompt": config.system_prompt,
        "rulesList": config.rules_list,
    })
}

pub async fn get_system_prompt(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    state.auth.require_session(&headers).await?;
    let config = prompt_store::load_prompt_config(state.prompt_store.as_ref())
        .await
        .map_err(|err| {
            tracing::error!("failed to read system prompt or rules: {err}");
            AppError::internal("Failed to read system prompt or rules")
        })?;
    Ok(Json(prompt_config_json(config)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavePromptRequest {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub rules_list: Option<Vec<Value>>,
}

/// Whole-file writes; fields left out of the body keep their stored value.
pub async fn save_system_prompt(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    state.auth.require_session(&headers).await?;
    let req: SavePromptRequest = parse_json_body(&body)?;
    let store = state.prompt_store.as_ref();

    let saved = async {
        if let Some(system_prompt) = req.system_prompt.as_deref() {
            prompt_store::save_system_prompt(store, system_prompt).await?;
        }
        if let Some(rules) = req.rules_list.as_deref() {
            prompt_store::save_rules_list(store, rules).await?;
        }
        Ok::<_, String>(())
    }
    .await;
    saved.map_err(|err| {
        tracing::error!("failed to save system prompt or rules: {err}");
        AppError::internal("Failed to save system prompt or rules")
    })?;

    tracing::info!(
        system_prompt = req.system_prompt.is_some(),
        rules = req.rules_list.as_ref().map(Vec::len),
        "grader prompt config saved"
    );
    Ok(Json(json!({ "success": true })))
}
