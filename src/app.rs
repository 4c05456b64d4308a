use crate::auth::AuthState;
use crate::config::{UpstreamConfig, env_non_empty, resolve_data_dir, resolve_database_dsn};
use crate::error::{AppError, AppResult};
use crate::prompt_store::{FilePromptStore, PromptStore};
use crate::users::UserStore;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tokio::time::sleep;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub upstream: Arc<UpstreamConfig>,
    pub auth: AuthState,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub user_store: UserStore,
    pub prompt_store: Arc<dyn PromptStore>,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const MAX_REQUEST_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    /// Holds the system prompt and rules files.
    pub data_dir: PathBuf,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_non_empty("MASSEVAL_LISTEN").unwrap_or_else(|| "0.0.0.0:3001".to_string());
        let metrics_path =
            env_non_empty("MASSEVAL_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        Self {
            listen,
            metrics_path,
            database_dsn: resolve_database_dsn(),
            data_dir: resolve_data_dir(),
        }
    }
}

fn init_error(code: &str, message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    load_state_with_config(runtime, UpstreamConfig::from_env()).await
}

pub async fn load_state_with_config(
    runtime: RuntimeConfig,
    upstream: UpstreamConfig,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("masseval/0.1")
        .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
        .build()
        .map_err(|err| init_error("http_client_init_failed", err.to_string()))?;

    ensure_sqlite_file(&runtime.database_dsn)
        .map_err(|err| init_error("database_init_failed", err))?;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| init_error("database_dsn_parse_failed", err.to_string()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5)),
        )
        .await
        .map_err(|err| init_error("database_init_failed", err.to_string()))?;

    let user_store = UserStore::new(pool)
        .await
        .map_err(|err| init_error("user_store_init_failed", err))?;
    let auth = AuthState::new(user_store.clone());
    let prompt_store: Arc<dyn PromptStore> =
        Arc::new(FilePromptStore::new(runtime.data_dir.clone()));

    let metrics = init_metrics()?;

    if upstream.api_key.is_none() {
        tracing::warn!("OPENROUTER_API_KEY is not set; /api/evaluate will fail until it is");
    }

    spawn_session_purge(user_store.clone());

    Ok(AppState {
        runtime: Arc::new(runtime),
        upstream: Arc::new(upstream),
        auth,
        http,
        metrics,
        user_store,
        prompt_store,
    })
}

fn spawn_session_purge(user_store: UserStore) {
    tokio::spawn(async move {
        loop {
            sleep(SESSION_PURGE_INTERVAL).await;
            match user_store.purge_expired_sessions().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "expired sessions removed"),
                Err(err) => tracing::warn!("failed to purge expired sessions: {err}"),
            }
        }
    });
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(init_error("metrics_init_failed", err.to_string()));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| init_error("metrics_init_failed", "metrics recorder not available"))
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route(&metrics_path, get(crate::handlers::metrics))
        .nest("/api", build_api_router(&metrics_path))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
}

fn build_api_router(metrics_path: &str) -> Router<AppState> {
    Router::new()
        .route("/evaluate", post(crate::handlers::evaluate))
        .route(
            "/system-prompt",
            get(crate::handlers::get_system_prompt).post(crate::handlers::save_system_prompt),
        )
        .route(metrics_path, get(crate::handlers::metrics))
        .route("/auth/check-init", get(crate::auth_handlers::check_init))
        .route("/auth/init", post(crate::auth_handlers::init))
        .route("/auth/login", post(crate::auth_handlers::login))
        .route("/auth/logout", post(crate::auth_handlers::logout))
        .route("/auth/session", get(crate::auth_handlers::session))
}
