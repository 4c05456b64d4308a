use std::path::PathBuf;

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MAX_TOKENS: u32 = 4000;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_REFERER: &str = "http://localhost:3000";
pub const DEFAULT_APP_TITLE: &str = "Mass Evaluation Tool";

/// Settings for the chat-completions provider behind `/api/evaluate`.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Missing key is reported per request, never at startup.
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub default_referer: String,
    pub app_title: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            api_key: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            default_referer: DEFAULT_REFERER.to_string(),
            app_title: DEFAULT_APP_TITLE.to_string(),
        }
    }
}

impl UpstreamConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env_non_empty("OPENROUTER_BASE_URL").unwrap_or(defaults.base_url),
            api_key: env_non_empty("OPENROUTER_API_KEY"),
            max_tokens: env_non_empty("MASSEVAL_MAX_TOKENS")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_tokens),
            temperature: defaults.temperature,
            default_referer: env_non_empty("MASSEVAL_REFERER").unwrap_or(defaults.default_referer),
            app_title: env_non_empty("MASSEVAL_APP_TITLE").unwrap_or(defaults.app_title),
        }
    }
}

pub fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn resolve_database_dsn() -> String {
    env_non_empty("MASSEVAL_DATABASE_DSN")
        .or_else(|| env_non_empty("DATABASE_URL"))
        .unwrap_or_else(|| "sqlite://./data/auth.db".to_string())
}

pub fn resolve_data_dir() -> PathBuf {
    env_non_empty("MASSEVAL_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./data"))
}
