use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const SYSTEM_PROMPT_FILE: &str = "agent-completion-grader-sys-prompt.txt";
pub const RULES_FILE: &str = "agent-completion-grader-rules.json";

/// Saved grader configuration: the base system prompt and the rules checklist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptConfig {
    pub system_prompt: String,
    pub rules_list: Vec<Value>,
}

/// Whole-value key/value storage. Writes replace the previous value entirely.
#[async_trait]
pub trait PromptStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>, String>;
    async fn write(&self, key: &str, value: &str) -> Result<(), String>;
}

pub async fn load_prompt_config(store: &dyn PromptStore) -> Result<PromptConfig, String> {
    let system_prompt = store.read(SYSTEM_PROMPT_FILE).await?.unwrap_or_default();
    let rules_raw = store.read(RULES_FILE).await?.unwrap_or_default();
    let rules_list = if rules_raw.trim().is_empty() {
        Vec::new()
    } else {
        match serde_json::from_str::<Value>(&rules_raw).map_err(|e| e.to_string())? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        }
    };
    Ok(PromptConfig {
        system_prompt,
        rules_list,
    })
}

pub async fn save_system_prompt(store: &dyn PromptStore, prompt: &str) -> Result<(), String> {
    store.write(SYSTEM_PROMPT_FILE, prompt).await
}

pub async fn save_rules_list(store: &dyn PromptStore, rules: &[Value]) -> Result<(), String> {
    let text = serde_json::to_string_pretty(rules).map_err(|e| e.to_string())?;
    store.write(RULES_FILE, &text).await
}

/// Files under one data directory, one file per key.
#[derive(Clone)]
pub struct FilePromptStore {
    dir: PathBuf,
}

impl FilePromptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, String> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.starts_with('.') {
            return Err(format!("invalid store key: {key}"));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl PromptStore for FilePromptStore {
    async fn read(&self, key: &str) -> Result<Option<String>, String> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(format!("read {}: {err}", path.display())),
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), String> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| format!("create {}: {err}", self.dir.display()))?;
        tokio::fs::write(&path, value)
            .await
            .map_err(|err| format!("write {}: {err}", path.display()))
    }
}

#[derive(Clone, Default)]
pub struct MemoryPromptStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

#[async_trait]
impl PromptStore for MemoryPromptStore {
    async fn read(&self, key: &str) -> Result<Option<String>, String> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), String> {
        self.inner
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
