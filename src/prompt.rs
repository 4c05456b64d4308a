use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::UpstreamConfig;

/// Body of `POST /api/evaluate`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub rules_list: Option<Vec<Value>>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub tool_schema_subset: Option<Value>,
}

impl EvaluateRequest {
    pub fn model(&self) -> Option<&str> {
        non_blank(self.model.as_deref())
    }

    pub fn prompt(&self) -> Option<&str> {
        non_blank(self.prompt.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

const RULE_TEXT_FIELDS: [&str; 4] = ["text", "rule", "description", "title"];

fn rule_text(rule: &Value) -> Option<String> {
    let text = match rule {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Object(map) => RULE_TEXT_FIELDS
            .iter()
            .find_map(|field| map.get(*field).and_then(|v| v.as_str()))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| rule.to_string()),
        other => other.to_string(),
    };
    if text.is_empty() { None } else { Some(text) }
}

fn rules_block(rules: &[Value]) -> Option<String> {
    let items: Vec<String> = rules.iter().filter_map(rule_text).collect();
    if items.is_empty() {
        return None;
    }
    let mut block = String::from("## Rules Checklist\n");
    for (idx, item) in items.iter().enumerate() {
        block.push_str(&format!("{}. {}\n", idx + 1, item));
    }
    Some(block.trim_end().to_string())
}

fn tool_schema_block(schema: &Value) -> Option<String> {
    let empty = match schema {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if empty {
        return None;
    }
    let body = match schema {
        Value::String(s) => s.trim().to_string(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    Some(format!("## Tool Schema Subset\n```json\n{body}\n```"))
}

/// Base prompt, then the rules checklist, then the tool schema, each only when
/// non-empty and separated by a blank line. `None` means no system message.
pub fn compose_system_prompt(req: &EvaluateRequest) -> Option<String> {
    let base = req
        .system_prompt
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string);
    let rules = req.rules_list.as_deref().and_then(rules_block);
    let schema = req.tool_schema_subset.as_ref().and_then(tool_schema_block);

    let parts: Vec<String> = [base, rules, schema].into_iter().flatten().collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Chat-completions body for one streamed evaluation.
pub fn build_upstream_body(
    config: &UpstreamConfig,
    model: &str,
    system_prompt: Option<&str>,
    prompt: &str,
) -> Value {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = system_prompt {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.push(json!({ "role": "user", "content": prompt }));
    json!({
        "model": model,
        "messages": messages,
        "temperature": config.temperature,
        "max_tokens": config.max_tokens,
        "stream": true,
    })
}
