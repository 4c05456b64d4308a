use serde_json::Value;

/// Fragments pulled out of one upstream event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
}

type ContentStrategy = fn(&Value) -> Option<String>;

/// Tried in order; the first non-empty result wins.
const CONTENT_STRATEGIES: &[ContentStrategy] = &[
    delta_content_string,
    message_content_string,
    delta_text_string,
    flattened_block_content,
];

fn first_choice(event: &Value) -> Option<&Value> {
    event
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
}

fn choice_field<'a>(event: &'a Value, container: &str, field: &str) -> Option<&'a Value> {
    first_choice(event)
        .and_then(|choice| choice.get(container))
        .and_then(|v| v.get(field))
}

fn non_empty(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn delta_content_string(event: &Value) -> Option<String> {
    choice_field(event, "delta", "content")
        .and_then(|v| v.as_str())
        .and_then(non_empty)
}

fn message_content_string(event: &Value) -> Option<String> {
    choice_field(event, "message", "content")
        .and_then(|v| v.as_str())
        .and_then(non_empty)
}

fn delta_text_string(event: &Value) -> Option<String> {
    choice_field(event, "delta", "text")
        .and_then(|v| v.as_str())
        .and_then(non_empty)
}

fn flattened_block_content(event: &Value) -> Option<String> {
    ["delta", "message"].into_iter().find_map(|container| {
        choice_field(event, container, "content")
            .and_then(|v| v.as_array())
            .map(|blocks| flatten_blocks(blocks))
            .and_then(|text| non_empty(&text))
    })
}

/// Concatenates array-shaped content. Bare strings count as-is; object blocks
/// (`text`, `output_text`, or any other type) count by their string `text`.
pub fn flatten_blocks(blocks: &[Value]) -> String {
    let mut out = String::new();
    for block in blocks {
        if let Some(s) = block.as_str() {
            out.push_str(s);
        } else if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
            out.push_str(text);
        }
    }
    out
}

pub fn extract_content(event: &Value) -> Option<String> {
    CONTENT_STRATEGIES
        .iter()
        .find_map(|strategy| strategy(event))
}

/// `delta.reasoning_details[].text` joined, falling back to `delta.reasoning`.
pub fn extract_reasoning(event: &Value) -> Option<String> {
    let from_details = choice_field(event, "delta", "reasoning_details")
        .and_then(|v| v.as_array())
        .map(|details| {
            details
                .iter()
                .filter_map(|d| d.get("text").and_then(|v| v.as_str()))
                .collect::<String>()
        })
        .and_then(|text| non_empty(&text));
    from_details.or_else(|| {
        choice_field(event, "delta", "reasoning")
            .and_then(|v| v.as_str())
            .and_then(non_empty)
    })
}

/// Per-stream extractor. Holds the last emitted reasoning fragment so a
/// provider repeating its previous reasoning chunk is only surfaced once.
/// Only the immediate predecessor is compared, not the whole history.
#[derive(Debug, Default)]
pub struct DeltaExtractor {
    last_reasoning: Option<String>,
}

impl DeltaExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extract(&mut self, event: &Value) -> Delta {
        let content = extract_content(event);
        let reasoning = extract_reasoning(event).and_then(|r| self.accept_reasoning(r));
        Delta { content, reasoning }
    }

    fn accept_reasoning(&mut self, fragment: String) -> Option<String> {
        if self.last_reasoning.as_deref() == Some(fragment.as_str()) {
            return None;
        }
        self.last_reasoning = Some(fragment.clone());
        Some(fragment)
    }
}
