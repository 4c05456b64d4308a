use serde_json::Value;

pub const DONE_SENTINEL: &str = "[DONE]";

/// Classification of one reassembled upstream line.
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    /// Blank, comment, non-`data:` field, or a payload that is not JSON.
    Ignored,
    Done,
    Event(Value),
}

pub fn parse_line(line: &str) -> SseLine {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Ignored;
    }
    let Some(payload) = line.strip_prefix("data:") else {
        return SseLine::Ignored;
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return SseLine::Done;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => SseLine::Event(value),
        Err(err) => {
            tracing::trace!(error = %err, len = payload.len(), "dropping unparseable sse payload");
            SseLine::Ignored
        }
    }
}
