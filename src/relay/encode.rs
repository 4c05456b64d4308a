use bytes::{BufMut, Bytes, BytesMut};
use serde_json::json;

/// Client-facing wire format for normalized fragments. One encoder is chosen
/// per request; the relay loop never branches on the format itself.
pub trait OutputEncoder: Send {
    fn content_type(&self) -> mime::Mime;
    fn content(&mut self, fragment: &str) -> Bytes;
    /// `None` when the format has no channel for reasoning.
    fn reasoning(&mut self, fragment: &str) -> Option<Bytes>;
    fn done(&mut self) -> Option<Bytes>;
    fn error(&mut self, message: &str) -> Bytes;
}

/// `data: <fragment>\n\n` per fragment, `data: [DONE]\n\n` at the end.
#[derive(Debug, Default)]
pub struct SseEncoder;

/// Splits on every SSE line terminator: `\r\n`, lone `\r` and `\n`.
fn data_lines(data: &str) -> Vec<&str> {
    let bytes = data.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                lines.push(&data[start..i]);
                i += 1;
                start = i;
            }
            b'\r' => {
                lines.push(&data[start..i]);
                i += if bytes.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
                start = i;
            }
            _ => i += 1,
        }
    }
    lines.push(&data[start..]);
    lines
}

/// Writes one SSE event. Embedded line breaks become additional `data:` lines,
/// so a client decodes every break as `\n` and keeps the text around it.
pub fn sse_event(event: Option<&str>, data: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 16);
    if let Some(name) = event {
        buf.put_slice(b"event: ");
        buf.put_slice(name.as_bytes());
        buf.put_u8(b'\n');
    }
    for line in data_lines(data) {
        buf.put_slice(b"data: ");
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
    }
    buf.put_u8(b'\n');
    buf.freeze()
}

pub fn sse_error_event(message: &str) -> Bytes {
    let payload = json!({ "error": { "message": message, "type": "upstream_stream_error" } });
    sse_event(Some("error"), &payload.to_string())
}

/// Line terminators already at the end of `tail`, counting `\r\n` once.
fn trailing_line_ends(tail: &[u8]) -> usize {
    let mut ends = 0;
    let mut i = tail.len();
    while i > 0 {
        match tail[i - 1] {
            b'\n' => {
                ends += 1;
                i -= 1;
                if i > 0 && tail[i - 1] == b'\r' {
                    i -= 1;
                }
            }
            b'\r' => {
                ends += 1;
                i -= 1;
            }
            _ => break,
        }
    }
    ends
}

/// Error event for a passthrough stream whose last forwarded bytes were
/// `tail`. Closes any upstream event left open first, so the marker is never
/// folded into a half-written `data:` line.
pub fn passthrough_error_event(tail: &[u8], message: &str) -> Bytes {
    let padding: &[u8] = match (tail.is_empty(), trailing_line_ends(tail), tail.last()) {
        (true, _, _) => b"",
        (false, 0, _) => b"\n\n",
        // a lone `\n` would merge with the trailing `\r` into one terminator
        (false, 1, Some(b'\r')) => b"\n\n",
        (false, 1, _) => b"\n",
        _ => b"",
    };
    let marker = sse_error_event(message);
    let mut buf = BytesMut::with_capacity(padding.len() + marker.len());
    buf.put_slice(padding);
    buf.put_slice(&marker);
    buf.freeze()
}

impl OutputEncoder for SseEncoder {
    fn content_type(&self) -> mime::Mime {
        mime::TEXT_EVENT_STREAM
    }

    fn content(&mut self, fragment: &str) -> Bytes {
        sse_event(None, fragment)
    }

    fn reasoning(&mut self, fragment: &str) -> Option<Bytes> {
        Some(sse_event(Some("reasoning"), fragment))
    }

    fn done(&mut self) -> Option<Bytes> {
        Some(Bytes::from_static(b"data: [DONE]\n\n"))
    }

    fn error(&mut self, message: &str) -> Bytes {
        sse_error_event(message)
    }
}

/// Raw fragment text, one newline after each fragment.
#[derive(Debug, Default)]
pub struct PlainTextEncoder;

impl OutputEncoder for PlainTextEncoder {
    fn content_type(&self) -> mime::Mime {
        mime::TEXT_PLAIN_UTF_8
    }

    fn content(&mut self, fragment: &str) -> Bytes {
        let mut buf = BytesMut::with_capacity(fragment.len() + 1);
        buf.put_slice(fragment.as_bytes());
        buf.put_u8(b'\n');
        buf.freeze()
    }

    fn reasoning(&mut self, _fragment: &str) -> Option<Bytes> {
        None
    }

    fn done(&mut self) -> Option<Bytes> {
        None
    }

    fn error(&mut self, message: &str) -> Bytes {
        Bytes::from(format!("\nError: {message}\n"))
    }
}
