//! Upstream SSE → client stream relay.
//!
//! One relay runs per evaluate request as a single sequential pull loop:
//! read a chunk, reassemble lines, parse `data:` payloads, extract fragments
//! and hand encoded bytes to a bounded channel backing the response body. A
//! full channel suspends the loop before the next upstream read; a closed one
//! ends it and drops the upstream body.

pub mod encode;
pub mod extract;
pub mod lines;
pub mod sse;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use encode::{OutputEncoder, PlainTextEncoder, SseEncoder};
use extract::DeltaExtractor;
use lines::LineReassembler;
use sse::SseLine;

pub const CLIENT_STREAM_HEADER: &str = "x-client-stream";
pub const RELAY_CHANNEL_CAPACITY: usize = 16;

/// Enough trailing bytes to tell whether `\r\n\r\n` closed the last event.
const PASSTHROUGH_TAIL_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Upstream bytes forwarded untouched.
    Passthrough,
    NormalizedSse,
    PlainText,
}

impl RelayMode {
    /// Maps the `x-client-stream` header value; absent or unknown means plain
    /// text.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("sse") => RelayMode::NormalizedSse,
            Some("sse-passthrough") | Some("passthrough") => RelayMode::Passthrough,
            _ => RelayMode::PlainText,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::Passthrough => "passthrough",
            RelayMode::NormalizedSse => "sse",
            RelayMode::PlainText => "text",
        }
    }

    pub fn content_type(&self) -> mime::Mime {
        match self.encoder() {
            Some(encoder) => encoder.content_type(),
            None => mime::TEXT_EVENT_STREAM,
        }
    }

    fn encoder(&self) -> Option<Box<dyn OutputEncoder>> {
        match self {
            RelayMode::Passthrough => None,
            RelayMode::NormalizedSse => Some(Box::new(SseEncoder)),
            RelayMode::PlainText => Some(Box::new(PlainTextEncoder)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// `[DONE]` sentinel observed.
    Done,
    /// Upstream body exhausted without a sentinel.
    UpstreamEnded,
    UpstreamError(String),
    ClientDisconnected,
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::Done => "done",
            RelayOutcome::UpstreamEnded => "upstream_ended",
            RelayOutcome::UpstreamError(_) => "upstream_error",
            RelayOutcome::ClientDisconnected => "client_disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub outcome: RelayOutcome,
    pub upstream_bytes: u64,
    pub sent_bytes: u64,
    pub content_fragments: u64,
    pub reasoning_fragments: u64,
}

/// Per-request relay state. Never shared between requests.
#[derive(Debug, Default)]
pub struct StreamState {
    pub lines: LineReassembler,
    pub extractor: DeltaExtractor,
    pub total_bytes: u64,
    pub done: bool,
}

struct Relay {
    encoder: Option<Box<dyn OutputEncoder>>,
    state: StreamState,
    tx: mpsc::Sender<Bytes>,
    sent_bytes: u64,
    content_fragments: u64,
    reasoning_fragments: u64,
    /// Last bytes forwarded in passthrough mode.
    passthrough_tail: BytesMut,
}

/// Client went away; stop reading upstream.
struct Disconnected;

impl Relay {
    async fn send(&mut self, bytes: Bytes) -> Result<(), Disconnected> {
        let len = bytes.len() as u64;
        self.tx.send(bytes).await.map_err(|_| Disconnected)?;
        self.sent_bytes += len;
        Ok(())
    }

    /// Runs one reassembled line through parse → extract → encode. Shared by
    /// the read loop and the end-of-stream flush.
    async fn handle_line(&mut self, line: &str) -> Result<(), Disconnected> {
        let event = match sse::parse_line(line) {
            SseLine::Ignored => return Ok(()),
            SseLine::Done => {
                self.state.done = true;
                return Ok(());
            }
            SseLine::Event(event) => event,
        };
        let delta = self.state.extractor.extract(&event);
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        let mut out = Vec::with_capacity(2);
        if let Some(reasoning) = delta.reasoning.as_deref() {
            if let Some(bytes) = encoder.reasoning(reasoning) {
                self.reasoning_fragments += 1;
                out.push(bytes);
            }
        }
        if let Some(content) = delta.content.as_deref() {
            self.content_fragments += 1;
            out.push(encoder.content(content));
        }
        for bytes in out {
            self.send(bytes).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), Disconnected> {
        let done = self.encoder.as_mut().and_then(|encoder| encoder.done());
        if let Some(bytes) = done {
            self.send(bytes).await?;
        }
        Ok(())
    }

    async fn forward(&mut self, chunk: Bytes) -> Result<(), Disconnected> {
        let keep = chunk.len().min(PASSTHROUGH_TAIL_LEN);
        self.passthrough_tail
            .extend_from_slice(&chunk[chunk.len() - keep..]);
        let excess = self
            .passthrough_tail
            .len()
            .saturating_sub(PASSTHROUGH_TAIL_LEN);
        let _ = self.passthrough_tail.split_to(excess);
        self.send(chunk).await
    }

    async fn fail(&mut self, message: &str) {
        let marker = match self.encoder.as_mut() {
            Some(encoder) => encoder.error(message),
            None => encode::passthrough_error_event(&self.passthrough_tail, message),
        };
        // best effort; the client may already be gone
        let _ = self.send(marker).await;
    }

    async fn drive<S, E>(&mut self, upstream: S) -> Result<RelayOutcome, Disconnected>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let mut upstream = std::pin::pin!(upstream);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.tx.closed() => return Err(Disconnected),
                next = upstream.next() => next,
            };
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    let message = err.to_string();
                    self.fail(&format!("upstream stream interrupted: {message}"))
                        .await;
                    return Ok(RelayOutcome::UpstreamError(message));
                }
                None => break,
            };
            self.state.total_bytes += chunk.len() as u64;

            if self.encoder.is_none() {
                self.forward(chunk).await?;
                continue;
            }

            for line in self.state.lines.push(&chunk) {
                self.handle_line(&line).await?;
                if self.state.done {
                    self.finish().await?;
                    return Ok(RelayOutcome::Done);
                }
            }
        }

        // The last `data:` line may arrive without a trailing newline.
        if self.encoder.is_some() {
            if let Some(tail) = self.state.lines.finish() {
                self.handle_line(&tail).await?;
            }
        }
        self.finish().await?;
        if self.state.done {
            Ok(RelayOutcome::Done)
        } else {
            Ok(RelayOutcome::UpstreamEnded)
        }
    }
}

/// Relays `upstream` into `tx` in the requested mode and reports how the
/// stream ended. Returns once the stream is finished or the receiver is gone.
pub async fn run_relay<S, E>(upstream: S, mode: RelayMode, tx: mpsc::Sender<Bytes>) -> RelayReport
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut relay = Relay {
        encoder: mode.encoder(),
        state: StreamState::default(),
        tx,
        sent_bytes: 0,
        content_fragments: 0,
        reasoning_fragments: 0,
        passthrough_tail: BytesMut::with_capacity(PASSTHROUGH_TAIL_LEN * 2),
    };
    let outcome = relay
        .drive(upstream)
        .await
        .unwrap_or(RelayOutcome::ClientDisconnected);
    RelayReport {
        outcome,
        upstream_bytes: relay.state.total_bytes,
        sent_bytes: relay.sent_bytes,
        content_fragments: relay.content_fragments,
        reasoning_fragments: relay.reasoning_fragments,
    }
}

/// Starts the relay on its own task and returns the receiving half for the
/// response body. Logs and records metrics when the relay ends.
pub fn spawn_relay<S, E>(upstream: S, mode: RelayMode, model: String) -> mpsc::Receiver<Bytes>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Bytes>(RELAY_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let started_at = std::time::Instant::now();
        let report = run_relay(upstream, mode, tx).await;
        metrics::counter!("masseval_relay_bytes_total").increment(report.upstream_bytes);
        metrics::counter!(
            "masseval_relay_outcomes_total",
            "outcome" => report.outcome.as_str()
        )
        .increment(1);
        match &report.outcome {
            RelayOutcome::UpstreamError(message) => tracing::warn!(
                model = %model,
                mode = mode.as_str(),
                upstream_bytes = report.upstream_bytes,
                error = %message,
                "relay ended on upstream error"
            ),
            outcome => tracing::info!(
                model = %model,
                mode = mode.as_str(),
                outcome = outcome.as_str(),
                upstream_bytes = report.upstream_bytes,
                sent_bytes = report.sent_bytes,
                content_fragments = report.content_fragments,
                reasoning_fragments = report.reasoning_fragments,
                duration_ms = started_at.elapsed().as_millis() as u64,
                "relay finished"
            ),
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    const HELLO_WORLD: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n\
data: [DONE]\n\n";

    fn chunks(parts: &[&[u8]]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + use<> {
        let owned: Vec<Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();
        stream::iter(owned)
    }

    async fn relay_to_string<S>(upstream: S, mode: RelayMode) -> (Vec<u8>, RelayReport)
    where
        S: Stream<Item = Result<Bytes, std::io::Error>>,
    {
        let (tx, mut rx) = mpsc::channel(1024);
        let report = run_relay(upstream, mode, tx).await;
        let mut out = Vec::new();
        while let Some(bytes) = rx.recv().await {
            out.extend_from_slice(&bytes);
        }
        (out, report)
    }

    #[tokio::test]
    async fn plain_text_writes_one_line_per_fragment() {
        let (out, report) =
            relay_to_string(chunks(&[HELLO_WORLD.as_bytes()]), RelayMode::PlainText).await;
        assert_eq!(String::from_utf8(out).unwrap(), "Hello\n world\n");
        assert_eq!(report.outcome, RelayOutcome::Done);
        assert_eq!(report.content_fragments, 2);
        assert_eq!(report.upstream_bytes, HELLO_WORLD.len() as u64);
    }

    #[tokio::test]
    async fn normalized_sse_reframes_fragments() {
        let (out, report) =
            relay_to_string(chunks(&[HELLO_WORLD.as_bytes()]), RelayMode::NormalizedSse).await;
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "data: Hello\n\ndata:  world\n\ndata: [DONE]\n\n"
        );
        assert_eq!(report.outcome, RelayOutcome::Done);
    }

    #[tokio::test]
    async fn passthrough_is_byte_identical() {
        let raw = format!(": keepalive\n\n{HELLO_WORLD}data: {{\"trailing\":true}}");
        let bytes = raw.as_bytes();
        let (out, report) = relay_to_string(
            chunks(&[&bytes[..7], &bytes[7..50], &bytes[50..]]),
            RelayMode::Passthrough,
        )
        .await;
        assert_eq!(out, bytes);
        // passthrough keeps reading past the sentinel until the body ends
        assert_eq!(report.outcome, RelayOutcome::UpstreamEnded);
    }

    #[tokio::test]
    async fn output_independent_of_chunk_boundaries() {
        let text = "data: {\"choices\":[{\"delta\":{\"content\":\"héllo \"}}]}\r\n\r\n\
: comment\n\
data: {\"choices\":[{\"delta\":{\"content\":[{\"type\":\"text\",\"text\":\"世\"},\"界\"]}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"reasoning\":\"r\"}}]}\n\
data: {\"choices\":[{\"delta\":{\"reasoning\":\"r\",\"content\":\"!\"}}]}\n\
data: [DONE]\n\n";
        let bytes = text.as_bytes();
        let (expected, _) =
            relay_to_string(chunks(&[bytes]), RelayMode::NormalizedSse).await;
        assert_eq!(
            String::from_utf8(expected.clone()).unwrap(),
            "data: héllo \n\ndata: 世界\n\nevent: reasoning\ndata: r\n\ndata: !\n\ndata: [DONE]\n\n"
        );

        for cut in 1..bytes.len() {
            let (out, _) = relay_to_string(
                chunks(&[&bytes[..cut], &bytes[cut..]]),
                RelayMode::NormalizedSse,
            )
            .await;
            assert_eq!(out, expected, "split at byte {cut}");
        }

        let singles: Vec<&[u8]> = bytes.chunks(1).collect();
        let (out, _) = relay_to_string(chunks(&singles), RelayMode::NormalizedSse).await;
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn nothing_after_done_is_processed() {
        let text = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\
data: [DONE]\n\
data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n";
        let (out, report) =
            relay_to_string(chunks(&[text.as_bytes()]), RelayMode::PlainText).await;
        assert_eq!(String::from_utf8(out).unwrap(), "a\n");
        assert_eq!(report.outcome, RelayOutcome::Done);
        assert_eq!(report.content_fragments, 1);
    }

    #[tokio::test]
    async fn trailing_line_without_newline_flushed_once() {
        let text = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\
data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}";
        let (out, report) =
            relay_to_string(chunks(&[text.as_bytes()]), RelayMode::NormalizedSse).await;
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "data: a\n\ndata: b\n\ndata: [DONE]\n\n"
        );
        assert_eq!(report.outcome, RelayOutcome::UpstreamEnded);
        assert_eq!(report.content_fragments, 2);
    }

    #[tokio::test]
    async fn trailing_done_without_newline_counts_as_done() {
        let text = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: [DONE]";
        let (out, report) =
            relay_to_string(chunks(&[text.as_bytes()]), RelayMode::PlainText).await;
        assert_eq!(String::from_utf8(out).unwrap(), "a\n");
        assert_eq!(report.outcome, RelayOutcome::Done);
    }

    #[tokio::test]
    async fn malformed_payloads_do_not_stop_the_stream() {
        let text = "data: {\"choices\":[{\"delta\"\n\
data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\
data: [DONE]\n";
        let (out, _) = relay_to_string(chunks(&[text.as_bytes()]), RelayMode::PlainText).await;
        assert_eq!(String::from_utf8(out).unwrap(), "ok\n");
    }

    #[tokio::test]
    async fn upstream_error_appends_in_band_marker() {
        let items: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n",
            )),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            )),
        ];
        let (out, report) = relay_to_string(stream::iter(items), RelayMode::PlainText).await;
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "partial\n\nError: upstream stream interrupted: connection reset\n"
        );
        assert_eq!(
            report.outcome,
            RelayOutcome::UpstreamError("connection reset".to_string())
        );
    }

    async fn decode_events(raw: Vec<u8>) -> Vec<(String, String)> {
        use eventsource_stream::Eventsource;
        stream::iter([Ok::<_, std::io::Error>(Bytes::from(raw))])
            .eventsource()
            .map(|event| {
                let event = event.expect("well-formed event");
                let name = if event.event.is_empty() {
                    "message".to_string()
                } else {
                    event.event
                };
                (name, event.data)
            })
            .collect()
            .await
    }

    #[tokio::test]
    async fn passthrough_error_after_partial_line_is_its_own_event() {
        let items: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\ndata: {\"choi",
            )),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            )),
        ];
        let (out, report) = relay_to_string(stream::iter(items), RelayMode::Passthrough).await;
        assert!(out.starts_with(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\ndata: {\"choi\n\nevent: error\n"
        ));
        assert_eq!(
            report.outcome,
            RelayOutcome::UpstreamError("connection reset".to_string())
        );

        let events = decode_events(out).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[1], ("message".to_string(), "{\"choi".to_string()));
        assert_eq!(events[2].0, "error");
        let payload: serde_json::Value = serde_json::from_str(&events[2].1).unwrap();
        assert_eq!(payload["error"]["type"], "upstream_stream_error");
        assert_eq!(
            payload["error"]["message"],
            "upstream stream interrupted: connection reset"
        );
    }

    #[tokio::test]
    async fn normalized_sse_keeps_text_after_carriage_returns() {
        let text = "data: {\"choices\":[{\"delta\":{\"reasoning\":\"x\\ry\",\"content\":\"a\\rb\\r\\nc\"}}]}\n\n\
data: [DONE]\n\n";
        let (out, _) =
            relay_to_string(chunks(&[text.as_bytes()]), RelayMode::NormalizedSse).await;
        let events = decode_events(out).await;
        assert_eq!(
            events,
            vec![
                ("reasoning".to_string(), "x\ny".to_string()),
                ("message".to_string(), "a\nb\nc".to_string()),
                ("message".to_string(), "[DONE]".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn closed_client_releases_a_stalled_upstream() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let upstream = stream::pending::<Result<Bytes, std::io::Error>>();
        let report = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            run_relay(upstream, RelayMode::PlainText, tx),
        )
        .await
        .expect("relay should not wait on a stalled upstream");
        assert_eq!(report.outcome, RelayOutcome::ClientDisconnected);
    }

    #[tokio::test]
    async fn slow_client_applies_backpressure() {
        let events: String = (0..8)
            .map(|i| format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{i}\"}}}}]}}\n"))
            .collect();
        let (tx, mut rx) = mpsc::channel(1);
        let relay = tokio::spawn(run_relay(
            chunks(&[events.as_bytes()]),
            RelayMode::PlainText,
            tx,
        ));
        tokio::task::yield_now().await;
        assert!(!relay.is_finished());

        let mut out = Vec::new();
        while let Some(bytes) = rx.recv().await {
            out.extend_from_slice(&bytes);
        }
        let report = relay.await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "0\n1\n2\n3\n4\n5\n6\n7\n");
        assert_eq!(report.outcome, RelayOutcome::UpstreamEnded);
    }

    #[test]
    fn header_selects_mode() {
        assert_eq!(RelayMode::from_header(None), RelayMode::PlainText);
        assert_eq!(RelayMode::from_header(Some("SSE")), RelayMode::NormalizedSse);
        assert_eq!(
            RelayMode::from_header(Some("sse-passthrough")),
            RelayMode::Passthrough
        );
        assert_eq!(RelayMode::from_header(Some("json")), RelayMode::PlainText);
        assert_eq!(RelayMode::Passthrough.content_type(), mime::TEXT_EVENT_STREAM);
        assert_eq!(RelayMode::PlainText.content_type(), mime::TEXT_PLAIN_UTF_8);
    }
}
