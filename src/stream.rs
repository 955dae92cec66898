//! Streamed response consumption.
//!
//! The transport is a sequence of frames separated by a blank line:
//!
//! ```text
//! data: {"type":"content","content":"Hello"}
//!
//! data: {"type":"usage","usage":{"promptTokens":12,"completionTokens":2,"totalTokens":14}}
//!
//! data: [DONE]
//! ```
//!
//! [`EventFramer`] only hands out complete frames, so a JSON payload split
//! across network reads is simply buffered until its terminating blank line
//! arrives. A frame that is complete but cannot be decoded is a protocol error:
//! it is logged and skipped, and the stream keeps going.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::TokenUsage;

/// Maximum buffered bytes (1MB) before the oldest data is dropped.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

const DONE_SENTINEL: &str = "[DONE]";

/// A complete frame extracted from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The JSON text carried by the frame's `data:` line(s)
    Data(String),
    /// The `[DONE]` sentinel
    Done,
}

/// Splits raw transport bytes into complete frames.
///
/// Bytes are kept undecoded until a frame is complete, so a multi-byte UTF-8
/// character split across reads is reassembled intact.
#[derive(Debug, Default)]
pub struct EventFramer {
    buffer: Vec<u8>,
    truncated: bool,
}

impl EventFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every frame completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(bytes);

        if self.buffer.len() > MAX_BUFFER_SIZE {
            if !self.truncated {
                warn!(
                    max_bytes = MAX_BUFFER_SIZE,
                    "stream buffer overflow, dropping oldest data"
                );
                self.truncated = true;
            }
            let target_start = self.buffer.len() - MAX_BUFFER_SIZE / 2;
            let start = self.buffer[target_start..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|pos| target_start + pos + 1)
                .unwrap_or(target_start);
            self.buffer.drain(..start);
        }

        let mut frames = Vec::new();
        while let Some((end, separator_len)) = find_frame_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + separator_len).collect();
            if let Some(frame) = parse_frame(&String::from_utf8_lossy(&raw[..end])) {
                frames.push(frame);
            }
            self.truncated = false;
        }

        frames
    }

    /// Interpret whatever is left once the transport has closed.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        parse_frame(&String::from_utf8_lossy(&raw))
    }

    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty()
    }
}

/// Position of the earliest frame separator and its length.
fn find_frame_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buffer, b"\n\n").map(|pos| (pos, 2));
    let crlf = find(buffer, b"\r\n\r\n").map(|pos| (pos, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Collect the `data:` lines of one frame. Lines without the prefix are
/// ignored; a frame with no data lines yields nothing.
fn parse_frame(raw: &str) -> Option<Frame> {
    let data_lines: Vec<&str> = raw
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| {
            line.strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
        })
        .collect();

    if data_lines.is_empty() {
        if !raw.trim().is_empty() {
            debug!(frame = raw, "skipping frame without data prefix");
        }
        return None;
    }

    let data = data_lines.join("\n");
    if data.trim() == DONE_SENTINEL {
        return Some(Frame::Done);
    }
    Some(Frame::Data(data))
}

/// Decoded payload of a data frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamPayload {
    Content { content: String },
    Usage { usage: TokenUsage },
    Error { error: String },
}

impl StreamPayload {
    pub fn decode(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| Error::Protocol(format!("{e}: {data}")))
    }
}

/// Result of consuming one stream to its end
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    /// Concatenation of every delta delivered to the sink
    pub text: String,
    /// Last usage record received (zero if none arrived)
    pub usage: TokenUsage,
    /// True when the cancellation token stopped the stream
    pub aborted: bool,
}

/// Drives one streamed response: frames the bytes, pushes content deltas to a
/// sink in arrival order and captures the final usage record.
#[derive(Debug, Default)]
pub struct StreamConsumer {
    framer: EventFramer,
    outcome: StreamOutcome,
}

enum Step {
    Continue,
    Finished,
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `stream` until `[DONE]`, end of transport, an error payload, or
    /// cancellation of `token`.
    ///
    /// The token is checked before every read; cancellation returns
    /// `Ok` with `aborted = true` and whatever usage was already captured.
    pub async fn run<S, F>(
        mut self,
        mut stream: S,
        token: &CancellationToken,
        mut sink: F,
    ) -> Result<StreamOutcome>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
        F: FnMut(&str),
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("stream cancelled");
                    self.outcome.aborted = true;
                    return Ok(self.outcome);
                }
                chunk = stream.next() => chunk,
            };

            match next {
                Some(Ok(bytes)) => {
                    for frame in self.framer.feed(&bytes) {
                        if let Step::Finished = self.apply(frame, &mut sink)? {
                            return Ok(self.outcome);
                        }
                    }
                }
                Some(Err(err)) => return Err(err),
                None => {
                    if let Some(frame) = self.framer.finish() {
                        self.apply(frame, &mut sink)?;
                    }
                    debug!("transport closed without [DONE]");
                    return Ok(self.outcome);
                }
            }
        }
    }

    fn apply<F: FnMut(&str)>(&mut self, frame: Frame, sink: &mut F) -> Result<Step> {
        let data = match frame {
            Frame::Done => return Ok(Step::Finished),
            Frame::Data(data) => data,
        };

        match StreamPayload::decode(&data) {
            Ok(StreamPayload::Content { content }) => {
                sink(&content);
                self.outcome.text.push_str(&content);
            }
            Ok(StreamPayload::Usage { usage }) => self.outcome.usage = usage,
            Ok(StreamPayload::Error { error }) => return Err(Error::Upstream(error)),
            Err(err) => warn!(error = %err, "ignoring malformed stream payload"),
        }
        Ok(Step::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes>> + Unpin {
        let owned: Vec<Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        stream::iter(owned)
    }

    async fn consume(parts: &[&str]) -> (Result<StreamOutcome>, Vec<String>) {
        let token = CancellationToken::new();
        let mut deltas = Vec::new();
        let result = StreamConsumer::new()
            .run(chunks(parts), &token, |d| deltas.push(d.to_string()))
            .await;
        (result, deltas)
    }

    #[test]
    fn test_framer_buffers_incomplete_frame() {
        let mut framer = EventFramer::new();
        assert!(framer.feed(b"data: {\"type\":\"content\",").is_empty());
        assert!(framer.has_buffered_data());

        let frames = framer.feed(b"\"content\":\"hi\"}\n\ndata: [DONE]\n\n");
        assert_eq!(
            frames,
            vec![
                Frame::Data(r#"{"type":"content","content":"hi"}"#.to_string()),
                Frame::Done
            ]
        );
        assert!(!framer.has_buffered_data());
    }

    #[test]
    fn test_framer_handles_crlf_and_split_utf8() {
        let mut framer = EventFramer::new();
        let payload = "data: {\"type\":\"content\",\"content\":\"caf\u{e9}\"}\r\n\r\n";
        let bytes = payload.as_bytes();
        let split = payload.find('\u{e9}').unwrap() + 1;

        assert!(framer.feed(&bytes[..split]).is_empty());
        let frames = framer.feed(&bytes[split..]);
        assert_eq!(
            frames,
            vec![Frame::Data(
                "{\"type\":\"content\",\"content\":\"caf\u{e9}\"}".to_string()
            )]
        );
    }

    #[test]
    fn test_framer_skips_lines_without_prefix() {
        let mut framer = EventFramer::new();
        let frames = framer.feed(b"notdata: {\"type\":\"content\",\"content\":\"x\"}\n\n");
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn test_deltas_concatenate_in_arrival_order() {
        let (result, deltas) = consume(&[
            "data: {\"type\":\"content\",\"content\":\"Hel\"}\n\n",
            "data: {\"type\":\"content\",\"content\":\"lo\"}\n\ndata: {\"type\":\"con",
            "tent\",\"content\":\" world\"}\n\n",
            "data: {\"type\":\"usage\",\"usage\":{\"promptTokens\":5,\"completionTokens\":3,\"totalTokens\":8}}\n\n",
            "data: [DONE]\n\n",
        ])
        .await;

        let outcome = result.unwrap();
        assert_eq!(deltas, vec!["Hel", "lo", " world"]);
        assert_eq!(outcome.text, "Hello world");
        assert_eq!(outcome.usage, TokenUsage::new(5, 3, 8));
        assert!(!outcome.aborted);
    }

    #[tokio::test]
    async fn test_usage_does_not_terminate_stream() {
        let (result, deltas) = consume(&[
            "data: {\"type\":\"usage\",\"usage\":{\"promptTokens\":1,\"completionTokens\":1,\"totalTokens\":2}}\n\n",
            "data: {\"type\":\"content\",\"content\":\"after\"}\n\n",
            "data: [DONE]\n\n",
        ])
        .await;

        assert_eq!(deltas, vec!["after"]);
        assert_eq!(result.unwrap().usage, TokenUsage::new(1, 1, 2));
    }

    #[tokio::test]
    async fn test_error_payload_is_fatal() {
        let (result, deltas) = consume(&[
            "data: {\"type\":\"error\",\"error\":\"rate limited\"}\n\n",
            "data: {\"type\":\"content\",\"content\":\"never\"}\n\n",
        ])
        .await;

        assert!(deltas.is_empty());
        match result {
            Err(Error::Upstream(message)) => assert_eq!(message, "rate limited"),
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_and_unprefixed_frames_are_skipped() {
        let (result, deltas) = consume(&[
            "notdata: {\"type\":\"content\",\"content\":\"x\"}\n\n",
            "data: {not json}\n\n",
            "data: {\"type\":\"mystery\"}\n\n",
            "data: {\"type\":\"content\",\"content\":\"ok\"}\n\n",
            "data: [DONE]\n\n",
        ])
        .await;

        assert_eq!(deltas, vec!["ok"]);
        assert_eq!(result.unwrap().text, "ok");
    }

    #[tokio::test]
    async fn test_done_stops_reading() {
        let (result, deltas) = consume(&[
            "data: {\"type\":\"content\",\"content\":\"a\"}\n\ndata: [DONE]\n\n",
            "data: {\"type\":\"content\",\"content\":\"b\"}\n\n",
        ])
        .await;

        assert_eq!(deltas, vec!["a"]);
        assert_eq!(result.unwrap().text, "a");
    }

    #[tokio::test]
    async fn test_transport_close_without_done_completes() {
        let (result, deltas) =
            consume(&["data: {\"type\":\"content\",\"content\":\"tail\"}"]).await;

        assert_eq!(deltas, vec!["tail"]);
        assert!(!result.unwrap().aborted);
    }

    #[tokio::test]
    async fn test_transport_error_is_propagated() {
        let token = CancellationToken::new();
        let items: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"content\",\"content\":\"a\"}\n\n")),
            Err(Error::Network("connection reset".to_string())),
        ];
        let result = StreamConsumer::new()
            .run(stream::iter(items), &token, |_| {})
            .await;
        assert!(matches!(result, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_cancellation_returns_partial_outcome() {
        let token = CancellationToken::new();
        let first = stream::iter(vec![
            Ok(Bytes::from_static(
                b"data: {\"type\":\"usage\",\"usage\":{\"promptTokens\":4,\"completionTokens\":0,\"totalTokens\":4}}\n\n",
            )),
            Ok(Bytes::from_static(b"data: {\"type\":\"content\",\"content\":\"part\"}\n\n")),
        ]);
        let stalled = first.chain(stream::pending());

        let cancel = token.clone();
        let mut deltas = Vec::new();
        let result = StreamConsumer::new()
            .run(Box::pin(stalled), &token, |d| {
                deltas.push(d.to_string());
                cancel.cancel();
            })
            .await
            .unwrap();

        assert!(result.aborted);
        assert_eq!(result.text, "part");
        assert_eq!(result.usage, TokenUsage::new(4, 0, 4));
        assert_eq!(deltas, vec!["part"]);
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_reads_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let mut deltas = Vec::new();
        let result = StreamConsumer::new()
            .run(
                chunks(&["data: {\"type\":\"content\",\"content\":\"x\"}\n\n"]),
                &token,
                |d| deltas.push(d.to_string()),
            )
            .await
            .unwrap();

        assert!(result.aborted);
        assert!(deltas.is_empty());
    }
}
