//! Streaming relay: SSE passthrough with per-chunk flush and a token-usage
//! tee (spec.md §4.4). Body bytes pass straight through to the client;
//! `message_delta` usage is read off the wire, never re-derived.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::model::TokenUsage;

#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub usage: TokenUsage,
    pub bytes_sent: u64,
    pub mid_stream_error: bool,
}

type InnerStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Wraps an upstream SSE byte stream, forwarding every chunk unmodified to
/// the client while tracking the most recently observed `message_delta`
/// `usage` object. Sends a `StreamOutcome` through `outcome_tx` once the
/// stream ends (normally or via upstream error) — spec.md §4.4 "Mid-stream
/// failure": no retry is attempted once bytes have already reached the
/// client, so this is purely observational.
pub struct RelayStream {
    inner: InnerStream,
    line_buf: Vec<u8>,
    last_usage: TokenUsage,
    bytes_sent: u64,
    outcome_tx: Option<oneshot::Sender<StreamOutcome>>,
}

impl RelayStream {
    pub fn new(resp: reqwest::Response, outcome_tx: oneshot::Sender<StreamOutcome>) -> Self {
        Self {
            inner: resp.bytes_stream().boxed(),
            line_buf: Vec::new(),
            last_usage: TokenUsage::default(),
            bytes_sent: 0,
            outcome_tx: Some(outcome_tx),
        }
    }

    fn ingest(&mut self, chunk: &[u8]) {
        self.line_buf.extend_from_slice(chunk);
        while let Some(pos) = self.line_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.line_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let trimmed = line.trim_end_matches(['\r', '\n']);
            let Some(data) = trimmed.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            let Ok(v) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            if v.get("type").and_then(Value::as_str) == Some("message_delta") {
                if let Some(usage) = v.get("usage") {
                    self.last_usage = parse_usage(usage);
                }
            }
        }
    }

    fn finish(&mut self, mid_stream_error: bool) {
        if let Some(tx) = self.outcome_tx.take() {
            let _ = tx.send(StreamOutcome {
                usage: self.last_usage,
                bytes_sent: self.bytes_sent,
                mid_stream_error,
            });
        }
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.bytes_sent += chunk.len() as u64;
                this.ingest(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finish(true);
                Poll::Ready(Some(Err(std::io::Error::other(err.to_string()))))
            }
            Poll::Ready(None) => {
                this.finish(false);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Extracts the four token buckets from an Anthropic `usage` object
/// (spec.md §4.4 "Token parsing").
pub fn parse_usage(v: &Value) -> TokenUsage {
    let get = |key: &str| v.get(key).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input_tokens: get("input_tokens"),
        output_tokens: get("output_tokens"),
        cache_creation_input_tokens: get("cache_creation_input_tokens"),
        cache_read_input_tokens: get("cache_read_input_tokens"),
    }
}

/// Non-streaming path: the final JSON body is parsed once for `usage`
/// (spec.md §4.4).
pub fn parse_usage_from_json_body(body: &[u8]) -> TokenUsage {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("usage").map(parse_usage))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_usage_from_json_body_reads_all_four_buckets() {
        let body = br#"{"usage":{"input_tokens":10,"output_tokens":20,"cache_creation_input_tokens":1,"cache_read_input_tokens":2}}"#;
        let usage = parse_usage_from_json_body(body);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
        assert_eq!(usage.cache_creation_input_tokens, 1);
        assert_eq!(usage.cache_read_input_tokens, 2);
    }

    #[test]
    fn parse_usage_from_json_body_defaults_when_absent() {
        assert_eq!(parse_usage_from_json_body(b"{}"), TokenUsage::default());
    }
}
