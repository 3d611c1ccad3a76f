//! Streaming relay (spec.md §8 scenario 5): SSE bytes pass through to the
//! client unmodified while the last observed `message_delta` usage object is
//! captured for accounting.

use bytes::Bytes;
use futures_util::StreamExt;

use anthropic_forwarder::proxy::stream::RelayStream;

fn sse_event(data: &serde_json::Value) -> String {
    format!("data: {}\n\n", data)
}

#[tokio::test]
async fn relay_forwards_all_bytes_and_captures_last_usage() {
    let mut server = mockito::Server::new_async().await;

    let mut body = String::new();
    for i in 1..=10u64 {
        body.push_str(&sse_event(&serde_json::json!({
            "type": "message_delta",
            "delta": {},
            "usage": {
                "input_tokens": 12,
                "output_tokens": i * 3,
                "cache_creation_input_tokens": 0,
                "cache_read_input_tokens": 1,
            }
        })));
    }
    body.push_str(&sse_event(&serde_json::json!({"type": "message_stop"})));

    let mock = server
        .mock("GET", "/v1/messages/stream")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body.clone())
        .create_async()
        .await;

    let resp = reqwest::get(format!("{}/v1/messages/stream", server.url())).await.unwrap();
    let (outcome_tx, outcome_rx) = tokio::sync::oneshot::channel();
    let mut relay = RelayStream::new(resp, outcome_tx);

    let mut forwarded = Vec::new();
    let mut total_bytes = 0u64;
    while let Some(chunk) = relay.next().await {
        let chunk: Bytes = chunk.expect("no transport error");
        total_bytes += chunk.len() as u64;
        forwarded.extend_from_slice(&chunk);
    }
    drop(relay);

    mock.assert_async().await;
    assert_eq!(forwarded, body.as_bytes());

    let outcome = outcome_rx.await.expect("outcome sent once stream ends");
    assert_eq!(outcome.bytes_sent, total_bytes);
    assert!(!outcome.mid_stream_error);
    // Last `message_delta` observed carried output_tokens = 10 * 3.
    assert_eq!(outcome.usage.input_tokens, 12);
    assert_eq!(outcome.usage.output_tokens, 30);
    assert_eq!(outcome.usage.cache_read_input_tokens, 1);
}
