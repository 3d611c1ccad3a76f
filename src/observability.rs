//! SSE broadcaster + chart-history sampler (spec.md §4.7, §6 "Event wire
//! (SSE)", §5 "Resource bounds": `max_history_points = 300`).

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::Event;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_HISTORY_POINTS: usize = 300;
const SAMPLER_INTERVAL: Duration = Duration::from_secs(30);

fn format_sse(event: &Event) -> String {
    format!("event: {}\ndata: {}\n\n", event.type_name(), event.to_json())
}

/// `GET /events`: one SSE client per connection, subscribed to the event bus.
/// Heartbeats (`: ping\n\n`) are emitted every 30 s of silence (spec.md §6).
pub async fn sse_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut rx = state.events.subscribe();
    let (body_tx, body_rx) = mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            let chunk = format_sse(&event);
                            if body_tx.send(Ok(bytes::Bytes::from(chunk))).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    if body_tx.send(Ok(bytes::Bytes::from_static(b": ping\n\n"))).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("SSE client disconnected");
    });

    let stream = tokio_stream::wrappers::ReceiverStream::new(body_rx);
    Response::builder()
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(stream))
        .expect("static SSE response headers are always well-formed")
}

/// One point of the chart-history ring, sampled on `SAMPLER_INTERVAL`.
#[derive(Debug, Clone, Serialize)]
pub struct ChartPoint {
    pub timestamp_ms: u64,
    pub active_connections: u64,
    pub suspended_connections: u64,
    pub healthy_endpoints: u64,
    pub total_endpoints: u64,
    pub average_response_time_ms: Option<u64>,
}

/// Bounded sample history for the observability plane's batched chart
/// payload; independent of the SSE fan-out (spec.md §5: "chart-history
/// sampler" is its own thread).
pub struct ChartHistory {
    points: RwLock<std::collections::VecDeque<ChartPoint>>,
}

impl Default for ChartHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChartHistory {
    pub fn new() -> Self {
        Self {
            points: RwLock::new(std::collections::VecDeque::with_capacity(MAX_HISTORY_POINTS)),
        }
    }

    fn push(&self, point: ChartPoint) {
        let mut guard = self.points.write();
        if guard.len() >= MAX_HISTORY_POINTS {
            guard.pop_front();
        }
        guard.push_back(point);
    }

    pub fn snapshot(&self) -> Vec<ChartPoint> {
        self.points.read().iter().cloned().collect()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Long-running task sampling system stats into `ChartHistory` and publishing
/// a `system_stats` event on the same cadence (spec.md §5, §4.7).
pub async fn run_chart_sampler_task(state: Arc<AppState>, history: Arc<ChartHistory>) {
    use crate::capability::EventPublisher;
    use crate::events::EventKind;

    let mut ticker = tokio::time::interval(SAMPLER_INTERVAL);
    loop {
        ticker.tick().await;
        let snapshot = state.endpoints.all_endpoints();
        let healthy = snapshot.iter().filter(|(_, rt)| !rt.never_checked && rt.healthy).count() as u64;
        let point = ChartPoint {
            timestamp_ms: now_ms(),
            active_connections: state.metrics_store.active_count() as u64,
            suspended_connections: state.metrics_store.suspended_count() as u64,
            healthy_endpoints: healthy,
            total_endpoints: snapshot.len() as u64,
            average_response_time_ms: state.metrics_store.average_response_time_ms(),
        };
        history.push(point.clone());
        state
            .events
            .publish(Event::new(
                "chart_sampler",
                EventKind::SystemStats {
                    active_connections: point.active_connections,
                    suspended_connections: point.suspended_connections,
                },
            ))
            .await;
    }
}
