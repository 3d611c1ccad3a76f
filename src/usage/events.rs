//! Typed ingress events submitted by request tasks to the usage tracker's
//! buffered channel (spec.md §4.5 "Ingress").

use std::time::{Duration, SystemTime};

use crate::db::UpdateOptions;
use crate::model::TokenUsage;

#[derive(Debug)]
pub enum TrackerEvent {
    Start {
        request_id: String,
        client_ip: Option<String>,
        user_agent: Option<String>,
        method: String,
        path: String,
        is_streaming: bool,
        start_time: SystemTime,
    },
    FlexibleUpdate {
        request_id: String,
        update: Box<UpdateOptions>,
    },
    Success {
        request_id: String,
        usage: TokenUsage,
        model_name: Option<String>,
        duration: Duration,
        http_status: u16,
    },
    FinalFailure {
        request_id: String,
        reason: String,
        cancel_reason: Option<String>,
        duration: Duration,
        http_status: Option<u16>,
    },
    FailedRequestTokens {
        request_id: String,
        usage: TokenUsage,
        model_name: Option<String>,
    },
    TokenRecovery {
        request_id: String,
        usage: TokenUsage,
        model_name: Option<String>,
    },
    /// Sentinel: force the write queue to drain its current batch
    /// immediately rather than waiting for `flush_interval`.
    Flush {
        ack: tokio::sync::oneshot::Sender<()>,
    },
}

impl Clone for TrackerEvent {
    /// `Flush` is intercepted before it ever reaches the retry path (see
    /// `WriteQueue::run`), so cloning it is unreachable in practice; the
    /// channel only needs one concrete event type.
    fn clone(&self) -> Self {
        match self {
            TrackerEvent::Start {
                request_id,
                client_ip,
                user_agent,
                method,
                path,
                is_streaming,
                start_time,
            } => TrackerEvent::Start {
                request_id: request_id.clone(),
                client_ip: client_ip.clone(),
                user_agent: user_agent.clone(),
                method: method.clone(),
                path: path.clone(),
                is_streaming: *is_streaming,
                start_time: *start_time,
            },
            TrackerEvent::FlexibleUpdate { request_id, update } => TrackerEvent::FlexibleUpdate {
                request_id: request_id.clone(),
                update: update.clone(),
            },
            TrackerEvent::Success {
                request_id,
                usage,
                model_name,
                duration,
                http_status,
            } => TrackerEvent::Success {
                request_id: request_id.clone(),
                usage: *usage,
                model_name: model_name.clone(),
                duration: *duration,
                http_status: *http_status,
            },
            TrackerEvent::FinalFailure {
                request_id,
                reason,
                cancel_reason,
                duration,
                http_status,
            } => TrackerEvent::FinalFailure {
                request_id: request_id.clone(),
                reason: reason.clone(),
                cancel_reason: cancel_reason.clone(),
                duration: *duration,
                http_status: *http_status,
            },
            TrackerEvent::FailedRequestTokens {
                request_id,
                usage,
                model_name,
            } => TrackerEvent::FailedRequestTokens {
                request_id: request_id.clone(),
                usage: *usage,
                model_name: model_name.clone(),
            },
            TrackerEvent::TokenRecovery {
                request_id,
                usage,
                model_name,
            } => TrackerEvent::TokenRecovery {
                request_id: request_id.clone(),
                usage: *usage,
                model_name: model_name.clone(),
            },
            TrackerEvent::Flush { .. } => unreachable!("Flush is never cloned: handled before batching"),
        }
    }
}
