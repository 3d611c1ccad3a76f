//! Shared data types for the endpoint pool (spec.md §3).

use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use serde::{Deserialize, Serialize};

/// Strategy used to order healthy endpoints within the active group
/// (spec.md §4.1 "Candidate enumeration").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    Priority,
    Fastest,
    RoundRobin,
}

/// Per-endpoint auth + transport configuration (mutable configuration half
/// of spec.md §3's Endpoint; loaded from `EndpointSpec` in `config.rs`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EndpointAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token_env: Option<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

impl EndpointAuth {
    pub fn resolve_token(&self) -> Option<String> {
        if let Some(t) = self.bearer_token.as_deref().filter(|s| !s.trim().is_empty()) {
            return Some(t.to_string());
        }
        let env_name = self.bearer_token_env.as_deref()?;
        std::env::var(env_name)
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

/// Immutable identity + mutable configuration for one upstream API provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    pub group: String,
    pub group_priority: i32,
    pub priority: i32,
    #[serde(default)]
    pub auth: EndpointAuth,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub proxy_url: Option<String>,
}

/// Runtime (mutable, probed) health state for one endpoint. Lives in
/// `EndpointManager`'s pool behind a lock; never serialized wholesale back
/// to config.
#[derive(Debug, Clone, Default)]
pub struct EndpointRuntime {
    pub healthy: bool,
    pub never_checked: bool,
    pub last_check_time: Option<SystemTime>,
    pub response_time_ms: Option<u64>,
    pub consecutive_failures: u32,
}

impl EndpointRuntime {
    pub fn new() -> Self {
        Self {
            healthy: false,
            never_checked: true,
            last_check_time: None,
            response_time_ms: None,
            consecutive_failures: 0,
        }
    }
}

/// Mutable group state (spec.md §3 Group).
#[derive(Debug, Clone, Default)]
pub struct GroupRuntime {
    pub active: bool,
    pub cooldown_until: Option<Instant>,
    pub manual_paused: bool,
    pub manual_pause_until: Option<Instant>,
    pub manual_pinned: bool,
}

impl GroupRuntime {
    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    pub fn is_paused(&self, now: Instant) -> bool {
        if self.manual_paused {
            return match self.manual_pause_until {
                None => true,
                Some(until) => now < until,
            };
        }
        false
    }
}

/// A request's lifecycle status (spec.md §3 Connection + §7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Active,
    Completed,
    Failed,
    Timeout,
    Suspended,
    Resumed,
    Cancelled,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Completed => "completed",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Timeout => "timeout",
            ConnectionStatus::Suspended => "suspended",
            ConnectionStatus::Resumed => "resumed",
            ConnectionStatus::Cancelled => "cancelled",
        }
    }
}

/// Four-bucket token usage + derived USD cost (spec.md GLOSSARY "Token usage").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        *self == TokenUsage::default()
    }
}

/// Mints a connection id in the `req-XXXXXXXX` wire format (spec.md §6):
/// 8 lowercase hex chars from 4 cryptographically random bytes.
pub fn new_connection_id() -> String {
    let bytes: [u8; 4] = rand::random();
    format!("req-{:02x}{:02x}{:02x}{:02x}", bytes[0], bytes[1], bytes[2], bytes[3])
}
