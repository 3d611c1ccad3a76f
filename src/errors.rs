use thiserror::Error;

/// Failure taxonomy used on the request-forwarding path (spec.md §7).
///
/// Every variant maps 1:1 onto a `status`/`failure_reason` token persisted by
/// the usage tracker, so the `Display` impl intentionally yields the exact
/// token rather than a human sentence.
#[derive(Debug, Clone, Error)]
pub enum ForwardError {
    #[error("network_error")]
    Network(String),
    #[error("timeout")]
    Timeout,
    #[error("auth_error")]
    Auth { status: u16 },
    #[error("rate_limited")]
    RateLimited,
    #[error("stream_error")]
    Stream(String),
    #[error("error")]
    Upstream { status: u16, body: String },
    #[error("suspend_timeout")]
    SuspendTimeout,
    #[error("client_disconnected")]
    ClientDisconnected,
    #[error("no_endpoints_available")]
    NoEndpointsAvailable,
}

impl ForwardError {
    /// The token stored in `request_logs.status` / `.failure_reason`.
    pub fn as_token(&self) -> &'static str {
        match self {
            ForwardError::Network(_) => "network_error",
            ForwardError::Timeout => "timeout",
            ForwardError::Auth { .. } => "auth_error",
            ForwardError::RateLimited => "rate_limited",
            ForwardError::Stream(_) => "stream_error",
            ForwardError::Upstream { .. } => "error",
            ForwardError::SuspendTimeout => "suspend_timeout",
            ForwardError::ClientDisconnected => "client_disconnected",
            ForwardError::NoEndpointsAvailable => "error",
        }
    }

    /// Whether this attempt is eligible for another attempt against a
    /// different endpoint (spec.md §7 "Retryable?" column).
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ForwardError::Network(_)
                | ForwardError::Timeout
                | ForwardError::Auth { .. }
                | ForwardError::RateLimited
                | ForwardError::Upstream { .. }
        )
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ForwardError::Network(_) | ForwardError::NoEndpointsAvailable => 502,
            ForwardError::Timeout => 504,
            ForwardError::Auth { status } => *status,
            ForwardError::RateLimited => 429,
            ForwardError::Stream(_) => 502,
            ForwardError::Upstream { status, .. } => *status,
            ForwardError::SuspendTimeout => 504,
            ForwardError::ClientDisconnected => 499,
        }
    }
}

/// Errors internal to the usage tracker's persistence pipeline. These never
/// propagate to the request path (spec.md §7, last line) — the write-queue
/// error handler classifies and recovers from them internally.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("database disk full: {0}")]
    DiskFull(String),
    #[error("database file corrupted: {0}")]
    Corruption(String),
    #[error("database locked: {0}")]
    Locked(String),
    #[error("database connection error: {0}")]
    Connection(#[from] sqlx::Error),
    #[error("query failed: {0}")]
    Query(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrackerError {
    /// Classify a raw sqlx error into the recovery-relevant buckets used by
    /// the error-handler's dialect-aware recovery strategy (spec.md §4.5).
    pub fn classify(err: sqlx::Error) -> TrackerError {
        let msg = err.to_string();
        let lower = msg.to_ascii_lowercase();
        if lower.contains("disk") && lower.contains("full") {
            TrackerError::DiskFull(msg)
        } else if lower.contains("malformed") || lower.contains("corrupt") {
            TrackerError::Corruption(msg)
        } else if lower.contains("locked") || lower.contains("busy") {
            TrackerError::Locked(msg)
        } else if matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut) {
            TrackerError::Connection(err)
        } else {
            TrackerError::Query(msg)
        }
    }
}

/// Errors surfaced while loading or validating on-disk configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config as TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
