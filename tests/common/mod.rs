//! Shared scaffolding for the scenario tests under `tests/`: a minimal
//! `AppState` wired the same way `main.rs` wires one, but backed by a
//! tempfile-based sqlite database and mock upstreams instead of a real
//! config file and real endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anthropic_forwarder::capability::EventPublisher;
use anthropic_forwarder::config::{DatabaseConfig, ForwarderConfig, ModelPricing, RetryConfig, RuntimeConfig, SuspensionConfig};
use anthropic_forwarder::db::sqlite::SqliteAdapter;
use anthropic_forwarder::db::DbAdapter;
use anthropic_forwarder::endpoint::EndpointManager;
use anthropic_forwarder::events::EventBus;
use anthropic_forwarder::forwarder::EndpointClientCache;
use anthropic_forwarder::model::{Endpoint, EndpointAuth, SelectionStrategy};
use anthropic_forwarder::proxy;
use anthropic_forwarder::state::{AppState, MetricsStore};
use anthropic_forwarder::suspension::SuspensionGate;
use anthropic_forwarder::usage::cost::PricingTable;
use anthropic_forwarder::usage::spawn_write_queue;

pub struct Harness {
    pub state: Arc<AppState>,
    pub db_url: String,
    pub _db_dir: tempfile::TempDir,
    pub _write_queue: tokio::task::JoinHandle<()>,
}

pub fn endpoint(name: &str, url: &str, group: &str, group_priority: i32, priority: i32) -> Endpoint {
    Endpoint {
        name: name.to_string(),
        url: url.to_string(),
        group: group.to_string(),
        group_priority,
        priority,
        auth: EndpointAuth::default(),
        timeout_ms: Some(2_000),
        proxy_url: None,
    }
}

/// Builds a full `AppState` (event bus, endpoint manager, sqlite-backed usage
/// tracker, suspension gate) and returns the axum `Router` built on top of it
/// plus a handle to poke at the endpoint manager / inspect the database.
pub async fn build_harness(endpoints: Vec<Endpoint>, strategy: SelectionStrategy, retry: RetryConfig, suspension: SuspensionConfig) -> Harness {
    let db_dir = tempfile::tempdir().expect("tempdir");
    let db_path = db_dir.path().join("usage.db");
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());

    let db_adapter = SqliteAdapter::connect(&db_url).await.expect("connect sqlite");
    db_adapter.bootstrap().await.expect("bootstrap schema");
    let db_adapter: Arc<dyn DbAdapter> = Arc::new(db_adapter);

    let pricing = Arc::new(PricingTable::new(
        HashMap::new(),
        ModelPricing {
            input_per_million: 3.0,
            output_per_million: 15.0,
            cache_creation_per_million: 3.75,
            cache_read_per_million: 0.3,
        },
    ));

    let database_cfg = DatabaseConfig {
        buffer_size: 256,
        ..Default::default()
    };
    let (usage_tracker, write_queue) = spawn_write_queue(Arc::clone(&db_adapter), Arc::clone(&pricing), database_cfg, 256);

    let (event_bus, event_bus_worker) = EventBus::new();
    tokio::spawn(event_bus_worker.run(Arc::clone(&event_bus)));

    let cooldown = Duration::from_secs(retry.cooldown_secs.max(1));
    let endpoint_manager = Arc::new(EndpointManager::new(
        endpoints,
        strategy,
        cooldown,
        Arc::clone(&event_bus) as Arc<dyn EventPublisher>,
    ));

    let max_suspended_requests = suspension.max_suspended_requests;
    let forwarder_cfg = ForwarderConfig {
        retry,
        suspension,
        ..Default::default()
    };
    let runtime_config = Arc::new(RuntimeConfig::new(forwarder_cfg));

    let http_client = reqwest::Client::builder().build().expect("client builds");
    let endpoint_clients = Arc::new(EndpointClientCache::new(http_client.clone()));

    let state = Arc::new(AppState {
        config: runtime_config,
        endpoints: endpoint_manager,
        events: event_bus,
        usage: usage_tracker,
        metrics_store: Arc::new(MetricsStore::new()),
        suspension_gate: Arc::new(SuspensionGate::new(max_suspended_requests)),
        http_client,
        endpoint_clients,
    });

    Harness {
        state,
        db_url,
        _db_dir: db_dir,
        _write_queue: write_queue,
    }
}

impl Harness {
    pub fn router(&self) -> axum::Router {
        proxy::router(Arc::clone(&self.state))
    }

    /// Blocks until the write queue has flushed its current batch, so a
    /// fire-and-forget `record_*` call is guaranteed to be visible in the
    /// database before assertions run.
    pub async fn flush(&self) {
        self.state.usage.flush().await;
    }

    pub async fn db_pool(&self) -> sqlx::SqlitePool {
        sqlx::SqlitePool::connect(&self.db_url).await.expect("reconnect for assertions")
    }
}
