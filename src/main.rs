use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use anthropic_forwarder::capability::EndpointSelector;
use anthropic_forwarder::config::{flatten_endpoints, load_config_from, config_file_path, RuntimeConfig};
use anthropic_forwarder::db::{self, DbAdapter};
use anthropic_forwarder::endpoint::{self, EndpointManager};
use anthropic_forwarder::events::EventBus;
use anthropic_forwarder::forwarder::EndpointClientCache;
use anthropic_forwarder::observability::{run_chart_sampler_task, ChartHistory};
use anthropic_forwarder::proxy;
use anthropic_forwarder::state::{AppState, MetricsStore};
use anthropic_forwarder::suspension::SuspensionGate;
use anthropic_forwarder::usage::cost::PricingTable;
use anthropic_forwarder::usage::{self, spawn_write_queue};

/// Reverse proxy / request forwarder for the Anthropic Messages API: pools
/// of endpoints, health checking, retry and group failover, request
/// suspension, and batched usage accounting.
#[derive(Parser, Debug)]
#[command(name = "anthropic-forwarder", version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file; defaults to ~/.anthropic-forwarder/config.toml
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Run the terminal dashboard (accepted, not implemented).
    #[arg(long, conflicts_with = "no_tui")]
    tui: bool,

    /// Explicitly disable the terminal dashboard.
    #[arg(long)]
    no_tui: bool,

    /// Serve the web dashboard (accepted, not implemented).
    #[arg(long)]
    web: bool,

    /// Port for the web dashboard, if --web is set.
    #[arg(long, default_value_t = 8788)]
    web_port: u16,

    /// Pin a primary endpoint/group by name at startup.
    #[arg(short = 'p', long)]
    primary_endpoint: Option<String>,
}

fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!(error = %err, "fatal error during startup");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    if cli.tui {
        tracing::info!("--tui requested: terminal dashboard is not implemented, ignoring");
    } else if cli.no_tui {
        tracing::debug!("--no-tui: terminal dashboard explicitly disabled (default)");
    }
    if cli.web {
        tracing::info!(port = cli.web_port, "--web requested: web dashboard is not implemented, ignoring");
    }

    let config_path = cli.config.clone().unwrap_or_else(config_file_path);
    let forwarder_cfg = load_config_from(&config_path).await?;
    tracing::info!(path = %config_path.display(), groups = forwarder_cfg.groups.len(), "loaded configuration");

    let (event_bus, event_bus_worker) = EventBus::new();
    tokio::spawn(event_bus_worker.run(Arc::clone(&event_bus)));

    let endpoints = flatten_endpoints(&forwarder_cfg);
    let cooldown = std::time::Duration::from_secs(forwarder_cfg.retry.cooldown_secs);
    let endpoint_manager = Arc::new(EndpointManager::new(
        endpoints,
        forwarder_cfg.strategy,
        cooldown,
        Arc::clone(&event_bus) as Arc<dyn anthropic_forwarder::capability::EventPublisher>,
    ));

    if let Some(name) = cli.primary_endpoint.as_deref() {
        // Forced: no health check has run yet at startup, so a non-forced
        // activation would always fail the "a member must be healthy" gate.
        if endpoint_manager.activate_group(name, true).await {
            tracing::info!(group = name, "pinned primary group via -p");
        } else {
            tracing::warn!(group = name, "-p named an unknown group, ignoring");
        }
    }

    let db_adapter: Arc<dyn DbAdapter> = build_db_adapter(&forwarder_cfg.database.url).await?;
    db_adapter.bootstrap().await?;

    let pricing = Arc::new(PricingTable::new(
        forwarder_cfg.pricing.clone(),
        forwarder_cfg.default_pricing.clone(),
    ));
    let (usage_tracker, writer_handle) = spawn_write_queue(
        Arc::clone(&db_adapter),
        Arc::clone(&pricing),
        forwarder_cfg.database.clone(),
        forwarder_cfg.database.buffer_size,
    );

    let metrics_store = Arc::new(MetricsStore::new());
    let suspension_gate = Arc::new(SuspensionGate::new(forwarder_cfg.suspension.max_suspended_requests));
    let runtime_config = Arc::new(RuntimeConfig::new(forwarder_cfg.clone()));
    let http_client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()?;
    let endpoint_clients = Arc::new(EndpointClientCache::new(http_client.clone()));

    let state = Arc::new(AppState {
        config: Arc::clone(&runtime_config),
        endpoints: Arc::clone(&endpoint_manager),
        events: Arc::clone(&event_bus),
        usage: Arc::clone(&usage_tracker),
        metrics_store: Arc::clone(&metrics_store),
        suspension_gate: Arc::clone(&suspension_gate),
        http_client,
        endpoint_clients,
    });

    tokio::spawn(endpoint::health::run_health_checker_task(
        Arc::clone(&endpoint_manager),
        forwarder_cfg.health_check.clone(),
    ));
    tokio::spawn(usage::retention::run_cleanup_task(
        Arc::clone(&db_adapter),
        std::time::Duration::from_secs(forwarder_cfg.database.cleanup_interval_secs),
        forwarder_cfg.database.retention_days,
    ));
    if db_adapter.dialect_name() == "sqlite" {
        let backup_path = format!("{}.backup", forwarder_cfg.database.url.trim_start_matches("sqlite://"));
        tokio::spawn(usage::retention::run_backup_task(
            Arc::clone(&db_adapter),
            std::time::Duration::from_secs(forwarder_cfg.database.backup_interval_secs),
            backup_path,
        ));
    }
    let chart_history = Arc::new(ChartHistory::new());
    tokio::spawn(run_chart_sampler_task(Arc::clone(&state), Arc::clone(&chart_history)));

    let config_poll_handle = {
        let runtime_config = Arc::clone(&runtime_config);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(2));
            loop {
                ticker.tick().await;
                runtime_config.maybe_reload_from_disk().await;
            }
        })
    };

    let app = proxy::router(Arc::clone(&state));
    let addr: SocketAddr = format!("{}:{}", forwarder_cfg.server.host, forwarder_cfg.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "anthropic-forwarder listening");

    let shutdown = shutdown_signal();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("shutting down: flushing usage tracker");
    usage_tracker.flush().await;
    config_poll_handle.abort();
    writer_handle.abort();

    Ok(())
}

async fn build_db_adapter(url: &str) -> anyhow::Result<Arc<dyn DbAdapter>> {
    if url.starts_with("mysql://") {
        Ok(Arc::new(db::mysql::MySqlAdapter::connect(url).await?))
    } else {
        Ok(Arc::new(db::sqlite::SqliteAdapter::connect(url).await?))
    }
}

/// Waits up to 30s for in-flight requests to drain after a ctrl-c or SIGTERM
/// before `axum::serve` force-closes remaining connections (spec.md §5
/// "Cancellation": stop accepting new connections, then a bounded grace
/// window).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining in-flight requests (up to 30s)");
}
