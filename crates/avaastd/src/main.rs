//! avaastd — the Avaast app-view host daemon.
//!
//! Watches one PDS account's `app.avaast.*` records, activates deploys,
//! and serves the deployed endpoints over XRPC.
//!
//! # Usage
//!
//! ```text
//! avaastd --authority did:plc:alice --port 8080 --data-dir /var/lib/avaast
//! avaastd --authority did:plc:alice --relay-url wss://relay.example
//! avaastd --config avaast.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use avaast_core::AvaastConfig;
use avaast_deploy::{ManifestBuilder, Orchestrator, RecordStore};
use avaast_gateway::{
    build_router, spawn_admin_loop, DynamicRouter, ExecutionService, GatewayState,
    SubscriptionManager, TrafficShaper,
};
use avaast_pds::{PdsClient, PdsResolver};
use avaast_query::{QueryEngine, RoutingDataSource};
use avaast_store::{ChangeLog, CursorStore};
use avaast_watcher::{Watcher, WatcherConfig};

use avaastd::Controller;

#[derive(Parser)]
#[command(name = "avaastd", about = "Avaast app-view host")]
struct Cli {
    /// Authority identifier (DID) whose records drive this host.
    #[arg(long)]
    authority: Option<String>,

    /// Optional avaast.toml config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/avaast")]
    data_dir: PathBuf,

    /// Relay WebSocket URL; selects relay mode for the watcher.
    #[arg(long)]
    relay_url: Option<String>,

    /// PDS base URL; resolved from the authority DID when absent.
    #[arg(long)]
    pds_url: Option<String>,

    /// Polling interval in seconds for the fallback transport.
    #[arg(long, default_value = "30")]
    poll_interval: u64,

    /// Maximum concurrently active deploys.
    #[arg(long, default_value = "2")]
    max_active: usize,

    /// Query cache TTL in seconds. Defaults to the engine's built-in TTL.
    #[arg(long)]
    cache_ttl: Option<u64>,

    /// Extra collections to watch beyond the app.avaast.* set.
    #[arg(long)]
    watch_collection: Vec<String>,
}

/// Effective settings after merging the config file under the CLI.
struct Settings {
    authority: String,
    port: u16,
    data_dir: PathBuf,
    relay_url: Option<String>,
    pds_url: Option<String>,
    poll_interval: Duration,
    max_active: usize,
    cache_ttl: Option<Duration>,
    extra_collections: Vec<String>,
}

fn merge_settings(cli: Cli, config: Option<AvaastConfig>) -> anyhow::Result<Settings> {
    let watch = config.as_ref().map(|c| &c.watch);
    let server = config.as_ref().and_then(|c| c.server.as_ref());
    let limits = config.as_ref().and_then(|c| c.limits.as_ref());

    let authority = cli
        .authority
        .or_else(|| watch.map(|w| w.authority.clone()))
        .ok_or_else(|| anyhow::anyhow!("--authority or a config file is required"))?;

    let mut extra_collections = cli.watch_collection;
    if let Some(cfg_extras) = watch.and_then(|w| w.extra_collections.clone()) {
        extra_collections.extend(cfg_extras);
    }

    Ok(Settings {
        authority,
        port: server.and_then(|s| s.port).unwrap_or(cli.port),
        data_dir: server
            .and_then(|s| s.data_dir.clone())
            .map(PathBuf::from)
            .unwrap_or(cli.data_dir),
        relay_url: cli.relay_url.or_else(|| watch.and_then(|w| w.relay_url.clone())),
        pds_url: cli.pds_url.or_else(|| watch.and_then(|w| w.pds_url.clone())),
        poll_interval: Duration::from_secs(
            limits
                .and_then(|l| l.poll_interval_secs)
                .unwrap_or(cli.poll_interval),
        ),
        max_active: limits
            .and_then(|l| l.max_active_deploys)
            .unwrap_or(cli.max_active),
        cache_ttl: cli
            .cache_ttl
            .or_else(|| limits.and_then(|l| l.cache_ttl_secs))
            .map(Duration::from_secs),
        extra_collections,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,avaastd=debug,avaast=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Some(AvaastConfig::from_file(path)?),
        None => None,
    };
    let settings = merge_settings(cli, config)?;

    info!(authority = %settings.authority, "avaastd starting");

    // ── Durable state ──────────────────────────────────────────
    std::fs::create_dir_all(&settings.data_dir)?;
    let db = avaast_store::db::open(&settings.data_dir.join("avaast.redb"))?;
    let cursors = CursorStore::new(db.clone());
    let changelog = ChangeLog::new(db);
    info!(path = ?settings.data_dir, "durable store opened");

    // ── PDS access ─────────────────────────────────────────────
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let resolver = PdsResolver::new(http.clone());
    let mut pds_client = PdsClient::new(http, resolver.clone());
    if let Some(base) = &settings.pds_url {
        pds_client = pds_client.with_base_url(base);
    }

    // ── Deploy pipeline ────────────────────────────────────────
    let records = RecordStore::new();
    let builder = ManifestBuilder::new(records.clone(), pds_client.clone());
    let (transition_tx, transition_rx) = mpsc::unbounded_channel();
    let orchestrator = Arc::new(
        Orchestrator::new(builder, settings.max_active).with_transitions(transition_tx),
    );
    info!(max_active = settings.max_active, "orchestrator initialized");

    // ── Query engine ───────────────────────────────────────────
    let data_source = Arc::new(RoutingDataSource::new(
        pds_client.clone(),
        Some(changelog.clone()),
    ));
    let engine = Arc::new(QueryEngine::new(data_source, settings.authority.clone()));
    let mut exec = ExecutionService::new(orchestrator.clone(), engine);
    if let Some(ttl) = settings.cache_ttl {
        exec = exec.with_cache_ttl(ttl);
    }
    let exec = Arc::new(exec);

    // ── Gateway ────────────────────────────────────────────────
    let subscriptions = Arc::new(SubscriptionManager::new());
    let gateway = GatewayState::new(
        Arc::new(DynamicRouter::new()),
        Arc::new(TrafficShaper::new()),
        exec,
        subscriptions.clone(),
    );
    let (admin_tx, admin_rx) = mpsc::channel(64);
    let admin_handle = spawn_admin_loop(gateway.clone(), admin_rx);

    // ── Watcher ────────────────────────────────────────────────
    let mut watcher_config = WatcherConfig::new(settings.authority.clone());
    watcher_config.relay_url = settings.relay_url.clone();
    watcher_config.pds_base = settings.pds_url.clone();
    watcher_config.extra_collections = settings.extra_collections.clone();
    watcher_config.poll_interval = settings.poll_interval;
    let (watcher, events) = Watcher::start(
        watcher_config,
        pds_client,
        resolver,
        cursors,
        Some(changelog),
    );
    info!("watcher started");

    // ── Controller ─────────────────────────────────────────────
    let controller = Arc::new(Controller::new(
        records,
        orchestrator,
        subscriptions,
        admin_tx,
    ));
    let controller_handle = tokio::spawn(controller.run(events, transition_rx));

    // ── HTTP surface ───────────────────────────────────────────
    let router = build_router(gateway);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    info!(%addr, "gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
        })
        .await?;

    watcher.stop();
    controller_handle.abort();
    admin_handle.abort();
    info!("avaastd stopped");
    Ok(())
}
