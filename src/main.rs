#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # kubetunnel
//!
//! Manage Kubernetes clusters that sit behind NAT or firewalls from one
//! central dashboard. Each cluster runs an agent that dials out to the
//! dashboard and keeps a single WebSocket open; the dashboard proxies API
//! requests through it and streams watch events to browsers.
//!
//! ## Subcommands
//!
//! - `kubetunnel agent` - run inside a cluster, connect out to the dashboard
//! - `kubetunnel dashboard` - serve the HTTP/WS API agents and browsers use
//!
//! ## Dashboard API surface
//!
//! | Method | Path                                     | Auth          | Description                     |
//! |--------|------------------------------------------|---------------|---------------------------------|
//! | GET    | `/api/health`                            | No            | Liveness probe                  |
//! | GET    | `/api/ws`                                | Browser*      | Watch event subscriptions       |
//! | GET    | `/api/clusters`                          | Browser       | Connected clusters              |
//! | ANY    | `/api/clusters/{cluster}/k8s/{*path}`    | Browser       | Kubernetes API passthrough      |
//! | POST   | `/api/clusters/{cluster}/watches`        | Browser       | Start a watch                   |
//! | DELETE | `/api/clusters/{cluster}/watches/{id}`   | Browser       | Stop a watch                    |
//! | POST   | `/api/agent/register`                    | Bootstrap     | Redeem a one-time token         |
//! | GET    | `/api/agent/connect`                     | Agent token   | Agent tunnel stream             |
//!
//! *Browser WebSocket auth is via `?token=<key>` or an `Authorization` header.
//!
//! The agent serves its own `GET /api/health` (tunnel state, counters and
//! recent connection events) when `agent.health_listen` is set.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          - entry point, clap subcommands, composition root, graceful shutdown
//! auth.rs          - browser bearer tokens, constant-time comparison
//! backoff.rs       - capped exponential reconnect delay
//! config.rs        - TOML + env-var configuration
//! state.rs         - dashboard AppState, agent TunnelStats
//! k8s.rs           - kube-backed request handler, watch source, cluster probe
//! routes/
//!   health.rs      - GET /api/health (dashboard and agent)
//!   clusters.rs    - cluster list, API passthrough
//!   watches.rs     - watch start/stop
//! hub/
//!   mod.rs         - Hub, SubscriberSession, fan-out
//!   key.rs         - SubscriptionKey encoding
//!   session.rs     - browser WS reader/writer loops
//! watch/
//!   mod.rs         - WatchManager, per-watch tasks
//!   path.rs        - collection path parsing
//! tunnel/
//!   mod.rs         - wire protocol
//!   client.rs      - agent state machine: register, stream, reconnect
//!   credentials.rs - bootstrap vs registered identity, persistence
//!   relay.rs       - agent registration, request correlation, heartbeats
//!   transport.rs   - WebSocket + HTTP transport behind Dialer/Connection
//! ```

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kubetunnel::auth::TokenAuthenticator;
use kubetunnel::config::Config;
use kubetunnel::k8s::{KubeClusterInfo, KubeRequestHandler, KubeWatchSource};
use kubetunnel::tunnel::client::{TunnelClient, TunnelError};
use kubetunnel::tunnel::credentials::Credentials;
use kubetunnel::tunnel::relay::{MemoryCredentialStore, RelayState};
use kubetunnel::tunnel::transport::WsDialer;
use kubetunnel::{routes, AppState, BroadcastSink, Hub};

/// Reverse tunnel and watch fan-out for Kubernetes clusters behind NAT.
#[derive(Parser)]
#[command(name = "kubetunnel", version)]
struct Cli {
    /// Path to config file (default: kubetunnel.toml in CWD if present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the in-cluster agent.
    Agent,
    /// Run the dashboard server.
    Dashboard,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    match cli.command {
        Commands::Agent => run_agent(config).await,
        Commands::Dashboard => run_dashboard(config).await,
    }
}

async fn run_agent(config: Config) -> anyhow::Result<()> {
    config.validate_agent()?;
    info!("kubetunnel v{} agent starting", env!("CARGO_PKG_VERSION"));
    info!(endpoint = %config.agent.endpoint, cluster_name = %config.agent.cluster_name, "Agent configured");

    let credentials = Credentials::resolve(&config.agent).await?;
    if let Some(cluster_id) = credentials.cluster_id() {
        info!(cluster_id, "Using registered identity");
    }

    let kube = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let dialer = WsDialer::new(&config.agent.endpoint, config.tunnel.max_message_size)?;

    let mut client = TunnelClient::new(
        dialer,
        credentials,
        Arc::new(KubeRequestHandler::new(kube.clone())),
        Arc::new(KubeWatchSource::new(kube.clone())),
    )
    .with_cluster_name(config.agent.cluster_name.clone())
    .with_backoff(config.tunnel.backoff())
    .with_cluster_info(Arc::new(KubeClusterInfo::new(kube)))
    .with_outbound_queue(config.agent.outbound_queue)
    .with_request_concurrency(config.agent.request_concurrency);
    if let Some(path) = &config.agent.credentials_file {
        client = client.with_credentials_file(path);
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    if let Some(listen) = &config.agent.health_listen {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind agent health listener {listen}"))?;
        let app = routes::health::agent_router(client.stats());
        let shutdown = cancel.clone().cancelled_owned();
        info!("Agent health listening on {listen}");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("Agent health server error: {e}");
            }
        });
    }

    match client.run(cancel).await {
        Err(TunnelError::Cancelled) => {
            info!("Goodbye");
            Ok(())
        }
        Err(e) => Err(e).context("tunnel stopped"),
        Ok(never) => match never {},
    }
}

async fn run_dashboard(config: Config) -> anyhow::Result<()> {
    config.validate_dashboard()?;
    info!("kubetunnel v{} dashboard starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.dashboard.listen);

    let authenticator = TokenAuthenticator::new(&config.auth.tokens);
    if authenticator.is_empty() {
        warn!("No browser tokens configured, set KUBETUNNEL_API_KEY or [auth.tokens]");
    }
    if config.dashboard.bootstrap_tokens.is_empty() {
        warn!("No bootstrap tokens configured, new agents cannot register");
    }

    let hub = Arc::new(Hub::new());
    let relay = RelayState::new(
        &config.tunnel,
        Arc::new(MemoryCredentialStore::new(
            config.dashboard.bootstrap_tokens.clone(),
        )),
        Arc::clone(&hub) as Arc<dyn BroadcastSink>,
    );
    let listen = config.dashboard.listen.clone();
    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        hub,
        relay: relay.clone(),
        authenticator: Arc::new(authenticator),
    };

    let app = routes::router(state);
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!("Server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutting down...");
    relay.drain_all().await;
    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received SIGINT");
    }
}
