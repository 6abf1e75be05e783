use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sbs_hub::auth::JwtAuthenticator;
use sbs_hub::downstream::{WsState, run_tcp_listener, serve_websocket};
use sbs_hub::fanout::run_dispatcher;
use sbs_hub::feed::{FeedRegistry, FeedSupervisor, run_upstream_listener};
use sbs_hub::observer::FlightObserver;
use sbs_hub::status::{StatusState, init_metrics, serve_status};
use sbs_hub::subscribers::{SubProtocol, SubscriberRegistry};

#[derive(Debug, Parser)]
#[command(
    name = "sbs-hub",
    about = "Merge several SBS-1 feeds to downstream clients"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the hub
    Run(RunArgs),
    /// Mint a JWT for a WebSocket subscriber
    MintToken(MintTokenArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Upstream feed to connect to, like 1.2.3.4:30003 (repeatable)
    #[arg(long = "upstream")]
    upstreams: Vec<String>,

    /// Listen address for inbound feeders, like 0.0.0.0:30003
    #[arg(long)]
    upstream_server: Option<String>,

    /// Listen address for TCP subscribers, like 0.0.0.0:1079
    #[arg(long)]
    downstream: Option<String>,

    /// Listen address for WebSocket subscribers, like 127.0.0.1:9000
    #[arg(long)]
    websocket: Option<String>,

    /// Listen address for the HTTP status reporter, like 127.0.0.1:1080
    #[arg(long)]
    status: Option<String>,

    /// Always keep feeder connections open
    #[arg(long)]
    permanent: bool,

    /// Log level (overridden by RUST_LOG when set)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Args)]
struct MintTokenArgs {
    /// User the token authenticates
    #[arg(long, default_value = "demo")]
    user: String,

    /// Maximum session duration in seconds
    #[arg(long, default_value_t = 900)]
    expires_in: u64,

    /// Absolute expiry, RFC 3339
    #[arg(long, default_value = "2099-01-01T00:00:00Z")]
    expires_on: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            init_tracing(&args.log_level);
            run(args).await
        }
        Command::MintToken(args) => mint_token(args),
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: RunArgs) -> Result<()> {
    info!("sbs-hub starting up");

    let observer = Arc::new(FlightObserver::new());
    let feeds = Arc::new(FeedRegistry::new());
    let supervisor = Arc::new(FeedSupervisor::new(
        args.upstreams.clone(),
        observer.clone(),
        feeds.clone(),
        args.permanent,
    ));
    let registry = Arc::new(SubscriberRegistry::new(supervisor.clone()));

    // the metrics recorder must exist before components start counting
    let metrics_handle = init_metrics();

    if let Some(listener) = bind(args.websocket.as_deref(), "websocket").await? {
        // refuse to start without a secret rather than reject every session
        let auth = Arc::new(
            JwtAuthenticator::from_env(&SubProtocol::names())
                .context("WebSocket listener configured")?,
        );
        let state = WsState {
            registry: registry.clone(),
            auth,
        };
        tokio::spawn(async move {
            if let Err(e) = serve_websocket(listener, state).await {
                error!(error = %e, "websocket listener failed");
            }
        });
    }

    if let Some(listener) = bind(args.upstream_server.as_deref(), "upstream server").await? {
        // the inbound feeder listener is always on, whoever is subscribed
        tokio::spawn(run_upstream_listener(
            listener,
            observer.clone(),
            feeds.clone(),
        ));
    }

    if let Some(listener) = bind(args.downstream.as_deref(), "downstream").await? {
        tokio::spawn(run_tcp_listener(listener, registry.clone()));
    }

    if let Some(listener) = bind(args.status.as_deref(), "status").await? {
        let state = StatusState {
            observer: observer.clone(),
            registry: registry.clone(),
            feeds: feeds.clone(),
            metrics: metrics_handle,
        };
        tokio::spawn(async move {
            if let Err(e) = serve_status(listener, state).await {
                error!(error = %e, "status reporter failed");
            }
        });
    }

    supervisor.start_permanent().await;

    tokio::spawn(run_dispatcher(observer, registry));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    Ok(())
}

async fn bind(addr: Option<&str>, purpose: &str) -> Result<Option<TcpListener>> {
    let Some(addr) = addr else {
        return Ok(None);
    };
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {purpose} listener to {addr}"))?;
    Ok(Some(listener))
}

fn mint_token(args: MintTokenArgs) -> Result<()> {
    let auth = JwtAuthenticator::from_env(&SubProtocol::names())?;
    let expires_on: DateTime<Utc> = args
        .expires_on
        .parse()
        .context("parsing --expires-on as RFC 3339")?;
    let token = auth.mint(&args.user, args.expires_in, expires_on)?;
    println!("{token}");
    Ok(())
}
