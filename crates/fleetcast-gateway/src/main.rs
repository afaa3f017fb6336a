use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use fleetcast_core::FleetcastConfig;
use fleetcast_hub::{Hub, IndexSync, Pusher, SubscriptionIndex};
use tracing::info;

mod app;
mod http;
mod ws;

/// Real-time telemetry fan-out gateway.
#[derive(Debug, Parser)]
#[command(name = "fleetcast-gateway", version, about)]
struct Args {
    /// Path to the TOML config file. Falls back to FLEETCAST_CONFIG, then
    /// ~/.fleetcast/fleetcast.toml.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "fleetcast_gateway=info,fleetcast_hub=info,tower_http=debug".into()
            }),
        )
        .init();

    let args = Args::parse();

    // load config: --config > FLEETCAST_CONFIG env > ~/.fleetcast/fleetcast.toml
    let config_path = args.config.or_else(|| std::env::var("FLEETCAST_CONFIG").ok());
    let config = FleetcastConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        FleetcastConfig::default()
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    // subscriptions are mirrored into the index by the hub's hooks
    let index = Arc::new(SubscriptionIndex::new());
    let hub = Hub::new(config.hub.clone(), Arc::new(IndexSync::new(index.clone())));
    let pusher = Pusher::new(hub.clone(), index.clone(), config.pusher.clone());
    hub.start();
    pusher.start();

    let state = Arc::new(app::AppState::new(config, hub.clone(), index, pusher.clone()));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("Fleetcast gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // listener is closed; drain the dispatcher, then close every connection
    pusher.stop().await;
    hub.stop().await;
    info!("Fleetcast gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
