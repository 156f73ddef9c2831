//! Perp Gateway — entrypoint.
//!
//! Boots config + logging, wires every component via `AppState::bootstrap`,
//! starts the Price Tape's background poll loop, and serves the Gateway
//! Facade's `axum::Router` on the configured port.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use perp_gateway::{router, AppState, Config};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perp_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        network = config.network.as_str(),
        port = config.port,
        "perp gateway starting"
    );

    let port = config.port;
    let state = AppState::bootstrap(config);

    state.price_tape.start().await;
    info!("price tape poll loop started");

    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}
