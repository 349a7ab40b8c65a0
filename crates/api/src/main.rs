#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Keygate API server.
//!
//! HTTP surface over the subscription lifecycle engine: payment creation,
//! the gateway webhook, synchronous confirmation and referral registration.

mod auth;
mod config;
mod error;
mod routes;
mod state;

use std::net::SocketAddr;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keygate_shared::{create_pool, run_migrations};

use crate::{config::Config, routes::create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,keygate_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Keygate API server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    tracing::info!("Database ready");

    let state = AppState::new(pool, config.clone())?;

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
