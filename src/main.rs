//! audix-hub - Main entry point
//!
//! Rendezvous server for the Audix flat radio:
//! - HTTP control API (access requests, setup, login, station list)
//! - Presence WebSocket driving the in-memory station registry
//! - Signaling WebSocket relaying WebRTC offers/answers/ICE

mod args;
mod config;
mod registry;
mod store;
mod web;
mod ws;

use args::Args;
use clap::Parser;
use config::Config;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use web::SharedState;

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::init_from_env(
        env_logger::Env::default()
            .filter_or("AUDIX_LOG", if args.verbose { "debug" } else { "info" }),
    );

    info!("audix-hub v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration error: {}", e);
            return Err(e.into());
        }
    };
    if let Some(port) = args.port {
        info!("Overriding port to {}", port);
        config.port = port;
    }
    if let Some(web_root) = args.web_root {
        config.web_root = web_root;
    }

    let pool = store::db::connect(&config.database_url).await?;
    store::db::apply_schema(&pool).await?;

    let port = config.port;
    let state = Arc::new(SharedState::new(config, pool.clone()));

    // Expired session rows accumulate quietly; sweep them in the background.
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            match store::sessions::sweep_expired(&pool).await {
                Ok(0) => {}
                Ok(n) => info!("swept {} expired sessions", n),
                Err(e) => warn!("session sweep failed: {}", e),
            }
        }
    });

    let app = web::build_router(state);
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!("audix-hub listening on http://{}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await?;

    info!("audix-hub stopped");
    Ok(())
}
