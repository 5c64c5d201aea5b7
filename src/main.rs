//! Herald push notification gateway.
//!
//! Main entry point: loads configuration, wires the shared worker pool
//! and both provider services, and serves the HTTP boundary until a
//! shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use herald_api::{AppState, Config};
use herald_core::{Clock, SystemClock};
use herald_delivery::{ApnsService, FcmService, WorkerPool};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config);

    info!(
        addr = %format!("{}:{}", config.host, config.port),
        worker_pool_size = config.worker_pool_size,
        callback_workers = config.callback_workers,
        "starting herald push gateway"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let pool = Arc::new(WorkerPool::new(config.worker_pool_size));
    let callbacks = Arc::new(WorkerPool::new(config.callback_workers));
    pool.start();
    callbacks.start();

    let apns = Arc::new(ApnsService::new(pool.clone(), clock.clone()));
    let fcm = Arc::new(
        FcmService::new(pool.clone(), clock.clone()).context("failed to set up FCM service")?,
    );
    let state = AppState::new(
        apns,
        fcm,
        callbacks.clone(),
        config.callback_timeout(),
        clock,
    );

    let addr = config.parse_server_addr()?;
    herald_api::start_server(state, &config, addr).await.context("HTTP server failed")?;

    // In-flight dispatches finish before the queues close.
    info!("draining worker pools");
    pool.stop().await;
    callbacks.stop().await;

    info!("herald shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based filtering.
fn init_tracing(config: &Config) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.rust_log))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(true)).init();
}
