//! Router construction and server lifecycle.
//!
//! Requests flow through `TraceLayer` and `TimeoutLayer` into the push
//! handler. Shutdown is two-phase: the signal flips `going_away` so
//! `/push` starts answering 503, then axum drains in-flight connections.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    routing::{get, post},
    Router,
};
use herald_core::Clock;
use herald_delivery::{PushService, WorkerPool};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{config::Config, handlers};

/// Shared state behind the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// APNS dispatch service.
    pub apns: Arc<dyn PushService>,
    /// FCM dispatch service.
    pub fcm: Arc<dyn PushService>,
    /// Pool draining deferred callback deliveries.
    pub callbacks: Arc<WorkerPool>,
    /// Flipped during shutdown; `/push` answers 503 while set.
    pub going_away: Arc<AtomicBool>,
    /// Per-attempt timeout for callback deliveries.
    pub callback_timeout: Duration,
    /// Clock injected into callback items.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Assembles the handler state.
    pub fn new(
        apns: Arc<dyn PushService>,
        fcm: Arc<dyn PushService>,
        callbacks: Arc<WorkerPool>,
        callback_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            apns,
            fcm,
            callbacks,
            going_away: Arc::new(AtomicBool::new(false)),
            callback_timeout,
            clock,
        }
    }

    /// Marks the service as shutting down.
    pub fn set_going_away(&self) {
        self.going_away.store(true, Ordering::Release);
    }

    /// True once shutdown has begun.
    pub fn is_going_away(&self) -> bool {
        self.going_away.load(Ordering::Acquire)
    }
}

/// Creates the router with all routes and middleware.
pub fn create_router(state: AppState, config: &Config) -> Router {
    Router::new()
        .route("/push", post(handlers::push))
        .route("/healtz", get(handlers::healtz))
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the HTTP server and serves until a shutdown signal arrives.
///
/// On SIGINT/SIGTERM the `going_away` flag is set before the listener
/// drains, so late requests get a clean 503 instead of racing dispatch
/// against pool shutdown.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn start_server(
    state: AppState,
    config: &Config,
    addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let app = create_router(state.clone(), config);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening for push requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            state.set_going_away();
            warn!("shutdown signal received, refusing new pushes");
        })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(error) => {
                tracing::error!(error = %error, "failed to install SIGTERM handler");
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C"),
        () = terminate => info!("received SIGTERM"),
    }
}
