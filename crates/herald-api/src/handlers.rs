//! Push and health handlers.

use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use herald_core::{Platform, Request};
use herald_delivery::{CallbackItem, PushService};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::server::AppState;

/// Query parameters accepted by `POST /push`.
#[derive(Debug, Default, Deserialize)]
pub struct PushParams {
    /// Callback URL switching the request to asynchronous mode.
    #[serde(default)]
    pub callback: Option<String>,
}

/// Accepts a push request and dispatches it.
///
/// Without a `callback` parameter the aggregated response is returned
/// inline. With one, the handler answers 202 immediately and a detached
/// task runs dispatch and enqueues the callback delivery.
///
/// Status codes: 400 for malformed JSON, 422 when the platform cannot be
/// resolved, 503 while shutting down.
pub async fn push(
    State(state): State<AppState>,
    Query(params): Query<PushParams>,
    body: Bytes,
) -> Response {
    if state.is_going_away() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let request: Request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(parse_error) => {
            warn!(error = %parse_error, "couldn't parse push request body");
            return StatusCode::BAD_REQUEST.into_response();
        },
    };

    let service = match request.platform() {
        Some(Platform::Apns) => state.apns.clone(),
        Some(Platform::Fcm) => state.fcm.clone(),
        None => {
            warn!(push_id = %request.push_id, "request platform is unresolved");
            return StatusCode::UNPROCESSABLE_ENTITY.into_response();
        },
    };

    let started = Instant::now();
    match params.callback {
        Some(callback_url) if !callback_url.is_empty() => {
            debug!(push_id = %request.push_id, callback = %callback_url, "deferred dispatch");
            tokio::spawn(async move {
                let response = service.process(request).await;
                let item = CallbackItem::new(
                    callback_url,
                    response,
                    state.callback_timeout,
                    state.clock.clone(),
                );
                if !state.callbacks.enqueue(Box::new(item)).await {
                    warn!("callback pool refused delivery, response dropped");
                }
            });
            StatusCode::ACCEPTED.into_response()
        },
        _ => {
            let response = service.process(request).await;
            info!(
                push_id = %response.push_id,
                service = %response.service,
                success = response.success,
                failure = response.failure,
                took_ms = started.elapsed().as_millis() as u64,
                "push processed"
            );
            Json(response).into_response()
        },
    }
}

/// Liveness probe.
pub async fn healtz() -> &'static str {
    "OK"
}
