//! FCM provider: shared HTTP client, per-device sends, global backoff.
//!
//! FCM is stateless per request: the server key rides on every call, so
//! one HTTP/1.1 client with a deep idle-connection pool serves the whole
//! process. What is shared is the backoff window: every 5xx pushes
//! `wait_until` forward, honoring `Retry-After` and escalating a doubling
//! wait capped at five minutes. The window is advisory; callers read it
//! through [`FcmService::should_wait`] / [`FcmService::retry_after`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{
    Clock, DeviceResponse, Message, Platform, PushError, Request, RequestCursor, Response,
};
use reqwest::header;
use serde::Deserialize;
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    engine::{elapsed_ms, fan_out, PushService},
    error::{DeliveryError, Result},
    pool::{WorkItem, WorkerPool},
};

/// Legacy FCM send endpoint.
pub const FCM_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";

/// Idle connections kept per host.
const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 1024;

/// First escalation step of the backoff window, in seconds.
const INITIAL_BACKOFF_SECONDS: i64 = 5;

/// Escalation cap, in seconds.
const MAX_BACKOFF_SECONDS: i64 = 300;

/// Retry hint attached to transport failures, in seconds.
const CONNECT_RETRY_SECONDS: i64 = 300;

#[derive(Debug, Default)]
struct BackoffWindow {
    wait_until: Option<DateTime<Utc>>,
    current_wait: i64,
}

/// Shared backoff state fed by FCM 5xx responses.
#[derive(Debug, Default)]
pub struct FcmBackoff {
    state: Mutex<BackoffWindow>,
}

impl FcmBackoff {
    /// Creates an empty backoff window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a 5xx response and returns the new `wait_until`.
    ///
    /// The window starts at `now`, extends by the server's `Retry-After`
    /// when one was sent, then by the escalating wait: 5 s on first
    /// error, doubling per error, capped at 300 s.
    pub fn record_server_error(
        &self,
        retry_after: Option<i64>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut wait_until = now;
        if let Some(seconds) = retry_after {
            wait_until += chrono::Duration::seconds(seconds.max(0));
        }
        state.current_wait = if state.current_wait == 0 {
            INITIAL_BACKOFF_SECONDS
        } else {
            (state.current_wait * 2).min(MAX_BACKOFF_SECONDS)
        };
        wait_until += chrono::Duration::seconds(state.current_wait);
        state.wait_until = Some(wait_until);
        wait_until
    }

    /// True while the window extends past `now`.
    pub fn should_wait(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.wait_until.is_some_and(|until| until > now)
    }

    /// Seconds until the window closes, zero when it already has.
    pub fn retry_after(&self, now: DateTime<Utc>) -> i64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .wait_until
            .map_or(0, |until| (until - now).num_seconds().max(0))
    }

    /// Current escalation step, in seconds.
    pub fn current_wait(&self) -> i64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).current_wait
    }
}

/// Subset of the FCM send response the gateway inspects. Remaining fields
/// are ignored.
#[derive(Debug, Default, Deserialize)]
struct FcmResponseBody {
    #[serde(default)]
    results: Vec<FcmResult>,
}

#[derive(Debug, Default, Deserialize)]
struct FcmResult {
    #[serde(default)]
    error: String,
    #[serde(default)]
    registration_id: String,
}

/// Builds the per-device FCM payload: the caller's JSON object with
/// `registration_ids` overwritten to the singleton token list.
pub(crate) fn compose_payload(token: &str, payload: &RawValue) -> serde_json::Result<Vec<u8>> {
    let mut parsed: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(payload.get())?;
    parsed.insert("registration_ids".to_string(), serde_json::json!([token]));
    serde_json::to_vec(&parsed)
}

/// FCM push service sharing one HTTP client and one backoff window.
pub struct FcmService {
    pool: Arc<WorkerPool>,
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
    endpoint: String,
    backoff: Arc<FcmBackoff>,
}

impl FcmService {
    /// Creates a service targeting the production endpoint.
    pub fn new(pool: Arc<WorkerPool>, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_endpoint(pool, clock, FCM_ENDPOINT)
    }

    /// Creates a service targeting a custom endpoint (local stubs).
    pub fn with_endpoint(
        pool: Arc<WorkerPool>,
        clock: Arc<dyn Clock>,
        endpoint: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS_PER_HOST)
            .build()
            .map_err(|error| DeliveryError::client_build(error.to_string()))?;
        Ok(Self {
            pool,
            clock,
            http,
            endpoint: endpoint.into(),
            backoff: Arc::new(FcmBackoff::new()),
        })
    }

    /// Advisory: true while the shared backoff window is open.
    pub fn should_wait(&self) -> bool {
        self.backoff.should_wait(self.clock.wall())
    }

    /// Advisory: seconds until the shared backoff window closes.
    pub fn retry_after(&self) -> i64 {
        self.backoff.retry_after(self.clock.wall())
    }

    /// The shared backoff window.
    pub fn backoff(&self) -> &FcmBackoff {
        self.backoff.as_ref()
    }
}

struct FcmWork {
    message: Message,
    http: reqwest::Client,
    endpoint: String,
    auth_key: String,
    backoff: Arc<FcmBackoff>,
    clock: Arc<dyn Clock>,
    results: mpsc::Sender<DeviceResponse>,
}

impl FcmWork {
    /// Sends one notification. Every outcome, delivered or not, is traced
    /// with the elapsed time and the status that decided it.
    async fn push(&self) -> DeviceResponse {
        let token = &self.message.token;
        let started = self.clock.now();

        let payload = match compose_payload(token, &self.message.payload) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(
                    token = %token,
                    status = 422,
                    error = %error,
                    took_ms = elapsed_ms(self.clock.as_ref(), started),
                    "couldn't compose FCM payload"
                );
                return DeviceResponse::undelivered(
                    token,
                    PushError::new(422, "(pre-validation) invalid payload"),
                );
            },
        };

        let response = match self
            .http
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("key={}", self.auth_key))
            .body(payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                warn!(
                    token = %token,
                    error = %error,
                    took_ms = elapsed_ms(self.clock.as_ref(), started),
                    "couldn't connect to FCM"
                );
                let retry_at =
                    self.clock.wall() + chrono::Duration::seconds(CONNECT_RETRY_SECONDS);
                let mut device = DeviceResponse::undelivered(
                    token,
                    PushError::retryable(500, "couldn't connect to FCM", retry_at),
                );
                device.should_retry = true;
                return device;
            },
        };

        let status = response.status().as_u16();
        match status {
            200 => {
                let bytes = match response.bytes().await {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        warn!(
                            token = %token,
                            status,
                            error = %error,
                            took_ms = elapsed_ms(self.clock.as_ref(), started),
                            "couldn't read FCM response"
                        );
                        return DeviceResponse::undelivered(
                            token,
                            PushError::new(422, "couldn't read FCM response"),
                        );
                    },
                };
                let decoded: FcmResponseBody = match serde_json::from_slice(&bytes) {
                    Ok(decoded) => decoded,
                    Err(error) => {
                        warn!(
                            token = %token,
                            status,
                            error = %error,
                            took_ms = elapsed_ms(self.clock.as_ref(), started),
                            "couldn't parse FCM response"
                        );
                        return DeviceResponse::undelivered(
                            token,
                            PushError::new(422, "couldn't parse FCM response"),
                        );
                    },
                };
                let Some(result) = decoded.results.first() else {
                    warn!(
                        token = %token,
                        status,
                        took_ms = elapsed_ms(self.clock.as_ref(), started),
                        "FCM response carried no results"
                    );
                    return DeviceResponse::undelivered(
                        token,
                        PushError::new(422, "couldn't parse FCM response"),
                    );
                };

                let took_ms = elapsed_ms(self.clock.as_ref(), started);
                if result.error.is_empty() {
                    debug!(token = %token, status, took_ms, "FCM push delivered");
                } else {
                    warn!(token = %token, status, error = %result.error, took_ms, "FCM push rejected");
                }

                let mut device = DeviceResponse {
                    identifier: token.clone(),
                    delivered: result.error.is_empty(),
                    ..DeviceResponse::default()
                };
                if !result.error.is_empty() {
                    device.error =
                        Some(PushError { description: result.error.clone(), ..PushError::default() });
                }
                if !result.registration_id.is_empty() {
                    device.canonical = result.registration_id.clone();
                }
                device
            },
            401 => {
                let _ = response.bytes().await;
                warn!(
                    token = %token,
                    status,
                    took_ms = elapsed_ms(self.clock.as_ref(), started),
                    "FCM rejected api key"
                );
                DeviceResponse::undelivered(token, PushError::new(401, "wrong api key"))
            },
            400 => {
                let _ = response.bytes().await;
                warn!(
                    token = %token,
                    status,
                    took_ms = elapsed_ms(self.clock.as_ref(), started),
                    "FCM rejected payload"
                );
                DeviceResponse::undelivered(
                    token,
                    PushError::new(400, "invalid payload, check JSON"),
                )
            },
            status if status >= 500 => {
                let retry_after = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse::<i64>().ok());
                let _ = response.bytes().await;

                let wait_until =
                    self.backoff.record_server_error(retry_after, self.clock.wall());
                warn!(
                    token = %token,
                    status,
                    wait_until = %wait_until,
                    took_ms = elapsed_ms(self.clock.as_ref(), started),
                    "FCM server error, backing off"
                );

                let mut device = DeviceResponse::undelivered(
                    token,
                    PushError::retryable(i64::from(status), "FCM error", wait_until),
                );
                device.should_retry = true;
                device
            },
            other => {
                let _ = response.bytes().await;
                warn!(
                    token = %token,
                    status = other,
                    took_ms = elapsed_ms(self.clock.as_ref(), started),
                    "unexpected FCM response"
                );
                DeviceResponse::undelivered(
                    token,
                    PushError::new(i64::from(other), "Unknown response"),
                )
            },
        }
    }
}

#[async_trait]
impl WorkItem for FcmWork {
    async fn execute(self: Box<Self>) -> bool {
        let span = info_span!("fcm_push", token = %self.message.token);
        let response = self.push().instrument(span).await;
        let delivered = response.delivered;
        if self.results.send(response).await.is_err() {
            warn!(token = %self.message.token, "push outcome dropped, consumer gone");
        }
        delivered
    }
}

#[async_trait]
impl PushService for FcmService {
    async fn process(&self, request: Request) -> Response {
        let mut response = Response::for_request(&request, Platform::Fcm);
        if RequestCursor::new(&request).count() == 0 {
            return response;
        }

        let auth_key =
            request.fcm.as_ref().map(|auth| auth.auth_key.clone()).unwrap_or_default();
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        let backoff = self.backoff.clone();
        let clock = self.clock.clone();

        let outcome = fan_out(self.pool.clone(), request, move |message, results| {
            Box::new(FcmWork {
                message,
                http: http.clone(),
                endpoint: endpoint.clone(),
                auth_key: auth_key.clone(),
                backoff: backoff.clone(),
                clock: clock.clone(),
                results,
            }) as Box<dyn WorkItem>
        })
        .await;

        outcome.apply(&mut response);
        response
    }
}
