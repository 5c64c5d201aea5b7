//! APNS provider: per-credential HTTP/2 clients and per-device pushes.
//!
//! Every request carries its own certificate bundle, so clients are cached
//! per credential set: key = MD5(bundle ‖ password ‖ sandbox flag). Each
//! client is an HTTP/2 connection with the bundle's certificate as TLS
//! identity. Per-device pushes retry bounded transport failures and map
//! Apple's `{reason}` error bodies onto device outcomes.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use herald_core::{
    ApnsAuth, Clock, DeviceResponse, Message, Platform, PushError, Request, RequestCursor,
    Response,
};
use reqwest::header;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    credentials::{self, ApnsCredentials},
    engine::{elapsed_ms, fan_out, PushService},
    error::{DeliveryError, Result},
    pool::{WorkItem, WorkerPool},
};

/// Production APNS host.
pub const PRODUCTION_HOST: &str = "api.push.apple.com";

/// Sandbox APNS host.
pub const SANDBOX_HOST: &str = "api.development.push.apple.com";

/// Additional attempts after a transport failure.
const TRANSPORT_RETRIES: u32 = 5;

/// Pause between transport retries.
const TRANSPORT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Retry hint attached to transport exhaustion and 5xx outcomes.
const RETRY_AFTER_SECONDS: i64 = 300;

/// Upper bound on cached credential clients.
const CLIENT_CACHE_CAPACITY: usize = 64;

/// Idle lifetime of a cached client before it is swept.
const CLIENT_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

/// Error body returned by APNS on non-200 responses.
#[derive(Debug, Default, Deserialize)]
struct ApnsErrorBody {
    #[serde(default)]
    reason: String,
}

/// One cached HTTP/2 client bound to a credential set.
#[derive(Debug, Clone)]
pub struct ApnsClient {
    http: reqwest::Client,
    topic: Option<String>,
    base_url: String,
}

impl ApnsClient {
    /// Builds a client from parsed credentials.
    pub fn from_credentials(credentials: &ApnsCredentials, sandbox: bool) -> Result<Self> {
        let identity = reqwest::Identity::from_pem(credentials.identity_pem().as_bytes())
            .map_err(|error| DeliveryError::client_build(error.to_string()))?;
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .http2_prior_knowledge()
            .build()
            .map_err(|error| DeliveryError::client_build(error.to_string()))?;
        let host = if sandbox { SANDBOX_HOST } else { PRODUCTION_HOST };
        Ok(Self {
            http,
            topic: credentials.topic.clone(),
            base_url: format!("https://{host}"),
        })
    }

    /// Assembles a client from pre-built parts.
    ///
    /// Lets tests point pushes at a local stub with a plain HTTP client.
    pub fn from_parts(
        http: reqwest::Client,
        topic: Option<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self { http, topic, base_url: base_url.into() }
    }

    fn url_for_device(&self, token: &str) -> String {
        format!("{}/3/device/{token}", self.base_url)
    }

    /// Sends one notification, retrying bounded transport failures.
    ///
    /// Every outcome, delivered or not, is traced with the elapsed time
    /// and the status that decided it.
    pub async fn push(&self, message: &Message, clock: &dyn Clock) -> DeviceResponse {
        let url = self.url_for_device(&message.token);
        let apns_id = Uuid::new_v4().to_string();
        let body = Bytes::copy_from_slice(message.payload.get().as_bytes());
        let started = clock.now();

        let mut attempt: u32 = 0;
        let http_response = loop {
            // The body is re-seated on every attempt.
            let mut request = self
                .http
                .post(&url)
                .header(header::CONTENT_TYPE, "application/json")
                .header("Apns-Id", &apns_id)
                .body(body.clone());
            if let Some(topic) = &self.topic {
                request = request.header("Apns-Topic", topic);
            }

            match request.send().await {
                Ok(response) => break response,
                Err(error) => {
                    if attempt >= TRANSPORT_RETRIES {
                        warn!(
                            token = %message.token,
                            error = %error,
                            took_ms = elapsed_ms(clock, started),
                            "APNS unreachable, giving up"
                        );
                        let retry_at =
                            clock.wall() + chrono::Duration::seconds(RETRY_AFTER_SECONDS);
                        return DeviceResponse::undelivered(
                            &message.token,
                            PushError::retryable(502, "couldn't make request to APNS", retry_at),
                        );
                    }
                    attempt += 1;
                    debug!(token = %message.token, attempt, error = %error, "APNS transport error, retrying");
                    clock.sleep(TRANSPORT_RETRY_DELAY).await;
                },
            }
        };

        let status = http_response.status().as_u16();
        if status == 200 {
            let _ = http_response.bytes().await;
            debug!(
                token = %message.token,
                status,
                took_ms = elapsed_ms(clock, started),
                "APNS push delivered"
            );
            return DeviceResponse::delivered(&message.token);
        }

        let code = i64::from(status);
        let bytes = match http_response.bytes().await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(
                    token = %message.token,
                    status,
                    error = %error,
                    took_ms = elapsed_ms(clock, started),
                    "couldn't read APNS response"
                );
                return DeviceResponse::undelivered(
                    &message.token,
                    PushError::new(code, "couldn't read APNS response"),
                );
            },
        };
        let parsed: ApnsErrorBody = match serde_json::from_slice(&bytes) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(
                    token = %message.token,
                    status,
                    error = %error,
                    took_ms = elapsed_ms(clock, started),
                    "couldn't parse APNS response"
                );
                return DeviceResponse::undelivered(
                    &message.token,
                    PushError::new(code, "couldn't parse APNS response"),
                );
            },
        };

        warn!(
            token = %message.token,
            status,
            reason = %parsed.reason,
            took_ms = elapsed_ms(clock, started),
            "APNS push rejected"
        );
        let mut error = PushError::new(code, parsed.reason);
        if status >= 500 {
            error.should_retry = true;
            error.retry_at =
                Some(clock.wall() + chrono::Duration::seconds(RETRY_AFTER_SECONDS));
        }
        DeviceResponse::undelivered(&message.token, error)
    }
}

struct CacheEntry {
    client: Arc<ApnsClient>,
    last_used: Instant,
}

/// APNS push service with a bounded per-credential client cache.
pub struct ApnsService {
    pool: Arc<WorkerPool>,
    clock: Arc<dyn Clock>,
    clients: Mutex<HashMap<String, CacheEntry>>,
    fixed_client: Option<Arc<ApnsClient>>,
}

impl ApnsService {
    /// Creates a service dispatching into the given pool.
    pub fn new(pool: Arc<WorkerPool>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock, clients: Mutex::new(HashMap::new()), fixed_client: None }
    }

    /// Creates a service that uses one fixed client for every request,
    /// bypassing credential parsing and the cache. Test seam for local
    /// endpoints.
    pub fn with_fixed_client(
        pool: Arc<WorkerPool>,
        clock: Arc<dyn Clock>,
        client: Arc<ApnsClient>,
    ) -> Self {
        Self { pool, clock, clients: Mutex::new(HashMap::new()), fixed_client: Some(client) }
    }

    /// Looks up or constructs the client for a credential set.
    pub(crate) fn client_for(&self, auth: &ApnsAuth) -> Result<Arc<ApnsClient>> {
        if let Some(client) = &self.fixed_client {
            return Ok(client.clone());
        }

        let pem_data = credentials::decode_certificate(&auth.certificate)?;
        let key = credentials::cache_key(&pem_data, &auth.certificate_password, auth.sandbox);
        let now = self.clock.now();

        let mut clients =
            self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.retain(|_, entry| now.duration_since(entry.last_used) < CLIENT_IDLE_TTL);
        if let Some(entry) = clients.get_mut(&key) {
            entry.last_used = now;
            return Ok(entry.client.clone());
        }

        let parsed = ApnsCredentials::parse(&pem_data, &auth.certificate_password)?;
        let client = Arc::new(ApnsClient::from_credentials(&parsed, auth.sandbox)?);
        info!(
            topic = parsed.topic.as_deref().unwrap_or(""),
            sandbox = auth.sandbox,
            cached_clients = clients.len() + 1,
            "built APNS client"
        );

        if clients.len() >= CLIENT_CACHE_CAPACITY {
            if let Some(oldest) =
                clients.iter().min_by_key(|(_, entry)| entry.last_used).map(|(k, _)| k.clone())
            {
                clients.remove(&oldest);
            }
        }
        clients.insert(key, CacheEntry { client: client.clone(), last_used: now });
        Ok(client)
    }
}

struct ApnsWork {
    message: Message,
    client: Arc<ApnsClient>,
    clock: Arc<dyn Clock>,
    results: mpsc::Sender<DeviceResponse>,
}

#[async_trait]
impl WorkItem for ApnsWork {
    async fn execute(self: Box<Self>) -> bool {
        let span = info_span!("apns_push", token = %self.message.token);
        let response =
            self.client.push(&self.message, self.clock.as_ref()).instrument(span).await;
        let delivered = response.delivered;
        if self.results.send(response).await.is_err() {
            warn!(token = %self.message.token, "push outcome dropped, consumer gone");
        }
        delivered
    }
}

#[async_trait]
impl PushService for ApnsService {
    async fn process(&self, request: Request) -> Response {
        let mut response = Response::for_request(&request, Platform::Apns);
        if RequestCursor::new(&request).count() == 0 {
            return response;
        }

        let Some(auth) = request.apns.clone() else {
            return Response::failed(
                &request,
                Platform::Apns,
                DeliveryError::certificate_decode("missing apns credentials").to_push_error(),
            );
        };
        let client = match self.client_for(&auth) {
            Ok(client) => client,
            Err(error) => {
                warn!(push_id = %request.push_id, error = %error, "couldn't set up APNS client");
                return Response::failed(&request, Platform::Apns, error.to_push_error());
            },
        };

        let clock = self.clock.clone();
        let outcome = fan_out(self.pool.clone(), request, move |message, results| {
            Box::new(ApnsWork {
                message,
                client: client.clone(),
                clock: clock.clone(),
                results,
            }) as Box<dyn WorkItem>
        })
        .await;

        outcome.apply(&mut response);
        response
    }
}
