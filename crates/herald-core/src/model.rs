//! Wire types for push requests and responses.
//!
//! The JSON shapes here are the gateway's public contract: callers submit a
//! [`Request`] and receive a [`Response`] aggregating one
//! [`DeviceResponse`] per device token. Payloads ride through as raw JSON
//! so the gateway never re-shapes what callers hand it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Target provider derived from a request's credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Apple Push Notification Service.
    Apns,
    /// Firebase Cloud Messaging (legacy send endpoint).
    Fcm,
}

impl Platform {
    /// Provider name as it appears in `Response.service`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apns => "apns",
            Self::Fcm => "fcm",
        }
    }
}

/// One logical push submission.
///
/// Exactly one of `apns` / `fcm` must be present; that choice selects the
/// provider. Device sets come in two forms that may be combined: a
/// multiplexed set (one payload, many devices) and a batched map (one
/// payload per device).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    /// Opaque caller-supplied identifier, echoed back on the response.
    #[serde(default)]
    pub push_id: String,

    /// Second opaque identifier, echoed back untouched.
    #[serde(default)]
    pub custom_id: String,

    /// One payload delivered to each listed device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplexed: Option<Multiplexed>,

    /// Distinct payload per device, keyed by device token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batched: Option<Batched>,

    /// APNS credentials; presence selects the APNS provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apns: Option<ApnsAuth>,

    /// FCM credentials; presence selects the FCM provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcm: Option<FcmAuth>,
}

impl Request {
    /// Resolves the target platform from the supplied credentials.
    ///
    /// Returns `None` when both or neither credential block is present;
    /// such requests are rejected at the HTTP boundary.
    pub fn platform(&self) -> Option<Platform> {
        match (&self.apns, &self.fcm) {
            (Some(_), None) => Some(Platform::Apns),
            (None, Some(_)) => Some(Platform::Fcm),
            _ => None,
        }
    }

    /// True if the request targets APNS.
    pub fn is_apns(&self) -> bool {
        self.platform() == Some(Platform::Apns)
    }

    /// True if the request targets FCM.
    pub fn is_fcm(&self) -> bool {
        self.platform() == Some(Platform::Fcm)
    }
}

/// A single payload addressed to many device tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Multiplexed {
    /// Device tokens, in caller order.
    #[serde(default)]
    pub devices: Vec<String>,

    /// Raw JSON payload shared by every device in `devices`.
    pub payload: Box<RawValue>,
}

/// Per-device payloads keyed by device token.
pub type Batched = HashMap<String, Box<RawValue>>;

/// APNS credentials supplied on a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApnsAuth {
    /// Base64-encoded PEM bundle holding the push certificate chain and
    /// its private key.
    #[serde(default)]
    pub certificate: String,

    /// Password for the bundle's private key, empty if unencrypted.
    #[serde(default)]
    pub certificate_password: String,

    /// Targets the APNS sandbox environment when set.
    #[serde(default)]
    pub sandbox: bool,
}

/// FCM credentials supplied on a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FcmAuth {
    /// Legacy server key sent as `Authorization: key=<auth_key>`.
    #[serde(default)]
    pub auth_key: String,
}

/// One device/payload pair yielded by a [`crate::RequestCursor`].
#[derive(Debug, Clone)]
pub struct Message {
    /// Device token the payload is addressed to.
    pub token: String,

    /// Raw JSON payload for this device.
    pub payload: Box<RawValue>,
}

/// Aggregated outcome of one push submission.
///
/// `success + failure` always equals `devices.len()`. `failed` is reserved
/// for whole-request failures (credential decode, client construction);
/// per-device failures never set it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// True only if the request could not be dispatched at all.
    #[serde(default)]
    pub failed: bool,

    /// Cause of a whole-request failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PushError>,

    /// Per-device outcomes, in completion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceResponse>,

    /// Number of delivered devices.
    #[serde(default)]
    pub success: i64,

    /// Number of undelivered devices.
    #[serde(default)]
    pub failure: i64,

    /// Echo of `Request.push_id`.
    #[serde(default)]
    pub push_id: String,

    /// Echo of `Request.custom_id`.
    #[serde(default)]
    pub custom_id: String,

    /// Provider that handled the request, `"apns"` or `"fcm"`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
}

impl Response {
    /// Empty response echoing a request's identifiers.
    pub fn for_request(request: &Request, platform: Platform) -> Self {
        Self {
            push_id: request.push_id.clone(),
            custom_id: request.custom_id.clone(),
            service: platform.as_str().to_string(),
            ..Self::default()
        }
    }

    /// Whole-request failure carrying the given error record.
    pub fn failed(request: &Request, platform: Platform, error: PushError) -> Self {
        Self { failed: true, error: Some(error), ..Self::for_request(request, platform) }
    }
}

/// Outcome of one per-device backend call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceResponse {
    /// Device token this outcome belongs to.
    #[serde(default)]
    pub identifier: String,

    /// True if the provider accepted the notification.
    #[serde(default)]
    pub delivered: bool,

    /// Provider or transport error for undelivered notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PushError>,

    /// Hint that the caller may retry this device later.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub should_retry: bool,

    /// Replacement token reported by the provider, when any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub canonical: String,
}

impl DeviceResponse {
    /// Successful delivery for the given token.
    pub fn delivered(token: impl Into<String>) -> Self {
        Self { identifier: token.into(), delivered: true, ..Self::default() }
    }

    /// Failed delivery for the given token carrying an error record.
    pub fn undelivered(token: impl Into<String>, error: PushError) -> Self {
        Self { identifier: token.into(), error: Some(error), ..Self::default() }
    }
}

/// Error record attached to responses and device outcomes.
///
/// `code` carries the provider's HTTP status where one exists, or a local
/// sentinel (422, 500, 502, 503) for errors raised before a backend call
/// completed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushError {
    /// Human-readable cause.
    #[serde(default)]
    pub description: String,

    /// HTTP-like status code or local sentinel.
    #[serde(default)]
    pub code: i64,

    /// True for transient conditions worth retrying.
    #[serde(default)]
    pub should_retry: bool,

    /// Earliest instant a retry makes sense, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

impl PushError {
    /// Non-retryable error with a code and description.
    pub fn new(code: i64, description: impl Into<String>) -> Self {
        Self { code, description: description.into(), ..Self::default() }
    }

    /// Retryable error that suggests waiting until `retry_at`.
    pub fn retryable(code: i64, description: impl Into<String>, retry_at: DateTime<Utc>) -> Self {
        Self {
            code,
            description: description.into(),
            should_retry: true,
            retry_at: Some(retry_at),
        }
    }
}
