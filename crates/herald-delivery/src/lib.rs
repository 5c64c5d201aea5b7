//! Concurrent dispatch engine for the herald push gateway.
//!
//! Transforms one push request carrying N device tokens into N
//! bounded-parallel backend calls and aggregates the outcomes
//! deterministically:
//!
//! - a fixed-size [`WorkerPool`] shared by every request drains all
//!   per-device sends,
//! - the [`apns`] provider keeps a per-credential HTTP/2 client cache with
//!   TLS client identities parsed from PEM bundles,
//! - the [`fcm`] provider shares one HTTP/1.1 client and a global backoff
//!   window fed by 5xx `Retry-After` responses,
//! - the [`callback`] pipeline POSTs aggregated responses to
//!   caller-supplied URLs with a bounded exponential-backoff ladder.
//!
//! Partial failures never fail a whole request: every device gets exactly
//! one [`herald_core::DeviceResponse`] and `success + failure` always
//! equals the device count.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod apns;
pub mod callback;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod fcm;
pub mod pool;

pub use apns::ApnsService;
pub use callback::CallbackItem;
pub use engine::PushService;
pub use error::{DeliveryError, Result};
pub use fcm::{FcmBackoff, FcmService};
pub use pool::{WorkItem, WorkerPool};

/// Default size of the shared per-device send pool.
pub const DEFAULT_WORKER_COUNT: usize = 100;

/// Default size of the callback delivery pool.
pub const DEFAULT_CALLBACK_WORKERS: usize = 1;

/// Default per-attempt timeout for callback deliveries, in seconds.
pub const DEFAULT_CALLBACK_TIMEOUT_SECONDS: u64 = 30;
