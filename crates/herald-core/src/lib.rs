//! Core domain model for the herald push gateway.
//!
//! Defines the wire types exchanged with callers (push requests, aggregated
//! responses, per-device outcomes), the cursor used to walk a request's
//! device sets, and the clock abstraction that keeps time-dependent code
//! testable. All other crates depend on these foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cursor;
pub mod model;
pub mod time;

pub use cursor::RequestCursor;
pub use model::{
    ApnsAuth, Batched, DeviceResponse, FcmAuth, Message, Multiplexed, Platform, PushError, Request,
    Response,
};
pub use time::{Clock, SystemClock};
