//! HTTP boundary for the herald push gateway.
//!
//! Exposes `POST /push` (synchronous dispatch or 202-plus-callback when a
//! `callback` query parameter is supplied) and the `GET /healtz` liveness
//! probe, plus the figment-based service configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use server::{create_router, start_server, AppState};
