//! HTTP surface and configuration for the echobox delivery service.
//!
//! Exposes the job CRUD operations (create, inspect, update, cancel) and
//! health probes over axum, plus figment-based service configuration. The
//! delivery engine itself lives in `echobox-delivery`; this crate only
//! fronts the store and emits audit events for user-initiated transitions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use server::{create_router, start_server, AppState};
