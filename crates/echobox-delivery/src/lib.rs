//! Scheduled delivery engine with reliability guarantees.
//!
//! Processes due delivery jobs from the job store and sends the referenced
//! content to recipients over their requested channels, with bounded
//! retries, exponential backoff, and crash recovery.
//!
//! # Architecture
//!
//! The engine uses a worker pool model where multiple async tasks claim
//! jobs from PostgreSQL using `FOR UPDATE SKIP LOCKED` for lock-free work
//! distribution. Each worker handles the complete per-job lifecycle:
//!
//! 1. **Claim** - atomically move due jobs to `in_progress`
//! 2. **Resolve** - obtain a time-limited fetch URL for the content
//! 3. **Dispatch** - attempt every requested channel independently
//! 4. **Commit** - record the resulting transition and audit event
//!
//! Claims are store-only and fast; network work happens after the claim
//! commits, and the final transition is a second fast store update. Any
//! number of engine processes may poll the same store concurrently.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use echobox_core::{events::TracingAuditSink, time::RealClock};
//! use echobox_delivery::{
//!     artifact::HttpArtifactResolver,
//!     channel::{ClientConfig, HttpEmailSender, HttpSmsSender},
//!     DeliveryConfig, DeliveryEngine, DeliveryError,
//! };
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> Result<(), DeliveryError> {
//! let client_config = ClientConfig::default();
//! let mut engine = DeliveryEngine::new(
//!     &pool,
//!     Arc::new(HttpArtifactResolver::new("https://media.internal", &client_config)?),
//!     Arc::new(HttpEmailSender::new("https://mail.internal", "key", &client_config)?),
//!     Arc::new(HttpSmsSender::new("https://sms.internal", "key", &client_config)?),
//!     Arc::new(TracingAuditSink::new()),
//!     Arc::new(RealClock::new()),
//!     DeliveryConfig::default(),
//! );
//!
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod channel;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod retry;
pub mod store;
pub mod worker;
mod worker_pool;

pub use engine::DeliveryEngine;
pub use error::{DeliveryError, Result};
pub use worker::{DeliveryConfig, EngineStats};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default batch size for claiming jobs from the store.
pub const DEFAULT_BATCH_SIZE: usize = 10;
