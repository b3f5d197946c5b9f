//! Core domain models, audit events, and job persistence.
//!
//! Provides strongly-typed domain primitives, the job lifecycle vocabulary,
//! audit event definitions, clock abstraction, and the Postgres repository
//! layer. The delivery and API crates build on these foundations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{AuditEvent, AuditSink, MulticastAuditSink, NoOpAuditSink, TracingAuditSink};
pub use models::{
    AccountId, Channel, ChannelSet, ContactId, JobId, JobStatus, Recipient, ScheduledJob,
    DEFAULT_MAX_ATTEMPTS,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
