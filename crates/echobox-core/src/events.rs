//! Audit event system for delivery observability.
//!
//! Every job lifecycle transition is published to an audit sink: job id,
//! the transition taken, attempt count, and error detail if any. This is
//! the only record of delivery history the engine retains beyond the job
//! row itself.
//!
//! Sinks are fire-and-forget collaborators: a failing or slow sink must
//! never block or fail a delivery transition, so `publish` is infallible
//! and implementations swallow their own errors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AccountId, Channel, JobId, JobStatus};

/// Events emitted by the delivery engine, one per lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuditEvent {
    /// A worker claimed the job (Scheduled -> InProgress).
    AttemptStarted(AttemptStarted),

    /// At least one requested channel delivered (InProgress -> Delivered).
    Delivered(Delivered),

    /// All requested channels failed; the job was re-queued with a backoff
    /// window (InProgress -> Scheduled).
    RetryScheduled(RetryScheduled),

    /// The job reached terminal failure (InProgress -> Failed).
    Failed(Failed),

    /// The owner cancelled the job (Scheduled/Paused -> Cancelled).
    Cancelled(Cancelled),
}

/// Claim of a due job by a delivery worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptStarted {
    /// Job being attempted.
    pub job_id: JobId,
    /// Owning account.
    pub owner_id: AccountId,
    /// Attempt number about to run (1-based).
    pub attempt: u32,
    /// When the claim committed.
    pub started_at: DateTime<Utc>,
}

/// Successful delivery of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivered {
    /// Job that was delivered.
    pub job_id: JobId,
    /// Owning account.
    pub owner_id: AccountId,
    /// Attempt number that succeeded (1-based).
    pub attempt: u32,
    /// Channels that delivered during this attempt.
    pub succeeded: Vec<Channel>,
    /// Requested channels that failed during this attempt. Non-empty when
    /// a multi-channel request was only partially delivered.
    pub failed: Vec<Channel>,
    /// When the delivery transition committed.
    pub delivered_at: DateTime<Utc>,
}

/// A failed attempt that left retry budget, with the derived backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryScheduled {
    /// Job being retried.
    pub job_id: JobId,
    /// Owning account.
    pub owner_id: AccountId,
    /// Attempt number that just failed (1-based).
    pub attempt: u32,
    /// Earliest time the next attempt may run.
    pub next_attempt_at: DateTime<Utc>,
    /// Per-channel failure summary.
    pub error: String,
}

/// Terminal failure: retries exhausted or permanently undeliverable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failed {
    /// Job that failed.
    pub job_id: JobId,
    /// Owning account.
    pub owner_id: AccountId,
    /// Total attempts consumed.
    pub attempt: u32,
    /// Final failure detail.
    pub error: String,
    /// Whether the failure was permanent (never retryable) rather than an
    /// exhausted retry budget.
    pub permanent: bool,
    /// When the terminal transition committed.
    pub failed_at: DateTime<Utc>,
}

/// Owner-initiated cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cancelled {
    /// Job that was cancelled.
    pub job_id: JobId,
    /// Owning account.
    pub owner_id: AccountId,
    /// Status the job held before cancellation (Scheduled or Paused).
    pub previous_status: JobStatus,
    /// When the cancellation committed.
    pub cancelled_at: DateTime<Utc>,
}

/// Trait for audit sinks receiving delivery events.
///
/// Implementations must not block delivery processing: handle failures
/// internally, never propagate them.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync + std::fmt::Debug {
    /// Publishes one audit event. Infallible by contract.
    async fn publish(&self, event: AuditEvent);
}

/// Sink that discards all events. Used in tests and when auditing is off.
#[derive(Debug, Default)]
pub struct NoOpAuditSink;

impl NoOpAuditSink {
    /// Creates a new no-op sink.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl AuditSink for NoOpAuditSink {
    async fn publish(&self, _event: AuditEvent) {}
}

/// Sink that records events to the structured log.
///
/// The default production sink: downstream notification services consume
/// the log stream, so the engine itself stays decoupled from them.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl TracingAuditSink {
    /// Creates a new tracing sink.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl AuditSink for TracingAuditSink {
    async fn publish(&self, event: AuditEvent) {
        match &event {
            AuditEvent::AttemptStarted(e) => {
                tracing::info!(job_id = %e.job_id, attempt = e.attempt, "delivery attempt started");
            },
            AuditEvent::Delivered(e) => {
                tracing::info!(
                    job_id = %e.job_id,
                    attempt = e.attempt,
                    succeeded = ?e.succeeded,
                    failed = ?e.failed,
                    "job delivered"
                );
            },
            AuditEvent::RetryScheduled(e) => {
                tracing::warn!(
                    job_id = %e.job_id,
                    attempt = e.attempt,
                    next_attempt_at = %e.next_attempt_at,
                    error = %e.error,
                    "delivery failed, retry scheduled"
                );
            },
            AuditEvent::Failed(e) => {
                tracing::error!(
                    job_id = %e.job_id,
                    attempts = e.attempt,
                    permanent = e.permanent,
                    error = %e.error,
                    "job permanently failed"
                );
            },
            AuditEvent::Cancelled(e) => {
                tracing::info!(
                    job_id = %e.job_id,
                    previous_status = %e.previous_status,
                    "job cancelled"
                );
            },
        }
    }
}

/// Multicast sink forwarding events to multiple subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl MulticastAuditSink {
    /// Creates a new multicast sink with no subscribers.
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sinks.len()
    }
}

#[async_trait::async_trait]
impl AuditSink for MulticastAuditSink {
    async fn publish(&self, event: AuditEvent) {
        let futures = self.sinks.iter().map(|sink| {
            let event = event.clone();
            async move {
                sink.publish(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}
