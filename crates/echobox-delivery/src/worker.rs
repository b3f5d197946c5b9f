//! Delivery worker: poll loop, dispatch, and lifecycle transitions.
//!
//! Each worker claims a batch of due jobs, dispatches them concurrently
//! (each claimed job is exclusively owned, so per-job parallelism is safe
//! and bounds tick latency), then commits the resulting transition per
//! job. One job's failure never prevents the rest of the batch from being
//! processed, and claim errors back off rather than crash the loop.

use std::{sync::Arc, time::Duration};

use echobox_core::{
    events::{self, AuditEvent, AuditSink},
    models::ScheduledJob,
    time::Clock,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dispatch::Dispatcher,
    error::{DeliveryError, Result},
    retry::{RetryContext, RetryDecision, RetryPolicy},
    store::JobStore,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum jobs to claim per worker batch.
    pub batch_size: usize,

    /// How often workers poll for due jobs.
    ///
    /// The first poll runs immediately at startup so jobs scheduled in the
    /// past are processed promptly after a restart.
    pub poll_interval: Duration,

    /// Validity window requested for artifact fetch URLs.
    pub url_ttl: Duration,

    /// Backoff policy applied to failed attempts.
    pub retry_policy: RetryPolicy,

    /// Jobs stuck `in_progress` longer than this are reclaimed by the
    /// stale sweep (crashed-worker recovery).
    pub stale_after: Duration,

    /// How often the stale sweep runs.
    pub reclaim_interval: Duration,

    /// Maximum time to wait for workers to finish on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(60),
            url_ttl: Duration::from_secs(24 * 3600),
            retry_policy: RetryPolicy::default(),
            stale_after: Duration::from_secs(10 * 60),
            reclaim_interval: Duration::from_secs(5 * 60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Statistics for engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Number of active delivery workers.
    pub active_workers: usize,
    /// Jobs processed since startup.
    pub jobs_processed: u64,
    /// Successful deliveries.
    pub successful_deliveries: u64,
    /// Failed attempts that were re-queued.
    pub retries_scheduled: u64,
    /// Jobs that reached terminal failure.
    pub permanent_failures: u64,
    /// Jobs currently being dispatched.
    pub in_flight: u64,
}

/// Individual worker that processes scheduled deliveries.
pub struct DeliveryWorker {
    id: usize,
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a new delivery worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        store: Arc<dyn JobStore>,
        dispatcher: Dispatcher,
        config: DeliveryConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, store, dispatcher, config, stats, cancellation_token, audit, clock }
    }

    /// Main worker loop: claims and processes batches until cancelled.
    ///
    /// The first claim runs immediately; the poll interval only applies
    /// between empty ticks.
    ///
    /// # Errors
    ///
    /// Returns error only on setup failure. Batch errors are logged and
    /// retried after a short backoff.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(processed) => {
                    if processed == 0 {
                        tokio::select! {
                            () = self.clock.sleep(self.config.poll_interval) => {}
                            () = self.cancellation_token.cancelled() => break,
                        }
                    }
                },
                Err(claim_error) => {
                    error!(
                        worker_id = self.id,
                        error = %claim_error,
                        "worker batch processing failed"
                    );
                    // Short pause avoids a tight error loop while the store
                    // is unavailable; the next tick simply retries.
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Claims one batch of due jobs and processes it to completion.
    ///
    /// Jobs in the batch are dispatched concurrently; each job commits its
    /// own transition independently.
    ///
    /// # Errors
    ///
    /// Returns error if the claim itself fails. Per-job errors are logged
    /// and do not propagate.
    pub async fn process_batch(&self) -> Result<usize> {
        let jobs = self.claim_due_jobs().await?;
        let batch_size = jobs.len();

        if batch_size == 0 {
            return Ok(0);
        }

        debug!(worker_id = self.id, batch_size, "processing claimed batch");

        // Claimed jobs run to completion even when shutdown is signalled
        // mid-batch; abandoning them would leave rows for the stale sweep
        // to count as crashed attempts.
        futures::future::join_all(jobs.into_iter().map(|job| {
            let job_id = job.id;
            async move {
                if let Err(job_error) = self.process_job(job).await {
                    error!(
                        worker_id = self.id,
                        job_id = %job_id,
                        error = %job_error,
                        "job processing failed"
                    );
                }
            }
        }))
        .await;

        Ok(batch_size)
    }

    /// Claims due jobs from the store.
    async fn claim_due_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let jobs = self
            .store
            .claim_due(self.config.batch_size)
            .await
            .map_err(|e| DeliveryError::store(format!("failed to claim due jobs: {e}")))?;

        debug!(worker_id = self.id, claimed = jobs.len(), "claimed due jobs");

        Ok(jobs)
    }

    /// Dispatches one claimed job and commits its lifecycle transition.
    async fn process_job(&self, job: ScheduledJob) -> Result<()> {
        let attempt = u32::try_from(job.attempts + 1).unwrap_or(u32::MAX);

        {
            let mut stats = self.stats.write().await;
            stats.in_flight += 1;
        }

        self.audit
            .publish(AuditEvent::AttemptStarted(events::AttemptStarted {
                job_id: job.id,
                owner_id: job.owner_id,
                attempt,
                started_at: self.clock.now(),
            }))
            .await;

        let outcome = self.dispatcher.dispatch(&job).await;
        let result = self.commit_transition(&job, attempt, &outcome).await;

        {
            let mut stats = self.stats.write().await;
            stats.in_flight -= 1;
            stats.jobs_processed += 1;
        }

        result
    }

    /// Applies the state machine to a dispatch outcome.
    ///
    /// - any channel succeeded: InProgress -> Delivered
    /// - every failure permanent: InProgress -> Failed (remaining retry
    ///   budget is not wasted on an error that can never succeed)
    /// - retry budget left: InProgress -> Scheduled with a backoff window
    /// - budget exhausted: InProgress -> Failed
    async fn commit_transition(
        &self,
        job: &ScheduledJob,
        attempt: u32,
        outcome: &crate::dispatch::DispatchOutcome,
    ) -> Result<()> {
        let attempts = i32::try_from(attempt).unwrap_or(i32::MAX);

        if outcome.any_succeeded() {
            self.store
                .mark_delivered(job.id, attempts)
                .await
                .map_err(|e| DeliveryError::store(format!("failed to mark delivered: {e}")))?;

            {
                let mut stats = self.stats.write().await;
                stats.successful_deliveries += 1;
            }

            self.audit
                .publish(AuditEvent::Delivered(events::Delivered {
                    job_id: job.id,
                    owner_id: job.owner_id,
                    attempt,
                    succeeded: outcome.succeeded_channels(),
                    failed: outcome.failed_channels(),
                    delivered_at: self.clock.now(),
                }))
                .await;

            info!(
                worker_id = self.id,
                job_id = %job.id,
                attempt,
                channels = ?outcome.succeeded_channels(),
                "job delivered"
            );
            return Ok(());
        }

        let summary = outcome.error_summary();
        let max_attempts = u32::try_from(job.max_attempts).unwrap_or(u32::MAX);

        if outcome.all_failures_permanent() {
            return self.fail_terminally(job, attempt, attempts, summary, true).await;
        }

        // Decide on the first retryable failure; backoff guidance such as
        // Retry-After comes from the channel that asked for it.
        let representative = outcome
            .channels
            .iter()
            .find_map(|c| c.result.as_ref().err().filter(|e| e.is_retryable()).cloned())
            .unwrap_or_else(|| DeliveryError::internal("dispatch failed without error detail"));

        let context = RetryContext::new(
            attempt,
            max_attempts,
            representative,
            self.clock.now(),
            self.config.retry_policy.clone(),
        );

        match context.decide_retry() {
            RetryDecision::Retry { next_attempt_at } => {
                self.store
                    .schedule_retry(job.id, attempts, next_attempt_at, summary.clone())
                    .await
                    .map_err(|e| DeliveryError::store(format!("failed to schedule retry: {e}")))?;

                {
                    let mut stats = self.stats.write().await;
                    stats.retries_scheduled += 1;
                }

                self.audit
                    .publish(AuditEvent::RetryScheduled(events::RetryScheduled {
                        job_id: job.id,
                        owner_id: job.owner_id,
                        attempt,
                        next_attempt_at,
                        error: summary.clone(),
                    }))
                    .await;

                warn!(
                    worker_id = self.id,
                    job_id = %job.id,
                    attempt,
                    next_attempt_at = %next_attempt_at,
                    error = %summary,
                    "delivery failed, retry scheduled"
                );
                Ok(())
            },
            RetryDecision::GiveUp { reason } => {
                debug!(worker_id = self.id, job_id = %job.id, reason = %reason, "giving up");
                self.fail_terminally(job, attempt, attempts, summary, false).await
            },
        }
    }

    async fn fail_terminally(
        &self,
        job: &ScheduledJob,
        attempt: u32,
        attempts: i32,
        summary: String,
        permanent: bool,
    ) -> Result<()> {
        self.store
            .mark_failed(job.id, attempts, summary.clone())
            .await
            .map_err(|e| DeliveryError::store(format!("failed to mark failed: {e}")))?;

        {
            let mut stats = self.stats.write().await;
            stats.permanent_failures += 1;
        }

        self.audit
            .publish(AuditEvent::Failed(events::Failed {
                job_id: job.id,
                owner_id: job.owner_id,
                attempt,
                error: summary.clone(),
                permanent,
                failed_at: self.clock.now(),
            }))
            .await;

        error!(
            worker_id = self.id,
            job_id = %job.id,
            attempts = attempt,
            permanent,
            error = %summary,
            "job permanently failed"
        );
        Ok(())
    }
}
