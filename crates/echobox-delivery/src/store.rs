//! Storage abstraction layer for the delivery engine.
//!
//! Trait-based abstraction over job store operations so delivery logic,
//! retry policy, and lifecycle handling can be tested without a database.
//! Production uses the concrete `echobox_core::storage::Storage`; tests use
//! the in-memory mock below.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use echobox_core::{
    error::Result,
    models::{JobId, ScheduledJob},
};

/// Store operations required by the delivery engine.
///
/// Mirrors the claim/transition contract of the repository layer: claims
/// are atomic and exclusive, transitions touch only rows the calling
/// worker already owns.
pub trait JobStore: Send + Sync + 'static {
    /// Claims due jobs for processing.
    ///
    /// Production uses `FOR UPDATE SKIP LOCKED` so concurrent callers skip
    /// each other's candidates instead of blocking. Returns up to
    /// `batch_size` jobs, earliest-due first, each atomically moved to
    /// `in_progress`.
    fn claim_due(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ScheduledJob>>> + Send + '_>>;

    /// Marks a claimed job as delivered (terminal).
    fn mark_delivered(
        &self,
        job_id: JobId,
        attempts: i32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Re-queues a claimed job with a backoff window after a failed attempt.
    fn schedule_retry(
        &self,
        job_id: JobId,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Marks a claimed job as permanently failed (terminal).
    fn mark_failed(
        &self,
        job_id: JobId,
        attempts: i32,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Finds a job by ID, for tests and monitoring.
    fn find_job(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ScheduledJob>>> + Send + '_>>;

    /// Recovers jobs stuck `in_progress` since before `abandoned_before`.
    fn reclaim_stale(
        &self,
        abandoned_before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;
}

/// Production store implementation backed by PostgreSQL.
pub struct PostgresJobStore {
    storage: Arc<echobox_core::storage::Storage>,
}

impl PostgresJobStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<echobox_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl JobStore for PostgresJobStore {
    fn claim_due(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ScheduledJob>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.claim_due(batch_size).await })
    }

    fn mark_delivered(
        &self,
        job_id: JobId,
        attempts: i32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.mark_delivered(job_id, attempts).await })
    }

    fn schedule_retry(
        &self,
        job_id: JobId,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.jobs.schedule_retry(job_id, attempts, next_attempt_at, &error).await
        })
    }

    fn mark_failed(
        &self,
        job_id: JobId,
        attempts: i32,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.mark_failed(job_id, attempts, &error).await })
    }

    fn find_job(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ScheduledJob>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.find_by_id(job_id).await })
    }

    fn reclaim_stale(
        &self,
        abandoned_before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.reclaim_stale(abandoned_before).await })
    }
}

pub mod mock {
    //! In-memory mock store for testing delivery logic.
    //!
    //! Implements the same eligibility predicate and claim atomicity as the
    //! Postgres repository: claims run under a single write lock, so
    //! concurrent claimers can never take the same job. Time comparisons go
    //! through an injected [`Clock`] for deterministic tests.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use chrono::{DateTime, Utc};
    use echobox_core::{
        error::{CoreError, Result},
        models::{JobId, JobStatus, ScheduledJob},
        time::Clock,
    };
    use tokio::sync::RwLock;

    use super::JobStore;

    /// Mock store holding jobs in memory with configurable failures.
    pub struct MockJobStore {
        jobs: Arc<RwLock<HashMap<JobId, ScheduledJob>>>,
        claim_error: Arc<RwLock<Option<String>>>,
        clock: Arc<dyn Clock>,
    }

    impl MockJobStore {
        /// Creates an empty mock store over the given clock.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                jobs: Arc::new(RwLock::new(HashMap::new())),
                claim_error: Arc::new(RwLock::new(None)),
                clock,
            }
        }

        /// Inserts a job in whatever state it carries.
        pub async fn insert_job(&self, job: ScheduledJob) {
            self.jobs.write().await.insert(job.id, job);
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            *self.claim_error.write().await = Some(error.into());
        }

        /// Current status of a job, if present.
        pub async fn job_status(&self, job_id: JobId) -> Option<JobStatus> {
            self.jobs.read().await.get(&job_id).map(|j| j.status)
        }

        /// Snapshot of a job, if present.
        pub async fn job(&self, job_id: JobId) -> Option<ScheduledJob> {
            self.jobs.read().await.get(&job_id).cloned()
        }

        /// Owner cancel with the repository's conditional semantics: only
        /// a `scheduled` or `paused` job can be cancelled; anything else
        /// is a conflict and the row is left untouched.
        pub async fn cancel(&self, job_id: JobId) -> Result<ScheduledJob> {
            let now = self.clock.now();
            let mut guard = self.jobs.write().await;

            let Some(job) = guard.get_mut(&job_id) else {
                return Err(CoreError::NotFound(format!("job {job_id} not found")));
            };

            if !matches!(job.status, JobStatus::Scheduled | JobStatus::Paused) {
                return Err(CoreError::Conflict(format!(
                    "cannot cancel job {job_id} in status {}",
                    job.status
                )));
            }

            job.status = JobStatus::Cancelled;
            job.cancelled_at = Some(now);
            job.updated_at = now;
            Ok(job.clone())
        }

        fn eligible(job: &ScheduledJob, now: DateTime<Utc>) -> bool {
            job.status == JobStatus::Scheduled
                && job.scheduled_for <= now
                && job.next_attempt_at.is_none_or(|t| t <= now)
                && job.attempts < job.max_attempts
        }
    }

    impl JobStore for MockJobStore {
        fn claim_due(
            &self,
            batch_size: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<ScheduledJob>>> + Send + '_>> {
            let jobs = self.jobs.clone();
            let claim_error = self.claim_error.clone();
            let now = self.clock.now();

            Box::pin(async move {
                if let Some(error) = claim_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                // Single write guard makes the select-and-transition atomic,
                // matching the production claim transaction.
                let mut guard = jobs.write().await;

                let mut due: Vec<JobId> = guard
                    .values()
                    .filter(|job| Self::eligible(job, now))
                    .map(|job| (job.scheduled_for, job.id))
                    .collect::<std::collections::BTreeSet<_>>()
                    .into_iter()
                    .map(|(_, id)| id)
                    .collect();
                due.truncate(batch_size);

                let mut claimed = Vec::with_capacity(due.len());
                for id in due {
                    if let Some(job) = guard.get_mut(&id) {
                        job.status = JobStatus::InProgress;
                        job.last_attempt_at = Some(now);
                        job.updated_at = now;
                        claimed.push(job.clone());
                    }
                }

                Ok(claimed)
            })
        }

        fn mark_delivered(
            &self,
            job_id: JobId,
            attempts: i32,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            let now = self.clock.now();
            Box::pin(async move {
                if let Some(job) = jobs.write().await.get_mut(&job_id) {
                    if job.status == JobStatus::InProgress {
                        job.status = JobStatus::Delivered;
                        job.delivered_at = Some(now);
                        job.attempts = attempts;
                        job.next_attempt_at = None;
                        job.last_error = None;
                        job.updated_at = now;
                    }
                }
                Ok(())
            })
        }

        fn schedule_retry(
            &self,
            job_id: JobId,
            attempts: i32,
            next_attempt_at: DateTime<Utc>,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            let now = self.clock.now();
            Box::pin(async move {
                if let Some(job) = jobs.write().await.get_mut(&job_id) {
                    if job.status == JobStatus::InProgress {
                        job.status = JobStatus::Scheduled;
                        job.attempts = attempts;
                        job.next_attempt_at = Some(next_attempt_at);
                        job.last_error = Some(error);
                        job.updated_at = now;
                    }
                }
                Ok(())
            })
        }

        fn mark_failed(
            &self,
            job_id: JobId,
            attempts: i32,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            let now = self.clock.now();
            Box::pin(async move {
                if let Some(job) = jobs.write().await.get_mut(&job_id) {
                    if job.status == JobStatus::InProgress {
                        job.status = JobStatus::Failed;
                        job.failed_at = Some(now);
                        job.attempts = attempts;
                        job.next_attempt_at = None;
                        job.last_error = Some(error);
                        job.updated_at = now;
                    }
                }
                Ok(())
            })
        }

        fn find_job(
            &self,
            job_id: JobId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<ScheduledJob>>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move { Ok(jobs.read().await.get(&job_id).cloned()) })
        }

        fn reclaim_stale(
            &self,
            abandoned_before: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            let jobs = self.jobs.clone();
            let now = self.clock.now();
            Box::pin(async move {
                let mut reclaimed = 0;
                for job in jobs.write().await.values_mut() {
                    let abandoned = job.status == JobStatus::InProgress
                        && job.last_attempt_at.is_some_and(|t| t < abandoned_before);
                    if abandoned {
                        job.attempts += 1;
                        if job.attempts >= job.max_attempts {
                            job.status = JobStatus::Failed;
                            job.failed_at = Some(now);
                        } else {
                            job.status = JobStatus::Scheduled;
                        }
                        job.last_error =
                            Some("delivery worker lost before committing a result".to_string());
                        job.updated_at = now;
                        reclaimed += 1;
                    }
                }
                Ok(reclaimed)
            })
        }
    }
}
