//! Repository for scheduled delivery job database operations.
//!
//! Provides type-safe access to job rows including creation, lock-free
//! claiming for concurrent workers, lifecycle transitions, and the
//! conditional owner-action updates (pause, resume, cancel, reschedule).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{AccountId, ChannelSet, JobId, JobStatus, ScheduledJob},
};

const JOB_COLUMNS: &str = "id, owner_id, content_ref, contact_id, recipient_email, \
                           recipient_phone, channels, scheduled_for, status, attempts, \
                           max_attempts, last_attempt_at, next_attempt_at, delivered_at, \
                           failed_at, cancelled_at, last_error, metadata, created_at, updated_at";

/// Repository for scheduled job database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Claims due jobs for delivery processing.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent workers never block on
    /// each other or claim the same row: candidates locked by another
    /// in-flight claim are skipped, not waited on. Jobs are offered
    /// earliest-due first with the id as a deterministic tie-break.
    ///
    /// The eligibility predicate and the transition to `in_progress` are
    /// one transaction, so a job cancelled or paused between becoming due
    /// and being claimed is naturally excluded. The transaction touches
    /// only the store; dispatch happens after commit.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails. No partial transition
    /// is applied in that case.
    pub async fn claim_due(&self, batch_size: usize) -> Result<Vec<ScheduledJob>> {
        let mut tx = self.pool.begin().await?;

        let job_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM scheduled_jobs
            WHERE status = 'scheduled'
              AND scheduled_for <= NOW()
              AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
              AND attempts < max_attempts
            ORDER BY scheduled_for ASC, id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if job_ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let jobs = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            UPDATE scheduled_jobs
            SET status = 'in_progress', last_attempt_at = NOW(), updated_at = NOW()
            WHERE id = ANY($1)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&job_ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(jobs)
    }

    /// Creates a new scheduled job.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or constraints are violated.
    pub async fn create(&self, job: &ScheduledJob) -> Result<JobId> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO scheduled_jobs (
                id, owner_id, content_ref, contact_id, recipient_email, recipient_phone,
                channels, scheduled_for, status, attempts, max_attempts,
                metadata, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13
            )
            RETURNING id
            "#,
        )
        .bind(job.id.0)
        .bind(job.owner_id.0)
        .bind(&job.content_ref)
        .bind(job.contact_id.map(|c| c.0))
        .bind(&job.recipient_email)
        .bind(&job.recipient_phone)
        .bind(job.channels)
        .bind(job.scheduled_for)
        .bind(job.status)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(&job.metadata)
        .bind(job.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(JobId(id))
    }

    /// Marks a claimed job as successfully delivered.
    ///
    /// Terminal transition; sets `delivered_at` exactly once and records
    /// the attempt that succeeded. Guarded on `in_progress` so only the
    /// owning worker's commit can apply it.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_delivered(&self, job_id: JobId, attempts: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'delivered', delivered_at = NOW(), attempts = $2,
                next_attempt_at = NULL, last_error = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(job_id.0)
        .bind(attempts)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Re-queues a claimed job after a failed attempt.
    ///
    /// The job returns to `scheduled` with the failure recorded and a
    /// backoff-derived `next_attempt_at`; `scheduled_for` stays untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn schedule_retry(
        &self,
        job_id: JobId,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'scheduled', attempts = $2, next_attempt_at = $3,
                last_error = $4, updated_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(job_id.0)
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a claimed job as permanently failed.
    ///
    /// Terminal transition taken when the attempt budget is exhausted or
    /// every requested channel failed permanently.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(&self, job_id: JobId, attempts: i32, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'failed', failed_at = NOW(), attempts = $2,
                next_attempt_at = NULL, last_error = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(job_id.0)
        .bind(attempts)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Cancels a job on owner request.
    ///
    /// Allowed only while the job is `scheduled` or `paused`; the status
    /// check and the transition are one statement, so a job claimed or
    /// completed concurrently is rejected with a conflict rather than
    /// silently overwritten.
    ///
    /// # Errors
    ///
    /// `NotFound` if the job does not exist, `Conflict` if it is claimed
    /// or already terminal.
    pub async fn cancel(&self, job_id: JobId) -> Result<ScheduledJob> {
        let cancelled = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            UPDATE scheduled_jobs
            SET status = 'cancelled', cancelled_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('scheduled', 'paused')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        match cancelled {
            Some(job) => Ok(job),
            None => Err(self.lifecycle_conflict(job_id, "cancel").await),
        }
    }

    /// Pauses a scheduled job.
    ///
    /// # Errors
    ///
    /// `NotFound` if the job does not exist, `Conflict` unless the job is
    /// currently `scheduled`.
    pub async fn pause(&self, job_id: JobId) -> Result<ScheduledJob> {
        let paused = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            UPDATE scheduled_jobs
            SET status = 'paused', updated_at = NOW()
            WHERE id = $1 AND status = 'scheduled'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        match paused {
            Some(job) => Ok(job),
            None => Err(self.lifecycle_conflict(job_id, "pause").await),
        }
    }

    /// Resumes a paused job back to `scheduled`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the job does not exist, `Conflict` unless the job is
    /// currently `paused`.
    pub async fn resume(&self, job_id: JobId) -> Result<ScheduledJob> {
        let resumed = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            UPDATE scheduled_jobs
            SET status = 'scheduled', updated_at = NOW()
            WHERE id = $1 AND status = 'paused'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        match resumed {
            Some(job) => Ok(job),
            None => Err(self.lifecycle_conflict(job_id, "resume").await),
        }
    }

    /// Updates schedule and/or channels of a not-yet-claimed job.
    ///
    /// Allowed only while `scheduled` or `paused`, enforced in the same
    /// statement as the update. Destination validation against a channel
    /// change happens in the caller; destinations themselves are immutable
    /// so that validation cannot be raced.
    ///
    /// # Errors
    ///
    /// `NotFound` if the job does not exist, `Conflict` if it is claimed
    /// or terminal.
    pub async fn reschedule(
        &self,
        job_id: JobId,
        scheduled_for: Option<DateTime<Utc>>,
        channels: Option<ChannelSet>,
    ) -> Result<ScheduledJob> {
        let updated = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            UPDATE scheduled_jobs
            SET scheduled_for = COALESCE($2, scheduled_for),
                channels = COALESCE($3, channels),
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('scheduled', 'paused')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(scheduled_for)
        .bind(channels)
        .fetch_optional(&*self.pool)
        .await?;

        match updated {
            Some(job) => Ok(job),
            None => Err(self.lifecycle_conflict(job_id, "update").await),
        }
    }

    /// Finds a job by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, job_id: JobId) -> Result<Option<ScheduledJob>> {
        let job = sqlx::query_as::<_, ScheduledJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = $1"
        ))
        .bind(job_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(job)
    }

    /// Lists jobs for an owner, newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_by_owner(
        &self,
        owner_id: AccountId,
        status: Option<JobStatus>,
        limit: Option<i64>,
    ) -> Result<Vec<ScheduledJob>> {
        let jobs = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM scheduled_jobs
            WHERE owner_id = $1
              AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#
        ))
        .bind(owner_id.0)
        .bind(status.map(|s| s.to_string()))
        .bind(limit.unwrap_or(100))
        .fetch_all(&*self.pool)
        .await?;

        Ok(jobs)
    }

    /// Counts jobs by status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM scheduled_jobs WHERE status = $1")
                .bind(status)
                .fetch_one(&*self.pool)
                .await?;

        Ok(count.0)
    }

    /// Recovers jobs stuck `in_progress` by a crashed worker.
    ///
    /// A job claimed before `abandoned_before` whose worker never committed
    /// a result is treated as one failed attempt: it returns to `scheduled`
    /// (or goes to `failed` when that consumes the last attempt). Returns
    /// the number of jobs reclaimed.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reclaim_stale(&self, abandoned_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET attempts = attempts + 1,
                status = CASE WHEN attempts + 1 >= max_attempts
                              THEN 'failed' ELSE 'scheduled' END,
                failed_at = CASE WHEN attempts + 1 >= max_attempts
                                 THEN NOW() ELSE failed_at END,
                last_error = 'delivery worker lost before committing a result',
                updated_at = NOW()
            WHERE status = 'in_progress' AND last_attempt_at < $1
            "#,
        )
        .bind(abandoned_before)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Builds the error for a rejected conditional update: distinguishes a
    /// missing job from one in an incompatible lifecycle state.
    async fn lifecycle_conflict(&self, job_id: JobId, action: &str) -> CoreError {
        match self.find_by_id(job_id).await {
            Ok(Some(job)) => CoreError::Conflict(format!(
                "cannot {action} job {job_id} in status {}",
                job.status
            )),
            Ok(None) => CoreError::NotFound(format!("job {job_id} not found")),
            Err(err) => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
