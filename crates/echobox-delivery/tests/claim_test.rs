//! Claim manager properties: exclusivity, eligibility, ordering.
//!
//! Runs against the in-memory mock store, which implements the same
//! atomic claim predicate as the Postgres repository, so these tests lock
//! the claiming contract without a database.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use echobox_core::{
    models::{AccountId, ChannelSet, JobId, JobStatus, Recipient, ScheduledJob},
    time::{Clock, TestClock},
};
use echobox_delivery::store::{mock::MockJobStore, JobStore};

fn job_due_at(scheduled_for: DateTime<Utc>, created_at: DateTime<Utc>) -> ScheduledJob {
    ScheduledJob::new(
        JobId::new(),
        AccountId::new(),
        "note-claim".into(),
        Recipient { contact_id: None, email: Some("a@example.com".into()), phone: None },
        ChannelSet::Email,
        scheduled_for,
        serde_json::json!({}),
        created_at,
    )
}

#[tokio::test]
async fn concurrent_claims_never_overlap() {
    let clock = TestClock::new();
    let now = clock.now();
    let store = Arc::new(MockJobStore::new(Arc::new(clock)));

    let eligible = 20usize;
    for i in 0..eligible {
        let job = job_due_at(now - chrono::Duration::minutes(i as i64 + 1), now);
        store.insert_job(job).await;
    }

    // Four concurrent claimers, batch of five each.
    let claims = futures::future::join_all((0..4).map(|_| {
        let store = store.clone();
        async move { store.claim_due(5).await.unwrap() }
    }))
    .await;

    let mut seen = HashSet::new();
    let mut total = 0usize;
    for batch in claims {
        for job in batch {
            assert!(seen.insert(job.id), "job {} claimed twice", job.id);
            assert_eq!(job.status, JobStatus::InProgress);
            total += 1;
        }
    }

    // Union of claimed ids equals min(claimers x batch, eligible).
    assert_eq!(total, eligible.min(4 * 5));
}

#[tokio::test]
async fn only_due_uncancelled_jobs_are_claimed() {
    let clock = TestClock::new();
    let now = clock.now();
    let store = MockJobStore::new(Arc::new(clock));

    let due = job_due_at(now - chrono::Duration::hours(1), now);
    let future = job_due_at(now + chrono::Duration::hours(1), now);
    let cancelled = {
        let mut job = job_due_at(now - chrono::Duration::hours(1), now);
        job.status = JobStatus::Cancelled;
        job.cancelled_at = Some(now);
        job
    };
    let paused = {
        let mut job = job_due_at(now - chrono::Duration::hours(1), now);
        job.status = JobStatus::Paused;
        job
    };

    let due_id = due.id;
    for job in [due, future.clone(), cancelled.clone(), paused.clone()] {
        store.insert_job(job).await;
    }

    let claimed = store.claim_due(10).await.unwrap();

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, due_id);

    // The ineligible jobs are untouched.
    assert_eq!(store.job_status(future.id).await, Some(JobStatus::Scheduled));
    assert_eq!(store.job_status(cancelled.id).await, Some(JobStatus::Cancelled));
    assert_eq!(store.job_status(paused.id).await, Some(JobStatus::Paused));
}

#[tokio::test]
async fn jobs_in_backoff_window_are_not_claimed() {
    let clock = TestClock::new();
    let now = clock.now();
    let store = MockJobStore::new(Arc::new(clock));

    let mut backing_off = job_due_at(now - chrono::Duration::hours(1), now);
    backing_off.attempts = 1;
    backing_off.next_attempt_at = Some(now + chrono::Duration::minutes(5));
    let id = backing_off.id;
    store.insert_job(backing_off).await;

    assert!(store.claim_due(10).await.unwrap().is_empty());

    // Eligible again once the window passes.
    let mut job = store.job(id).await.unwrap();
    job.next_attempt_at = Some(now - chrono::Duration::seconds(1));
    store.insert_job(job).await;
    assert_eq!(store.claim_due(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn exhausted_jobs_are_never_claimed() {
    let clock = TestClock::new();
    let now = clock.now();
    let store = MockJobStore::new(Arc::new(clock));

    let mut exhausted = job_due_at(now - chrono::Duration::hours(1), now);
    exhausted.attempts = exhausted.max_attempts;
    store.insert_job(exhausted).await;

    assert!(store.claim_due(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn claims_are_offered_earliest_due_first() {
    let clock = TestClock::new();
    let now = clock.now();
    let store = MockJobStore::new(Arc::new(clock));

    let late = job_due_at(now - chrono::Duration::minutes(1), now);
    let early = job_due_at(now - chrono::Duration::minutes(30), now);
    let middle = job_due_at(now - chrono::Duration::minutes(10), now);

    let (early_id, middle_id, late_id) = (early.id, middle.id, late.id);
    for job in [late, early, middle] {
        store.insert_job(job).await;
    }

    let claimed = store.claim_due(10).await.unwrap();
    let order: Vec<_> = claimed.iter().map(|j| j.id).collect();

    assert_eq!(order, vec![early_id, middle_id, late_id]);
}

#[tokio::test]
async fn empty_store_claims_empty_batch() {
    let store = MockJobStore::new(Arc::new(TestClock::new()));
    assert!(store.claim_due(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn claim_errors_surface_without_partial_state() {
    let clock = TestClock::new();
    let now = clock.now();
    let store = MockJobStore::new(Arc::new(clock));

    let job = job_due_at(now - chrono::Duration::minutes(1), now);
    let id = job.id;
    store.insert_job(job).await;
    store.inject_claim_error("store unavailable").await;

    assert!(store.claim_due(10).await.is_err());
    // The job is untouched and claimable on the next tick.
    assert_eq!(store.job_status(id).await, Some(JobStatus::Scheduled));
    assert_eq!(store.claim_due(10).await.unwrap().len(), 1);
}
