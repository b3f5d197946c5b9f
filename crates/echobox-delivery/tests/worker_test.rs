//! Lifecycle scenarios: claim, dispatch, retry, exhaustion, recovery.
//!
//! Drives the engine one batch at a time over the mock store with stub
//! senders and a test clock, asserting the job state machine end to end.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use echobox_core::{
    events::{AuditEvent, AuditSink, NoOpAuditSink},
    models::{AccountId, Channel, ChannelSet, JobId, JobStatus, Recipient, ScheduledJob},
    time::{Clock, TestClock},
};
use echobox_delivery::{
    artifact::{stub::StubArtifactResolver, ArtifactResolver},
    channel::{
        stub::{SendBehavior, StubSender},
        EmailSender, SmsSender,
    },
    retry::RetryPolicy,
    store::{mock::MockJobStore, JobStore},
    DeliveryConfig, DeliveryEngine,
};

/// Audit sink recording every event for assertions.
#[derive(Debug, Default)]
struct RecordingSink {
    events: std::sync::Mutex<Vec<AuditEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("sink lock poisoned").clone()
    }
}

#[async_trait::async_trait]
impl AuditSink for RecordingSink {
    async fn publish(&self, event: AuditEvent) {
        self.events.lock().expect("sink lock poisoned").push(event);
    }
}

fn test_config() -> DeliveryConfig {
    DeliveryConfig {
        worker_count: 1,
        batch_size: 10,
        poll_interval: Duration::from_millis(50),
        url_ttl: Duration::from_secs(3600),
        retry_policy: RetryPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.0,
        },
        stale_after: Duration::from_secs(600),
        reclaim_interval: Duration::from_secs(300),
        shutdown_timeout: Duration::from_secs(5),
    }
}

struct TestRig {
    engine: DeliveryEngine,
    store: Arc<MockJobStore>,
    clock: TestClock,
}

fn rig(
    email: StubSender,
    sms: StubSender,
    resolver: StubArtifactResolver,
    audit: Arc<dyn AuditSink>,
) -> TestRig {
    let clock = TestClock::new();
    let store = Arc::new(MockJobStore::new(Arc::new(clock.clone())));

    let engine = DeliveryEngine::with_components(
        store.clone() as Arc<dyn JobStore>,
        Arc::new(resolver) as Arc<dyn ArtifactResolver>,
        Arc::new(email) as Arc<dyn EmailSender>,
        Arc::new(sms) as Arc<dyn SmsSender>,
        audit,
        Arc::new(clock.clone()),
        test_config(),
    );

    TestRig { engine, store, clock }
}

fn due_job(channels: ChannelSet, email: Option<&str>, phone: Option<&str>) -> ScheduledJob {
    let now = Utc::now();
    ScheduledJob::new(
        JobId::new(),
        AccountId::new(),
        "note-77".into(),
        Recipient {
            contact_id: None,
            email: email.map(String::from),
            phone: phone.map(String::from),
        },
        channels,
        now - chrono::Duration::minutes(1),
        serde_json::json!({}),
        now,
    )
}

#[tokio::test]
async fn due_email_job_is_delivered_in_one_tick() {
    let rig = rig(
        StubSender::succeeding(),
        StubSender::succeeding(),
        StubArtifactResolver::succeeding(),
        Arc::new(NoOpAuditSink::new()),
    );

    let job = due_job(ChannelSet::Email, Some("a@example.com"), None);
    let id = job.id;
    rig.store.insert_job(job).await;

    let processed = rig.engine.process_batch().await.unwrap();
    assert_eq!(processed, 1);

    let delivered = rig.store.job(id).await.unwrap();
    assert_eq!(delivered.status, JobStatus::Delivered);
    assert_eq!(delivered.attempts, 1);
    assert!(delivered.delivered_at.is_some());
    assert!(delivered.last_error.is_none());
}

#[tokio::test]
async fn failing_sms_job_exhausts_retries_across_three_ticks() {
    let rig = rig(
        StubSender::succeeding(),
        StubSender::failing(),
        StubArtifactResolver::succeeding(),
        Arc::new(NoOpAuditSink::new()),
    );

    let job = due_job(ChannelSet::Sms, None, Some("+15551230000"));
    let id = job.id;
    assert_eq!(job.max_attempts, 3);
    rig.store.insert_job(job).await;

    // Tick 1: fails, re-queued with a backoff window.
    rig.engine.process_batch().await.unwrap();
    let after_first = rig.store.job(id).await.unwrap();
    assert_eq!(after_first.status, JobStatus::Scheduled);
    assert_eq!(after_first.attempts, 1);
    assert!(after_first.next_attempt_at.is_some());
    assert!(after_first.last_error.as_deref().unwrap().contains("sms"));

    // Not yet eligible inside the backoff window.
    assert_eq!(rig.engine.process_batch().await.unwrap(), 0);

    // Tick 2 once the window passes.
    rig.clock.advance(Duration::from_secs(120));
    rig.engine.process_batch().await.unwrap();
    let after_second = rig.store.job(id).await.unwrap();
    assert_eq!(after_second.status, JobStatus::Scheduled);
    assert_eq!(after_second.attempts, 2);

    // Tick 3 consumes the last attempt and the job fails terminally.
    rig.clock.advance(Duration::from_secs(600));
    rig.engine.process_batch().await.unwrap();
    let after_third = rig.store.job(id).await.unwrap();
    assert_eq!(after_third.status, JobStatus::Failed);
    assert_eq!(after_third.attempts, 3);
    assert!(after_third.failed_at.is_some());

    // Never reclaimed afterward.
    rig.clock.advance(Duration::from_secs(7200));
    assert_eq!(rig.engine.process_batch().await.unwrap(), 0);
}

#[tokio::test]
async fn any_channel_success_marks_job_delivered() {
    let sink = Arc::new(RecordingSink::default());
    let rig = rig(
        StubSender::failing(),
        StubSender::succeeding(),
        StubArtifactResolver::succeeding(),
        sink.clone(),
    );

    let job = due_job(ChannelSet::Both, Some("a@example.com"), Some("+15551230000"));
    let id = job.id;
    rig.store.insert_job(job).await;

    rig.engine.process_batch().await.unwrap();

    // Only SMS landed, yet the job is Delivered: any-success policy for
    // multi-channel requests.
    let delivered = rig.store.job(id).await.unwrap();
    assert_eq!(delivered.status, JobStatus::Delivered);
    assert_eq!(delivered.attempts, 1);

    // The partial failure is still visible in the audit trail.
    let events = sink.events();
    let delivered_event = events
        .iter()
        .find_map(|e| match e {
            AuditEvent::Delivered(d) => Some(d.clone()),
            _ => None,
        })
        .expect("delivered event emitted");
    assert_eq!(delivered_event.succeeded, vec![Channel::Sms]);
    assert_eq!(delivered_event.failed, vec![Channel::Email]);
}

#[tokio::test]
async fn missing_destination_fails_without_consuming_retry_budget() {
    let rig = rig(
        StubSender::succeeding(),
        StubSender::succeeding(),
        StubArtifactResolver::succeeding(),
        Arc::new(NoOpAuditSink::new()),
    );

    // SMS requested but the recipient only has an email address.
    let job = due_job(ChannelSet::Sms, Some("a@example.com"), None);
    let id = job.id;
    rig.store.insert_job(job).await;

    rig.engine.process_batch().await.unwrap();

    let failed = rig.store.job(id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1, "permanent failure must not burn the full budget");
    assert!(failed.last_error.as_deref().unwrap().contains("no sms destination"));
}

#[tokio::test]
async fn permanent_provider_rejection_fails_immediately() {
    let rig = rig(
        StubSender::failing_permanently(),
        StubSender::succeeding(),
        StubArtifactResolver::succeeding(),
        Arc::new(NoOpAuditSink::new()),
    );

    let job = due_job(ChannelSet::Email, Some("bounce@example.com"), None);
    let id = job.id;
    rig.store.insert_job(job).await;

    rig.engine.process_batch().await.unwrap();

    let failed = rig.store.job(id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1);
}

#[tokio::test]
async fn resolver_outage_counts_as_one_retryable_attempt() {
    let rig = rig(
        StubSender::succeeding(),
        StubSender::succeeding(),
        StubArtifactResolver::failing(),
        Arc::new(NoOpAuditSink::new()),
    );

    let job = due_job(ChannelSet::Email, Some("a@example.com"), None);
    let id = job.id;
    rig.store.insert_job(job).await;

    rig.engine.process_batch().await.unwrap();

    let retried = rig.store.job(id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Scheduled);
    assert_eq!(retried.attempts, 1);
    assert!(retried.last_error.as_deref().unwrap().contains("artifact"));
}

#[tokio::test]
async fn transient_failure_then_success_delivers_on_second_attempt() {
    let rig = rig(
        StubSender::with_behavior(SendBehavior::FailTimes(1)),
        StubSender::succeeding(),
        StubArtifactResolver::succeeding(),
        Arc::new(NoOpAuditSink::new()),
    );

    let job = due_job(ChannelSet::Email, Some("a@example.com"), None);
    let id = job.id;
    rig.store.insert_job(job).await;

    rig.engine.process_batch().await.unwrap();
    assert_eq!(rig.store.job_status(id).await, Some(JobStatus::Scheduled));

    rig.clock.advance(Duration::from_secs(120));
    rig.engine.process_batch().await.unwrap();

    let delivered = rig.store.job(id).await.unwrap();
    assert_eq!(delivered.status, JobStatus::Delivered);
    assert_eq!(delivered.attempts, 2);
}

#[tokio::test]
async fn stale_in_progress_jobs_are_reclaimed_as_failed_attempts() {
    let rig = rig(
        StubSender::succeeding(),
        StubSender::succeeding(),
        StubArtifactResolver::succeeding(),
        Arc::new(NoOpAuditSink::new()),
    );
    let now = rig.clock.now();

    // A worker crashed mid-dispatch twenty minutes ago.
    let mut abandoned = due_job(ChannelSet::Email, Some("a@example.com"), None);
    abandoned.status = JobStatus::InProgress;
    abandoned.last_attempt_at = Some(now - chrono::Duration::minutes(20));
    let abandoned_id = abandoned.id;

    // Another crashed on its final attempt.
    let mut exhausted = due_job(ChannelSet::Email, Some("a@example.com"), None);
    exhausted.status = JobStatus::InProgress;
    exhausted.attempts = exhausted.max_attempts - 1;
    exhausted.last_attempt_at = Some(now - chrono::Duration::minutes(20));
    let exhausted_id = exhausted.id;

    // A live claim is left alone.
    let mut active = due_job(ChannelSet::Email, Some("a@example.com"), None);
    active.status = JobStatus::InProgress;
    active.last_attempt_at = Some(now - chrono::Duration::seconds(5));
    let active_id = active.id;

    for job in [abandoned, exhausted, active] {
        rig.store.insert_job(job).await;
    }

    let reclaimed = rig.engine.reclaim_stale_now().await.unwrap();
    assert_eq!(reclaimed, 2);

    let requeued = rig.store.job(abandoned_id).await.unwrap();
    assert_eq!(requeued.status, JobStatus::Scheduled);
    assert_eq!(requeued.attempts, 1);

    let dead = rig.store.job(exhausted_id).await.unwrap();
    assert_eq!(dead.status, JobStatus::Failed);
    assert_eq!(dead.attempts, dead.max_attempts);

    assert_eq!(rig.store.job_status(active_id).await, Some(JobStatus::InProgress));
}

#[tokio::test]
async fn cancel_on_terminal_job_is_rejected_and_mutates_nothing() {
    let rig = rig(
        StubSender::succeeding(),
        StubSender::succeeding(),
        StubArtifactResolver::succeeding(),
        Arc::new(NoOpAuditSink::new()),
    );

    let job = due_job(ChannelSet::Email, Some("a@example.com"), None);
    let id = job.id;
    rig.store.insert_job(job).await;
    rig.engine.process_batch().await.unwrap();

    let before = rig.store.job(id).await.unwrap();
    assert_eq!(before.status, JobStatus::Delivered);

    let rejection = rig.store.cancel(id).await.unwrap_err();
    assert!(matches!(rejection, echobox_core::CoreError::Conflict(_)));

    let after = rig.store.job(id).await.unwrap();
    assert_eq!(after.status, JobStatus::Delivered);
    assert_eq!(after.delivered_at, before.delivered_at);
    assert!(after.cancelled_at.is_none());
}

#[tokio::test]
async fn one_failing_job_does_not_block_the_rest_of_the_batch() {
    let rig = rig(
        StubSender::succeeding(),
        StubSender::failing(),
        StubArtifactResolver::succeeding(),
        Arc::new(NoOpAuditSink::new()),
    );

    let ok_job = due_job(ChannelSet::Email, Some("a@example.com"), None);
    let bad_job = due_job(ChannelSet::Sms, None, Some("+15551230000"));
    let (ok_id, bad_id) = (ok_job.id, bad_job.id);
    rig.store.insert_job(ok_job).await;
    rig.store.insert_job(bad_job).await;

    let processed = rig.engine.process_batch().await.unwrap();
    assert_eq!(processed, 2);

    assert_eq!(rig.store.job_status(ok_id).await, Some(JobStatus::Delivered));
    assert_eq!(rig.store.job_status(bad_id).await, Some(JobStatus::Scheduled));
}

#[tokio::test]
async fn audit_trail_records_attempt_and_outcome() {
    let sink = Arc::new(RecordingSink::default());
    let rig = rig(
        StubSender::succeeding(),
        StubSender::succeeding(),
        StubArtifactResolver::succeeding(),
        sink.clone(),
    );

    let job = due_job(ChannelSet::Email, Some("a@example.com"), None);
    rig.store.insert_job(job).await;
    rig.engine.process_batch().await.unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], AuditEvent::AttemptStarted(_)));
    assert!(matches!(events[1], AuditEvent::Delivered(_)));
}

#[tokio::test]
async fn engine_stats_track_outcomes() {
    let rig = rig(
        StubSender::succeeding(),
        StubSender::failing(),
        StubArtifactResolver::succeeding(),
        Arc::new(NoOpAuditSink::new()),
    );

    rig.store.insert_job(due_job(ChannelSet::Email, Some("a@example.com"), None)).await;
    rig.store.insert_job(due_job(ChannelSet::Sms, None, Some("+15551230000"))).await;
    rig.engine.process_batch().await.unwrap();

    let stats = rig.engine.stats().await;
    assert_eq!(stats.jobs_processed, 2);
    assert_eq!(stats.successful_deliveries, 1);
    assert_eq!(stats.retries_scheduled, 1);
    assert_eq!(stats.in_flight, 0);
}
