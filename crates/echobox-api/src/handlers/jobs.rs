//! Job CRUD handlers: create, inspect, update, cancel.
//!
//! Validation happens here, before anything reaches the store: a request
//! whose channels have no matching destination is rejected synchronously
//! and never becomes a job row. Lifecycle conflicts (cancelling a job that
//! already delivered, updating a claimed job) surface as 409s from the
//! repository's conditional updates.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use echobox_core::{
    events::{self, AuditEvent},
    models::{AccountId, ChannelSet, ContactId, JobId, JobStatus, Recipient, ScheduledJob},
    CoreError,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::server::AppState;

/// Header carrying the authenticated account. Authentication itself is an
/// upstream concern; by the time a request reaches this service the header
/// is trusted.
const ACCOUNT_HEADER: &str = "x-account-id";

/// Recipient destinations supplied at creation.
#[derive(Debug, Deserialize)]
pub struct RecipientPayload {
    /// Stored contact reference, if the destinations came from one.
    pub contact_id: Option<Uuid>,
    /// Destination email address.
    pub email: Option<String>,
    /// Destination phone number.
    pub phone: Option<String>,
}

/// Request body for job creation.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    /// Reference to the stored artifact to deliver.
    pub content_ref: String,
    /// Recipient destinations.
    pub recipient: RecipientPayload,
    /// Requested delivery channels.
    pub channels: ChannelSet,
    /// When to deliver. May be in the past; such a job is due immediately.
    pub scheduled_for: DateTime<Utc>,
    /// Opaque side information (custom message text etc).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Request body for job updates while Scheduled/Paused.
#[derive(Debug, Deserialize)]
pub struct UpdateJobRequest {
    /// New delivery time.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// New channel set; re-validated against the stored destinations.
    pub channels: Option<ChannelSet>,
    /// Status change: only "paused" and "scheduled" (resume) are accepted.
    pub status: Option<String>,
}

/// Query parameters for job listing.
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    /// Restrict to one lifecycle status.
    pub status: Option<JobStatus>,
    /// Page size, capped server-side.
    pub limit: Option<i64>,
}

/// Job representation returned to callers.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    /// Job identifier.
    pub id: JobId,
    /// Owning account.
    pub owner_id: AccountId,
    /// Artifact reference.
    pub content_ref: String,
    /// Recipient destinations.
    pub recipient: Recipient,
    /// Requested channels.
    pub channels: ChannelSet,
    /// Delivery time.
    pub scheduled_for: DateTime<Utc>,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Attempts consumed.
    pub attempts: i32,
    /// Attempt bound.
    pub max_attempts: i32,
    /// Most recent attempt start.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest retry time, when backing off.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Delivery timestamp (terminal).
    pub delivered_at: Option<DateTime<Utc>>,
    /// Failure timestamp (terminal).
    pub failed_at: Option<DateTime<Utc>>,
    /// Cancellation timestamp (terminal).
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Most recent failure detail.
    pub last_error: Option<String>,
    /// Opaque metadata.
    pub metadata: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl From<ScheduledJob> for JobResponse {
    fn from(job: ScheduledJob) -> Self {
        let recipient = job.recipient();
        Self {
            id: job.id,
            owner_id: job.owner_id,
            content_ref: job.content_ref,
            recipient,
            channels: job.channels,
            scheduled_for: job.scheduled_for,
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_attempt_at: job.last_attempt_at,
            next_attempt_at: job.next_attempt_at,
            delivered_at: job.delivered_at,
            failed_at: job.failed_at,
            cancelled_at: job.cancelled_at,
            last_error: job.last_error,
            metadata: job.metadata.0,
            created_at: job.created_at,
        }
    }
}

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail { code: code.to_string(), message: message.into() },
        }),
    )
        .into_response()
}

fn core_error_response(err: &CoreError) -> Response {
    match err {
        CoreError::NotFound(message) => {
            error_response(StatusCode::NOT_FOUND, "not_found", message.clone())
        },
        CoreError::Conflict(message) => {
            error_response(StatusCode::CONFLICT, "conflict", message.clone())
        },
        CoreError::InvalidInput(message) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_input", message.clone())
        },
        CoreError::Database(message) => {
            warn!(error = %message, "store operation failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", "store unavailable")
        },
    }
}

fn owner_from_headers(headers: &HeaderMap) -> Result<AccountId, Response> {
    headers
        .get(ACCOUNT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .map(AccountId)
        .ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "missing_account",
                format!("{ACCOUNT_HEADER} header with a valid account id is required"),
            )
        })
}

/// Rejects a channel set the recipient has no destinations for.
fn validate_destinations(recipient: &Recipient, channels: ChannelSet) -> Result<(), Response> {
    for channel in channels.channels() {
        if recipient.destination(*channel).is_none() {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "missing_destination",
                format!("channel {channel} requested but recipient has no {channel} destination"),
            ));
        }
    }
    Ok(())
}

/// Creates a scheduled delivery job.
///
/// Validates channel/destination consistency synchronously; invalid
/// requests never enter the job store. `scheduled_for` in the past is
/// valid and will be claimed on the next poll tick.
#[instrument(name = "create_job", skip(state, headers, request))]
pub async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateJobRequest>,
) -> Response {
    let owner_id = match owner_from_headers(&headers) {
        Ok(owner) => owner,
        Err(rejection) => return rejection,
    };

    if request.content_ref.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "invalid_input", "content_ref is required");
    }

    let recipient = Recipient {
        contact_id: request.recipient.contact_id.map(ContactId),
        email: request.recipient.email,
        phone: request.recipient.phone,
    };

    if let Err(rejection) = validate_destinations(&recipient, request.channels) {
        return rejection;
    }

    let job = ScheduledJob::new(
        JobId::new(),
        owner_id,
        request.content_ref,
        recipient,
        request.channels,
        request.scheduled_for,
        request.metadata,
        Utc::now(),
    );

    match state.storage.jobs.create(&job).await {
        Ok(job_id) => {
            info!(job_id = %job_id, owner_id = %owner_id, scheduled_for = %job.scheduled_for, "job created");
            (StatusCode::CREATED, Json(JobResponse::from(job))).into_response()
        },
        Err(create_error) => core_error_response(&create_error),
    }
}

/// Fetches one job. Owner-scoped: other accounts' jobs read as missing.
#[instrument(name = "get_job", skip(state, headers))]
pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Response {
    let owner_id = match owner_from_headers(&headers) {
        Ok(owner) => owner,
        Err(rejection) => return rejection,
    };

    match state.storage.jobs.find_by_id(JobId(job_id)).await {
        Ok(Some(job)) if job.owner_id == owner_id => {
            Json(JobResponse::from(job)).into_response()
        },
        Ok(_) => error_response(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
        Err(find_error) => core_error_response(&find_error),
    }
}

/// Lists the caller's jobs, newest first, optionally filtered by status.
#[instrument(name = "list_jobs", skip(state, headers))]
pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListJobsQuery>,
) -> Response {
    let owner_id = match owner_from_headers(&headers) {
        Ok(owner) => owner,
        Err(rejection) => return rejection,
    };

    let limit = query.limit.map(|l| l.clamp(1, 500));

    match state.storage.jobs.list_by_owner(owner_id, query.status, limit).await {
        Ok(jobs) => {
            let jobs: Vec<JobResponse> = jobs.into_iter().map(JobResponse::from).collect();
            Json(jobs).into_response()
        },
        Err(list_error) => core_error_response(&list_error),
    }
}

/// Updates schedule, channels, or paused state of a not-yet-claimed job.
///
/// Rejected with a conflict once the job is claimed or terminal. Channel
/// changes are re-validated against the stored destinations, which are
/// immutable, so the validation cannot be raced by the engine.
#[instrument(name = "update_job", skip(state, headers, request))]
pub async fn update_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
    Json(request): Json<UpdateJobRequest>,
) -> Response {
    let owner_id = match owner_from_headers(&headers) {
        Ok(owner) => owner,
        Err(rejection) => return rejection,
    };
    let job_id = JobId(job_id);

    let existing = match state.storage.jobs.find_by_id(job_id).await {
        Ok(Some(job)) if job.owner_id == owner_id => job,
        Ok(_) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("job {job_id} not found"),
            )
        },
        Err(find_error) => return core_error_response(&find_error),
    };

    if let Some(channels) = request.channels {
        if let Err(rejection) = validate_destinations(&existing.recipient(), channels) {
            return rejection;
        }
    }

    let status_action = match request.status.as_deref() {
        None => None,
        Some("paused") => Some(JobStatus::Paused),
        Some("scheduled") => Some(JobStatus::Scheduled),
        Some(other) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_input",
                format!("status can only be set to paused or scheduled, got {other}"),
            )
        },
    };

    let mut updated = existing;

    if request.scheduled_for.is_some() || request.channels.is_some() {
        updated = match state
            .storage
            .jobs
            .reschedule(job_id, request.scheduled_for, request.channels)
            .await
        {
            Ok(job) => job,
            Err(update_error) => return core_error_response(&update_error),
        };
    }

    match status_action {
        Some(JobStatus::Paused) => {
            updated = match state.storage.jobs.pause(job_id).await {
                Ok(job) => job,
                Err(pause_error) => return core_error_response(&pause_error),
            };
            info!(job_id = %job_id, "job paused");
        },
        Some(JobStatus::Scheduled) => {
            updated = match state.storage.jobs.resume(job_id).await {
                Ok(job) => job,
                Err(resume_error) => return core_error_response(&resume_error),
            };
            info!(job_id = %job_id, "job resumed");
        },
        _ => {},
    }

    Json(JobResponse::from(updated)).into_response()
}

/// Cancels a job while it is still Scheduled or Paused.
///
/// Returns a conflict once the job has been claimed, delivered, or failed;
/// the repository re-checks the current status in the same statement as
/// the transition, so a concurrent claim wins cleanly.
#[instrument(name = "cancel_job", skip(state, headers))]
pub async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Response {
    let owner_id = match owner_from_headers(&headers) {
        Ok(owner) => owner,
        Err(rejection) => return rejection,
    };
    let job_id = JobId(job_id);

    let previous_status = match state.storage.jobs.find_by_id(job_id).await {
        Ok(Some(job)) if job.owner_id == owner_id => job.status,
        Ok(_) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("job {job_id} not found"),
            )
        },
        Err(find_error) => return core_error_response(&find_error),
    };

    match state.storage.jobs.cancel(job_id).await {
        Ok(job) => {
            state
                .audit
                .publish(AuditEvent::Cancelled(events::Cancelled {
                    job_id,
                    owner_id,
                    previous_status,
                    cancelled_at: job.cancelled_at.unwrap_or_else(Utc::now),
                }))
                .await;
            info!(job_id = %job_id, "job cancelled");
            Json(JobResponse::from(job)).into_response()
        },
        Err(cancel_error) => core_error_response(&cancel_error),
    }
}
