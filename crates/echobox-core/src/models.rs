//! Core domain models and strongly-typed identifiers.
//!
//! Defines scheduled delivery jobs, recipient destinations, channel sets,
//! and newtype ID wrappers for compile-time type safety. Includes database
//! serialization traits and the job status vocabulary used by the delivery
//! pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Default bound on delivery attempts for newly created jobs.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Strongly-typed job identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. A job keeps this ID
/// through its entire lifecycle; jobs are never physically deleted by the
/// engine, so the ID stays valid for audit queries indefinitely.
///
/// # Example
///
/// ```
/// use echobox_core::models::JobId;
/// let job_id = JobId::new();
/// println!("processing job: {}", job_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    ///
    /// Uses UUID v4 for globally unique identifiers without coordination.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for JobId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for JobId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed account identifier.
///
/// Identifies the account that created a job. Used for authorization
/// scoping and audit; the delivery logic itself never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub Uuid);

impl AccountId {
    /// Creates a new random account ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for AccountId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for AccountId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AccountId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for AccountId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed contact identifier.
///
/// References a stored contact in the (external) contact directory. The
/// engine only carries this for audit; destinations are denormalized onto
/// the job at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactId(pub Uuid);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ContactId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for ContactId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ContactId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for ContactId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// A single delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Email transport.
    Email,
    /// SMS gateway.
    Sms,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Sms => write!(f, "sms"),
        }
    }
}

/// Requested delivery channel set for a job.
///
/// `Both` means "attempt every channel"; overall delivery succeeds when at
/// least one requested channel delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSet {
    /// Email only.
    Email,
    /// SMS only.
    Sms,
    /// Attempt both email and SMS.
    Both,
}

impl ChannelSet {
    /// Returns the individual channels in this set, in attempt order.
    pub fn channels(self) -> &'static [Channel] {
        match self {
            Self::Email => &[Channel::Email],
            Self::Sms => &[Channel::Sms],
            Self::Both => &[Channel::Email, Channel::Sms],
        }
    }

    /// Whether the set includes the given channel.
    pub fn contains(self, channel: Channel) -> bool {
        self.channels().contains(&channel)
    }
}

impl fmt::Display for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Sms => write!(f, "sms"),
            Self::Both => write!(f, "both"),
        }
    }
}

impl sqlx::Type<PgDb> for ChannelSet {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ChannelSet {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "both" => Ok(Self::Both),
            _ => Err(format!("invalid channel set: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for ChannelSet {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Recipient destinations for a job.
///
/// Either a reference to a stored contact, raw destination values, or both.
/// Destinations are denormalized onto the job row at creation time so the
/// engine never needs the contact directory at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Stored contact this recipient was resolved from, if any.
    pub contact_id: Option<ContactId>,

    /// Destination email address, required when email delivery is requested.
    pub email: Option<String>,

    /// Destination phone number (E.164), required when SMS is requested.
    pub phone: Option<String>,
}

impl Recipient {
    /// Destination value for the given channel, if present.
    pub fn destination(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone.as_deref(),
        }
    }

    /// Whether every channel in `channels` has a matching destination.
    pub fn satisfies(&self, channels: ChannelSet) -> bool {
        channels.channels().iter().all(|c| self.destination(*c).is_some())
    }
}

/// Job lifecycle status.
///
/// Jobs progress through these states; transitions are strictly controlled
/// by the claim manager, the lifecycle controller, and explicit user
/// actions:
///
/// ```text
/// Scheduled -> InProgress -> Delivered
///     ^            |       -> Failed
///     |            +-> Scheduled (retry, attempts remaining)
///     v
///   Paused
///
/// Scheduled/Paused -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to become due; eligible for claim once `scheduled_for` (and
    /// any retry backoff window) has passed.
    Scheduled,

    /// Suspended by the owner. Never claimed; only user action moves it
    /// back to Scheduled or on to Cancelled.
    Paused,

    /// Claimed by exactly one worker which is attempting delivery. This
    /// state prevents duplicate dispatch.
    InProgress,

    /// At least one requested channel delivered. Terminal.
    Delivered,

    /// Retries exhausted or failure was permanent. Terminal.
    Failed,

    /// Cancelled by the owner before delivery started. Terminal.
    Cancelled,
}

impl JobStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Paused => write!(f, "paused"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "paused" => Ok(Self::Paused),
            "in_progress" => Ok(Self::InProgress),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid job status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for JobStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Core scheduled delivery job entity.
///
/// Represents one "deliver this content at time T to recipient R via
/// channel(s) C" request and tracks its complete lifecycle from creation
/// to a terminal state. Rows are kept forever for audit; deletion is an
/// external data-retention concern.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledJob {
    /// Unique identifier for this job.
    pub id: JobId,

    /// Account that created the job.
    pub owner_id: AccountId,

    /// Opaque reference to the stored artifact (voice note) to deliver.
    ///
    /// Resolved to a time-limited fetch URL at dispatch time.
    pub content_ref: String,

    /// Stored contact the destinations were resolved from, if any.
    pub contact_id: Option<ContactId>,

    /// Destination email address.
    pub recipient_email: Option<String>,

    /// Destination phone number.
    pub recipient_phone: Option<String>,

    /// Requested delivery channel set.
    pub channels: ChannelSet,

    /// Earliest instant the job may be attempted.
    pub scheduled_for: DateTime<Utc>,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// Delivery attempts made so far.
    ///
    /// Incremented on every completed attempt (success, retryable failure,
    /// or a crashed worker detected by the stale sweep). Never exceeds
    /// `max_attempts`.
    pub attempts: i32,

    /// Bound on delivery attempts, fixed at creation.
    pub max_attempts: i32,

    /// When the most recent attempt started (set at claim time).
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Earliest retry time derived from the backoff policy.
    ///
    /// Set when a failed attempt is re-queued; `scheduled_for` itself is
    /// never rewritten.
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// When successfully delivered (terminal, set at most once).
    pub delivered_at: Option<DateTime<Utc>>,

    /// When permanently failed (terminal).
    pub failed_at: Option<DateTime<Utc>>,

    /// When cancelled by the owner (terminal).
    pub cancelled_at: Option<DateTime<Utc>>,

    /// Most recent failure detail, for diagnostics.
    pub last_error: Option<String>,

    /// Free-form side information (e.g. custom message text), opaque to
    /// the engine's control logic.
    pub metadata: sqlx::types::Json<serde_json::Value>,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// When the job row was last modified.
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Creates a new job in `Scheduled` status.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: JobId,
        owner_id: AccountId,
        content_ref: String,
        recipient: Recipient,
        channels: ChannelSet,
        scheduled_for: DateTime<Utc>,
        metadata: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            owner_id,
            content_ref,
            contact_id: recipient.contact_id,
            recipient_email: recipient.email,
            recipient_phone: recipient.phone,
            channels,
            scheduled_for,
            status: JobStatus::Scheduled,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_attempt_at: None,
            next_attempt_at: None,
            delivered_at: None,
            failed_at: None,
            cancelled_at: None,
            last_error: None,
            metadata: sqlx::types::Json(metadata),
            created_at,
            updated_at: created_at,
        }
    }

    /// Recipient destinations as a value type.
    pub fn recipient(&self) -> Recipient {
        Recipient {
            contact_id: self.contact_id,
            email: self.recipient_email.clone(),
            phone: self.recipient_phone.clone(),
        }
    }

    /// Destination for a channel, if the recipient carries one.
    pub fn destination(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => self.recipient_email.as_deref(),
            Channel::Sms => self.recipient_phone.as_deref(),
        }
    }

    /// Whether the job has consumed its entire attempt budget.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient_with(email: Option<&str>, phone: Option<&str>) -> Recipient {
        Recipient {
            contact_id: None,
            email: email.map(String::from),
            phone: phone.map(String::from),
        }
    }

    #[test]
    fn channel_set_expansion() {
        assert_eq!(ChannelSet::Email.channels(), &[Channel::Email]);
        assert_eq!(ChannelSet::Sms.channels(), &[Channel::Sms]);
        assert_eq!(ChannelSet::Both.channels(), &[Channel::Email, Channel::Sms]);
        assert!(ChannelSet::Both.contains(Channel::Sms));
        assert!(!ChannelSet::Email.contains(Channel::Sms));
    }

    #[test]
    fn recipient_satisfies_requested_channels() {
        let email_only = recipient_with(Some("a@example.com"), None);
        assert!(email_only.satisfies(ChannelSet::Email));
        assert!(!email_only.satisfies(ChannelSet::Sms));
        assert!(!email_only.satisfies(ChannelSet::Both));

        let both = recipient_with(Some("a@example.com"), Some("+15551230000"));
        assert!(both.satisfies(ChannelSet::Both));
    }

    #[test]
    fn terminal_states_identified() {
        assert!(JobStatus::Delivered.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Scheduled.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }

    #[test]
    fn status_round_trips_through_display() {
        for status in [
            JobStatus::Scheduled,
            JobStatus::Paused,
            JobStatus::InProgress,
            JobStatus::Delivered,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let parsed: JobStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn new_job_starts_scheduled_with_empty_history() {
        let now = Utc::now();
        let job = ScheduledJob::new(
            JobId::new(),
            AccountId::new(),
            "note-123".into(),
            recipient_with(Some("a@example.com"), None),
            ChannelSet::Email,
            now,
            serde_json::json!({}),
            now,
        );

        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(job.delivered_at.is_none());
        assert!(job.last_error.is_none());
        assert!(!job.attempts_exhausted());
    }
}
