//! Multi-channel dispatch for a claimed job.
//!
//! One dispatch is one attempt: resolve a fetch URL for the job's content,
//! then invoke every requested channel sender that has a destination.
//! Channels are attempted independently (no short-circuit) so a "both"
//! request really tries both, and per-channel results are recorded
//! separately. Dispatch never mutates job state; the worker owns the
//! lifecycle transitions, which keeps a dispatch safe to re-attempt.

use std::{sync::Arc, time::Duration};

use echobox_core::models::{Channel, ScheduledJob};
use tracing::debug;

use crate::{
    artifact::ArtifactResolver,
    channel::{EmailSender, SmsSender},
    error::DeliveryError,
};

const DEFAULT_SUBJECT: &str = "A voice note for you";
const DEFAULT_BODY: &str = "You have a voice note waiting. Listen here:";

/// Result of one channel attempt within a dispatch.
#[derive(Debug, Clone)]
pub struct ChannelOutcome {
    /// Channel that was attempted.
    pub channel: Channel,
    /// Send result for this channel.
    pub result: Result<(), DeliveryError>,
}

/// Aggregate result of one dispatch attempt across requested channels.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Per-channel outcomes in attempt order.
    pub channels: Vec<ChannelOutcome>,
}

impl DispatchOutcome {
    /// Overall success: at least one requested channel delivered.
    ///
    /// Any-success policy: a job requesting both channels is Delivered
    /// even when only one of them landed. The per-channel detail stays
    /// available for audit.
    pub fn any_succeeded(&self) -> bool {
        self.channels.iter().any(|c| c.result.is_ok())
    }

    /// Whether every failure was permanent (never retryable).
    ///
    /// When true there is no point consuming further attempts.
    pub fn all_failures_permanent(&self) -> bool {
        self.channels.iter().all(|c| match &c.result {
            Ok(()) => false,
            Err(e) => !e.is_retryable(),
        })
    }

    /// Channels that delivered during this attempt.
    pub fn succeeded_channels(&self) -> Vec<Channel> {
        self.channels.iter().filter(|c| c.result.is_ok()).map(|c| c.channel).collect()
    }

    /// Channels that failed during this attempt.
    pub fn failed_channels(&self) -> Vec<Channel> {
        self.channels.iter().filter(|c| c.result.is_err()).map(|c| c.channel).collect()
    }

    /// Human-readable per-channel failure summary for `last_error`.
    pub fn error_summary(&self) -> String {
        self.channels
            .iter()
            .filter_map(|c| c.result.as_ref().err().map(|e| format!("{}: {e}", c.channel)))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Dispatches claimed jobs across their requested channels.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    resolver: Arc<dyn ArtifactResolver>,
    email: Arc<dyn EmailSender>,
    sms: Arc<dyn SmsSender>,
    url_ttl: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher over the given collaborators.
    pub fn new(
        resolver: Arc<dyn ArtifactResolver>,
        email: Arc<dyn EmailSender>,
        sms: Arc<dyn SmsSender>,
        url_ttl: Duration,
    ) -> Self {
        Self { resolver, email, sms, url_ttl }
    }

    /// Runs one delivery attempt for a claimed job.
    ///
    /// Resolver failure fails every requested channel at once: there is no
    /// partial attempt without a valid URL. A requested channel whose
    /// destination is missing records a permanent error for that channel
    /// rather than a transient one.
    pub async fn dispatch(&self, job: &ScheduledJob) -> DispatchOutcome {
        let requested = job.channels.channels();

        let fetch = match self.resolver.resolve(&job.content_ref, self.url_ttl).await {
            Ok(fetch) => fetch,
            Err(err) => {
                debug!(job_id = %job.id, error = %err, "artifact resolution failed");
                return DispatchOutcome {
                    channels: requested
                        .iter()
                        .map(|channel| ChannelOutcome {
                            channel: *channel,
                            result: Err(err.clone()),
                        })
                        .collect(),
                };
            },
        };

        let (subject, body) = message_content(job);

        let mut channels = Vec::with_capacity(requested.len());
        for channel in requested {
            let result = self.send_on(*channel, job, &subject, &body, &fetch.url).await;
            channels.push(ChannelOutcome { channel: *channel, result });
        }

        DispatchOutcome { channels }
    }

    async fn send_on(
        &self,
        channel: Channel,
        job: &ScheduledJob,
        subject: &str,
        body: &str,
        artifact_url: &str,
    ) -> Result<(), DeliveryError> {
        let Some(destination) = job.destination(channel) else {
            return Err(DeliveryError::missing_destination(channel));
        };

        match channel {
            Channel::Email => self.email.send(destination, subject, body, artifact_url).await,
            Channel::Sms => self.sms.send(destination, body, artifact_url).await,
        }
    }
}

/// Subject and body for the outgoing message.
///
/// Metadata may carry custom text; the engine treats it as opaque beyond
/// these two well-known keys.
fn message_content(job: &ScheduledJob) -> (String, String) {
    let subject = job
        .metadata
        .0
        .get("subject")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_SUBJECT)
        .to_string();
    let body = job
        .metadata
        .0
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_BODY)
        .to_string();

    (subject, body)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use echobox_core::models::{AccountId, ChannelSet, JobId, Recipient};

    use super::*;
    use crate::{artifact::stub::StubArtifactResolver, channel::stub::StubSender};

    fn job_with(channels: ChannelSet, email: Option<&str>, phone: Option<&str>) -> ScheduledJob {
        let now = Utc::now();
        ScheduledJob::new(
            JobId::new(),
            AccountId::new(),
            "note-1".into(),
            Recipient {
                contact_id: None,
                email: email.map(String::from),
                phone: phone.map(String::from),
            },
            channels,
            now,
            serde_json::json!({}),
            now,
        )
    }

    fn dispatcher(
        resolver: StubArtifactResolver,
        email: StubSender,
        sms: StubSender,
    ) -> Dispatcher {
        Dispatcher::new(
            Arc::new(resolver),
            Arc::new(email),
            Arc::new(sms),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn single_channel_success() {
        let d = dispatcher(
            StubArtifactResolver::succeeding(),
            StubSender::succeeding(),
            StubSender::succeeding(),
        );
        let job = job_with(ChannelSet::Email, Some("a@example.com"), None);

        let outcome = d.dispatch(&job).await;

        assert!(outcome.any_succeeded());
        assert_eq!(outcome.succeeded_channels(), vec![Channel::Email]);
        assert!(outcome.failed_channels().is_empty());
    }

    #[tokio::test]
    async fn both_channels_attempted_despite_email_failure() {
        let email = StubSender::failing();
        let sms = StubSender::succeeding();
        let d = dispatcher(StubArtifactResolver::succeeding(), email, sms);
        let job = job_with(ChannelSet::Both, Some("a@example.com"), Some("+15551230000"));

        let outcome = d.dispatch(&job).await;

        // Any-success policy: partial delivery still counts as delivered.
        assert!(outcome.any_succeeded());
        assert_eq!(outcome.succeeded_channels(), vec![Channel::Sms]);
        assert_eq!(outcome.failed_channels(), vec![Channel::Email]);
        assert_eq!(outcome.channels.len(), 2);
    }

    #[tokio::test]
    async fn resolver_failure_fails_every_channel() {
        let email = StubSender::succeeding();
        let sms = StubSender::succeeding();
        let d = dispatcher(StubArtifactResolver::failing(), email, sms);
        let job = job_with(ChannelSet::Both, Some("a@example.com"), Some("+15551230000"));

        let outcome = d.dispatch(&job).await;

        assert!(!outcome.any_succeeded());
        assert_eq!(outcome.failed_channels(), vec![Channel::Email, Channel::Sms]);
        // Resolver outage is transient, not permanent.
        assert!(!outcome.all_failures_permanent());
    }

    #[tokio::test]
    async fn missing_destination_is_permanent() {
        let d = dispatcher(
            StubArtifactResolver::succeeding(),
            StubSender::succeeding(),
            StubSender::succeeding(),
        );
        let job = job_with(ChannelSet::Sms, Some("a@example.com"), None);

        let outcome = d.dispatch(&job).await;

        assert!(!outcome.any_succeeded());
        assert!(outcome.all_failures_permanent());
        assert!(outcome.error_summary().contains("no sms destination"));
    }

    #[tokio::test]
    async fn custom_metadata_text_is_used() {
        let job = {
            let mut job = job_with(ChannelSet::Email, Some("a@example.com"), None);
            job.metadata =
                sqlx::types::Json(serde_json::json!({"subject": "Hi!", "message": "listen"}));
            job
        };

        let (subject, body) = message_content(&job);
        assert_eq!(subject, "Hi!");
        assert_eq!(body, "listen");
    }
}
