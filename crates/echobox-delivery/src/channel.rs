//! Channel senders for email and SMS delivery.
//!
//! Each channel exposes a single "attempt delivery" operation against its
//! provider gateway. Calls carry a per-call timeout so one slow provider
//! cannot stall an entire poll tick, and responses are categorized into
//! retryable vs permanent errors at this boundary.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Configuration for outbound provider HTTP clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-call timeout for provider requests.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: "Echobox-Delivery/1.0".to_string(),
        }
    }
}

impl ClientConfig {
    /// Builds a reqwest client honoring this configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the client cannot be
    /// constructed.
    pub fn build_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))
    }
}

/// Email transport: one "attempt delivery" operation that succeeds or fails.
#[async_trait::async_trait]
pub trait EmailSender: Send + Sync + std::fmt::Debug {
    /// Sends one message carrying the artifact link.
    async fn send(&self, to: &str, subject: &str, body: &str, artifact_url: &str) -> Result<()>;
}

/// SMS gateway: one "attempt delivery" operation that succeeds or fails.
#[async_trait::async_trait]
pub trait SmsSender: Send + Sync + std::fmt::Debug {
    /// Sends one message carrying the artifact link.
    async fn send(&self, to: &str, body: &str, artifact_url: &str) -> Result<()>;
}

/// Maps a provider gateway response to a delivery result.
///
/// 2xx succeeds; 429 extracts Retry-After guidance; other 4xx are
/// permanent; 5xx are retryable.
async fn categorize_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();

    if status.is_success() {
        return Ok(());
    }

    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        return Err(DeliveryError::rate_limited(retry_after));
    }

    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(200).collect();

    Err(DeliveryError::provider(status.as_u16(), excerpt))
}

/// Maps reqwest transport failures to delivery errors.
fn categorize_transport_error(err: &reqwest::Error, timeout: Duration) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::timeout(timeout.as_secs())
    } else if err.is_connect() {
        DeliveryError::network(format!("connection failed: {err}"))
    } else {
        DeliveryError::network(err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct EmailPayload<'a> {
    to: &'a str,
    subject: &'a str,
    body: &'a str,
    artifact_url: &'a str,
}

/// Email sender calling an HTTP mail gateway.
#[derive(Debug, Clone)]
pub struct HttpEmailSender {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpEmailSender {
    /// Creates a sender against the given mail gateway.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        config: &ClientConfig,
    ) -> Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout: config.timeout,
        })
    }
}

#[async_trait::async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str, artifact_url: &str) -> Result<()> {
        debug!(to, "sending email via gateway");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&EmailPayload { to, subject, body, artifact_url })
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "email gateway request failed");
                categorize_transport_error(&e, self.timeout)
            })?;

        categorize_response(response).await
    }
}

#[derive(Debug, Serialize)]
struct SmsPayload<'a> {
    to: &'a str,
    body: &'a str,
}

/// SMS sender calling an HTTP SMS gateway.
#[derive(Debug, Clone)]
pub struct HttpSmsSender {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpSmsSender {
    /// Creates a sender against the given SMS gateway.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        config: &ClientConfig,
    ) -> Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout: config.timeout,
        })
    }
}

#[async_trait::async_trait]
impl SmsSender for HttpSmsSender {
    async fn send(&self, to: &str, body: &str, artifact_url: &str) -> Result<()> {
        debug!(to, "sending sms via gateway");

        // SMS has no separate link field; the URL rides in the message text.
        let text = format!("{body} {artifact_url}");

        let response = self
            .client
            .post(format!("{}/v1/sms", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&SmsPayload { to, body: &text })
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "sms gateway request failed");
                categorize_transport_error(&e, self.timeout)
            })?;

        categorize_response(response).await
    }
}

pub mod stub {
    //! Configurable sender doubles for tests.

    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;

    /// Scripted behavior for a stub sender.
    #[derive(Debug, Clone)]
    pub enum SendBehavior {
        /// Every send succeeds.
        Succeed,
        /// Every send fails with a retryable provider error.
        FailRetryable,
        /// Every send fails with a permanent provider error.
        FailPermanent,
        /// Fail the first `n` sends (retryable), then succeed.
        FailTimes(usize),
    }

    /// Stub implementing both sender traits with scripted outcomes.
    #[derive(Debug)]
    pub struct StubSender {
        behavior: Mutex<SendBehavior>,
        calls: AtomicUsize,
    }

    impl StubSender {
        /// Creates a stub with the given behavior.
        pub fn with_behavior(behavior: SendBehavior) -> Self {
            Self { behavior: Mutex::new(behavior), calls: AtomicUsize::new(0) }
        }

        /// Stub that always succeeds.
        pub fn succeeding() -> Self {
            Self::with_behavior(SendBehavior::Succeed)
        }

        /// Stub that always fails retryably.
        pub fn failing() -> Self {
            Self::with_behavior(SendBehavior::FailRetryable)
        }

        /// Stub that always fails permanently.
        pub fn failing_permanently() -> Self {
            Self::with_behavior(SendBehavior::FailPermanent)
        }

        /// Number of send calls observed.
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn attempt(&self) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let behavior = self.behavior.lock().expect("stub lock poisoned").clone();

            match behavior {
                SendBehavior::Succeed => Ok(()),
                SendBehavior::FailRetryable => {
                    Err(DeliveryError::provider(503, "stubbed provider outage"))
                },
                SendBehavior::FailPermanent => {
                    Err(DeliveryError::provider(400, "stubbed rejection"))
                },
                SendBehavior::FailTimes(n) => {
                    if call < n {
                        Err(DeliveryError::provider(503, "stubbed provider outage"))
                    } else {
                        Ok(())
                    }
                },
            }
        }
    }

    #[async_trait::async_trait]
    impl EmailSender for StubSender {
        async fn send(
            &self,
            _to: &str,
            _subject: &str,
            _body: &str,
            _artifact_url: &str,
        ) -> Result<()> {
            self.attempt()
        }
    }

    #[async_trait::async_trait]
    impl SmsSender for StubSender {
        async fn send(&self, _to: &str, _body: &str, _artifact_url: &str) -> Result<()> {
            self.attempt()
        }
    }
}
