//! Artifact resolver producing time-limited fetch URLs.
//!
//! The engine never touches the stored voice note itself; it asks the
//! media service for a presigned URL with its own expiry and hands that to
//! the channel senders. The expiry governs how long the recipient can use
//! the link after delivery, not how long delivery may take.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::{
    channel::ClientConfig,
    error::{DeliveryError, Result},
};

/// A resolved, time-limited fetch URL for a content reference.
#[derive(Debug, Clone)]
pub struct FetchUrl {
    /// Presigned URL the recipient can fetch the artifact from.
    pub url: String,
    /// When the URL stops working.
    pub expires_at: DateTime<Utc>,
}

/// Resolves a content reference to a time-limited fetch URL.
///
/// External collaborator: the engine depends on it but does not implement
/// presigning itself. A resolver failure fails the whole dispatch attempt
/// for every requested channel.
#[async_trait::async_trait]
pub trait ArtifactResolver: Send + Sync + std::fmt::Debug {
    /// Produces a fetch URL valid for roughly `ttl`.
    async fn resolve(&self, content_ref: &str, ttl: Duration) -> Result<FetchUrl>;
}

#[derive(Debug, Deserialize)]
struct PresignResponse {
    url: String,
    expires_at: DateTime<Utc>,
}

/// Production resolver calling the media service's presign endpoint.
#[derive(Debug, Clone)]
pub struct HttpArtifactResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpArtifactResolver {
    /// Creates a resolver against the given media service base URL.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(base_url: impl Into<String>, config: &ClientConfig) -> Result<Self> {
        let client = config.build_client()?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }
}

#[async_trait::async_trait]
impl ArtifactResolver for HttpArtifactResolver {
    async fn resolve(&self, content_ref: &str, ttl: Duration) -> Result<FetchUrl> {
        let url = format!("{}/artifacts/{}/presign", self.base_url, content_ref);

        debug!(content_ref, ttl_secs = ttl.as_secs(), "resolving artifact fetch URL");

        let response = self
            .client
            .get(&url)
            .query(&[("ttl_secs", ttl.as_secs())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::artifact("presign request timed out")
                } else {
                    DeliveryError::artifact(format!("presign request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::artifact(format!(
                "presign returned HTTP {} for {content_ref}",
                status.as_u16()
            )));
        }

        let presigned: PresignResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::artifact(format!("invalid presign response: {e}")))?;

        Ok(FetchUrl { url: presigned.url, expires_at: presigned.expires_at })
    }
}

pub mod stub {
    //! Deterministic resolver doubles for tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Resolver returning a fixed URL, or failing on demand.
    #[derive(Debug, Default)]
    pub struct StubArtifactResolver {
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubArtifactResolver {
        /// Resolver that always succeeds with a synthetic URL.
        pub fn succeeding() -> Self {
            Self { fail: false, calls: AtomicUsize::new(0) }
        }

        /// Resolver that always fails.
        pub fn failing() -> Self {
            Self { fail: true, calls: AtomicUsize::new(0) }
        }

        /// Number of resolve calls observed.
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ArtifactResolver for StubArtifactResolver {
        async fn resolve(&self, content_ref: &str, ttl: Duration) -> Result<FetchUrl> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self.fail {
                return Err(DeliveryError::artifact("stubbed resolver failure"));
            }

            let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
            Ok(FetchUrl {
                url: format!("https://media.test/fetch/{content_ref}"),
                expires_at: Utc::now() + ttl,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    #[tokio::test]
    async fn resolves_presigned_url_from_media_service() {
        let server = MockServer::start().await;
        let expires = Utc::now() + chrono::Duration::hours(1);

        Mock::given(method("GET"))
            .and(path("/artifacts/note-42/presign"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": "https://cdn.example.com/note-42?sig=abc",
                "expires_at": expires,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resolver =
            HttpArtifactResolver::new(server.uri(), &ClientConfig::default()).unwrap();
        let fetch = resolver.resolve("note-42", Duration::from_secs(3600)).await.unwrap();

        assert_eq!(fetch.url, "https://cdn.example.com/note-42?sig=abc");
        server.verify().await;
    }

    #[tokio::test]
    async fn presign_failure_is_artifact_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/artifacts/missing/presign"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let resolver =
            HttpArtifactResolver::new(server.uri(), &ClientConfig::default()).unwrap();
        let err = resolver.resolve("missing", Duration::from_secs(60)).await.unwrap_err();

        assert!(matches!(err, DeliveryError::ArtifactUnavailable { .. }));
        assert!(err.is_retryable());
    }
}
