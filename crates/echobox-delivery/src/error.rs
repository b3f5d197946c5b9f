//! Error types for delivery operations.
//!
//! Covers network failures, provider responses, artifact resolution,
//! destination configuration, and store coordination. Every error is
//! classified as retryable or permanent at construction so the lifecycle
//! controller can decide between re-queueing and terminal failure without
//! inspecting provider internals.

use std::time::Duration;

use echobox_core::models::Channel;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions arising while dispatching a claimed job.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure reaching a provider.
    #[error("network error: {message}")]
    Network {
        /// Description of the network failure.
        message: String,
    },

    /// Provider call exceeded its per-call timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Seconds before the call was abandoned.
        timeout_seconds: u64,
    },

    /// Provider responded with an error status.
    #[error("provider error: HTTP {status}")]
    Provider {
        /// HTTP status returned by the provider gateway.
        status: u16,
        /// Response body excerpt for diagnostics.
        message: String,
    },

    /// Provider rate-limited the call with retry guidance.
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_seconds: u64,
    },

    /// The requested channel has no matching destination on the recipient.
    ///
    /// A configuration/data error that can never succeed on retry.
    #[error("no {channel} destination on recipient")]
    MissingDestination {
        /// Channel lacking a destination.
        channel: Channel,
    },

    /// The artifact resolver could not produce a fetch URL.
    ///
    /// Fails the whole attempt for every requested channel; no partial
    /// attempt happens without a valid URL.
    #[error("artifact unavailable: {message}")]
    ArtifactUnavailable {
        /// Resolver failure detail.
        message: String,
    },

    /// Job store operation failed during claim or transition commit.
    #[error("store error: {message}")]
    Store {
        /// Store failure detail.
        message: String,
    },

    /// Invalid engine or client configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Configuration problem detail.
        message: String,
    },

    /// A worker task panicked during shutdown.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Identifier of the panicked worker.
        worker_id: usize,
        /// Join error detail.
        error: String,
    },

    /// Graceful shutdown exceeded its deadline.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal failure detail.
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a provider error from an HTTP response.
    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        Self::Provider { status, message: message.into() }
    }

    /// Creates a rate limit error with retry guidance.
    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a missing-destination error for a channel.
    pub fn missing_destination(channel: Channel) -> Self {
        Self::MissingDestination { channel }
    }

    /// Creates an artifact resolution error.
    pub fn artifact(message: impl Into<String>) -> Self {
        Self::ArtifactUnavailable { message: message.into() }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether this failure is worth another attempt.
    ///
    /// Transient conditions (network, timeout, provider 5xx, rate limits,
    /// resolver outages, store hiccups) are retryable. Configuration and
    /// destination problems are permanent: retrying an error that can
    /// never succeed only wastes the attempt budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::ArtifactUnavailable { .. }
            | Self::Store { .. } => true,

            Self::Provider { status, .. } => *status >= 500 || *status == 429,

            Self::MissingDestination { .. }
            | Self::Configuration { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Provider-suggested retry delay, when one was given.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => Some(*retry_after_seconds),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(10).is_retryable());
        assert!(DeliveryError::provider(500, "upstream down").is_retryable());
        assert!(DeliveryError::provider(429, "slow down").is_retryable());
        assert!(DeliveryError::rate_limited(60).is_retryable());
        assert!(DeliveryError::artifact("presign failed").is_retryable());
        assert!(DeliveryError::store("pool exhausted").is_retryable());
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(!DeliveryError::provider(400, "bad request").is_retryable());
        assert!(!DeliveryError::provider(404, "unknown sender").is_retryable());
        assert!(!DeliveryError::missing_destination(Channel::Sms).is_retryable());
        assert!(!DeliveryError::configuration("bad gateway url").is_retryable());
    }

    #[test]
    fn rate_limit_retry_after_extracted() {
        assert_eq!(DeliveryError::rate_limited(120).retry_after_seconds(), Some(120));
        assert_eq!(DeliveryError::timeout(30).retry_after_seconds(), None);
    }

    #[test]
    fn missing_destination_names_the_channel() {
        let err = DeliveryError::missing_destination(Channel::Sms);
        assert_eq!(err.to_string(), "no sms destination on recipient");
    }
}
