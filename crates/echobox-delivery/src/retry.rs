//! Exponential backoff retry policy with jitter.
//!
//! A failed attempt is re-queued with `next_attempt_at = now + base ×
//! 2^(attempt-1)`, jittered and capped, so a struggling provider is not
//! hammered on every poll tick. The attempt bound itself lives on the job
//! (`max_attempts`); the policy only shapes the delay curve.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Backoff configuration applied to failed delivery attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay for the exponential backoff calculation.
    pub base_delay: Duration,

    /// Cap on the delay between attempts.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to the computed delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Raw backoff delay for a 1-based attempt number, before jitter.
    ///
    /// Produces base, 2×base, 4×base, ... capped at `max_delay`.
    fn backoff_delay(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        std::cmp::min(self.base_delay * multiplier, self.max_delay)
    }
}

/// Context for deciding whether a failed attempt gets another try.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt number that just failed (1-based).
    pub attempt_number: u32,
    /// Attempt bound from the job.
    pub max_attempts: u32,
    /// Error that caused the failure.
    pub error: DeliveryError,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Policy shaping the delay.
    pub policy: RetryPolicy,
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue the job, eligible again at the given time.
    Retry {
        /// Earliest time the next attempt may run.
        next_attempt_at: DateTime<Utc>,
    },
    /// No further attempts; the job fails terminally.
    GiveUp {
        /// Why delivery is being abandoned.
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed attempt.
    pub fn new(
        attempt_number: u32,
        max_attempts: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt_number, max_attempts, error, failed_at, policy }
    }

    /// Decides whether and when to retry.
    ///
    /// Gives up once the attempt budget is spent or the error can never
    /// succeed. Provider `Retry-After` guidance overrides the computed
    /// backoff.
    pub fn decide_retry(&self) -> RetryDecision {
        if self.attempt_number >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exhausted", self.max_attempts),
            };
        }

        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("permanent error: {}", self.error),
            };
        }

        let delay = self.calculate_delay();
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + chrono_delay }
    }

    /// Delay until the next attempt.
    pub fn calculate_delay(&self) -> Duration {
        if let Some(retry_after) = self.error.retry_after_seconds() {
            return Duration::from_secs(retry_after);
        }

        let capped = self.policy.backoff_delay(self.attempt_number);
        let jittered = apply_jitter(capped, self.policy.jitter_factor);

        std::cmp::min(jittered, self.policy.max_delay)
    }
}

/// Randomizes a delay by ±`jitter_factor` to spread retries from jobs that
/// failed together against the same provider.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();
    let range = duration.as_secs_f64() * clamped;
    let offset = rng.random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn backoff_doubles_each_attempt() {
        let policy = no_jitter_policy();
        let failed_at = Utc::now();

        let delays: Vec<Duration> = (1..=4)
            .map(|attempt| {
                RetryContext::new(
                    attempt,
                    10,
                    DeliveryError::timeout(30),
                    failed_at,
                    policy.clone(),
                )
                .calculate_delay()
            })
            .collect();

        assert_eq!(delays[0], Duration::from_secs(60));
        assert_eq!(delays[1], Duration::from_secs(120));
        assert_eq!(delays[2], Duration::from_secs(240));
        assert_eq!(delays[3], Duration::from_secs(480));
    }

    #[test]
    fn backoff_respects_cap() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(300), ..no_jitter_policy() };
        let context =
            RetryContext::new(10, 20, DeliveryError::timeout(30), Utc::now(), policy);

        assert!(context.calculate_delay() <= Duration::from_secs(300));
    }

    #[test]
    fn gives_up_at_max_attempts() {
        let context = RetryContext::new(
            3,
            3,
            DeliveryError::timeout(30),
            Utc::now(),
            no_jitter_policy(),
        );

        match context.decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("must not retry at max attempts"),
        }
    }

    #[test]
    fn permanent_errors_never_retry() {
        let context = RetryContext::new(
            1,
            3,
            DeliveryError::missing_destination(echobox_core::models::Channel::Sms),
            Utc::now(),
            no_jitter_policy(),
        );

        match context.decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("permanent")),
            RetryDecision::Retry { .. } => unreachable!("must not retry permanent errors"),
        }
    }

    #[test]
    fn retry_after_guidance_overrides_backoff() {
        let context = RetryContext::new(
            1,
            3,
            DeliveryError::rate_limited(90),
            Utc::now(),
            no_jitter_policy(),
        );

        assert_eq!(context.calculate_delay(), Duration::from_secs(90));
    }

    #[test]
    fn retry_decision_anchors_on_failure_time() {
        let failed_at = Utc::now();
        let context = RetryContext::new(
            1,
            3,
            DeliveryError::timeout(30),
            failed_at,
            no_jitter_policy(),
        );

        match context.decide_retry() {
            RetryDecision::Retry { next_attempt_at } => {
                assert_eq!(next_attempt_at, failed_at + chrono::Duration::seconds(60));
            },
            RetryDecision::GiveUp { .. } => unreachable!("first attempt should retry"),
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(100);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..20 {
            let jittered = apply_jitter(base, 0.5);
            assert!(jittered >= Duration::from_secs(50), "too small: {jittered:?}");
            assert!(jittered <= Duration::from_secs(150), "too large: {jittered:?}");
            seen.insert(jittered.as_millis());
        }

        assert!(seen.len() > 1, "jitter should vary the delay");
    }
}
