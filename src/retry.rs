//! Retry stage with exponential backoff and jitter.
//!
//! The delay before retry `n` (0-indexed) is `base_delay * 2^n` plus a
//! jitter drawn uniformly from `[0, jitter_max]` on every attempt. The
//! original call is attempt 0 and is not counted against `max_attempts`;
//! exhausting the budget surfaces the last observed error unchanged.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, ErrorKind};
use crate::message::BoxedMessage;
use crate::middleware::{Middleware, Next, StageResult};

/// Backoff and classification policy for the retry stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the original call.
    pub max_attempts: u32,
    /// Base delay for the exponential component.
    pub base_delay: Duration,
    /// Upper bound of the uniform jitter added to each delay.
    pub jitter_max: Duration,
    /// Error kinds eligible for retry.
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            jitter_max: Duration::from_millis(100),
            retry_on: vec![ErrorKind::Transient],
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Disables retries entirely.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn with_jitter_max(mut self, jitter_max: Duration) -> Self {
        self.jitter_max = jitter_max;
        self
    }

    pub fn with_retry_on(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.retry_on = kinds;
        self
    }

    /// Whether `error` should be retried after `attempt` completed retries.
    pub fn should_retry(&self, error: &DispatchError, attempt: u32) -> bool {
        attempt < self.max_attempts && self.retry_on.contains(&error.kind())
    }

    /// Delay before retry `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exponential = self.base_delay.saturating_mul(factor);

        if self.jitter_max.is_zero() {
            return exponential;
        }
        let jitter_nanos = rand::thread_rng().gen_range(0..=self.jitter_max.as_nanos());
        exponential.saturating_add(Duration::from_nanos(jitter_nanos as u64))
    }
}

/// Retry stage: re-issues the remainder of the chain on retryable failures.
///
/// Sleeping between attempts parks only the dispatching task; unrelated
/// dispatches are unaffected.
#[derive(Debug, Clone)]
pub struct RetryMiddleware {
    policy: RetryPolicy,
}

impl RetryMiddleware {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(&self, message: BoxedMessage, next: Next) -> StageResult {
        let name = next.meta().name;
        let mut attempt = 0u32;

        loop {
            match next.clone().run(message.clone_boxed()).await {
                Ok(output) => {
                    if attempt > 0 {
                        tracing::info!(
                            message.type = name,
                            attempts = attempt + 1,
                            "Dispatch succeeded after retries"
                        );
                    }
                    return Ok(output);
                }
                Err(err) => {
                    if !self.policy.should_retry(&err, attempt) {
                        if attempt > 0 {
                            tracing::error!(
                                message.type = name,
                                attempts = attempt + 1,
                                error = %err,
                                "Dispatch failed after retries"
                            );
                        }
                        return Err(err);
                    }

                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        message.type = name,
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_attempts,
                        error = %err,
                        delay.ms = delay.as_millis() as u64,
                        "Dispatch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_retries_transient_only() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.should_retry(&DispatchError::transient("timeout"), 0));
        assert!(!policy.should_retry(&DispatchError::failed("bad state"), 0));
        assert!(!policy.should_retry(
            &DispatchError::CircuitOpen {
                name: "jobs".to_string()
            },
            0
        ));
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let err = DispatchError::transient("timeout");
        assert!(policy.should_retry(&err, 0));
        assert!(policy.should_retry(&err, 2));
        assert!(!policy.should_retry(&err, 3));
        assert!(!policy.should_retry(&err, 10));
    }

    #[test]
    fn delay_doubles_without_jitter() {
        let policy =
            RetryPolicy::new(5, Duration::from_millis(100)).with_jitter_max(Duration::ZERO);

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_stays_inside_jitter_envelope() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100))
            .with_jitter_max(Duration::from_millis(50));

        for attempt in 0..4u32 {
            let floor = Duration::from_millis(100) * 2u32.pow(attempt);
            let ceiling = floor + Duration::from_millis(50);
            for _ in 0..20 {
                let delay = policy.delay_for(attempt);
                assert!(
                    delay >= floor && delay <= ceiling,
                    "attempt {attempt}: {delay:?} outside [{floor:?}, {ceiling:?}]"
                );
            }
        }
    }

    #[test]
    fn jitter_varies_between_samples() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100))
            .with_jitter_max(Duration::from_millis(100));

        let samples: std::collections::HashSet<Duration> =
            (0..50).map(|_| policy.delay_for(0)).collect();
        assert!(samples.len() > 1, "jitter should produce varied delays");
    }

    #[test]
    fn custom_retryable_set() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10))
            .with_retry_on(vec![ErrorKind::Transient, ErrorKind::Failed]);

        assert!(policy.should_retry(&DispatchError::failed("flaky"), 0));
        assert!(!policy.should_retry(
            &DispatchError::Conflict {
                key: "k".to_string()
            },
            0
        ));
    }

    #[test]
    fn none_policy_never_retries() {
        let policy = RetryPolicy::none();
        assert!(!policy.should_retry(&DispatchError::transient("timeout"), 0));
    }

    #[test]
    fn policy_serde_round_trip() {
        let policy = RetryPolicy::new(4, Duration::from_millis(250));
        let json = serde_json::to_string(&policy).expect("serialize");
        let restored: RetryPolicy = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(restored.max_attempts, 4);
        assert_eq!(restored.base_delay, Duration::from_millis(250));
        assert_eq!(restored.retry_on, vec![ErrorKind::Transient]);
    }
}
