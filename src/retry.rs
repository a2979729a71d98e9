//! Retry/backoff/timeout wrapper around a single stage adapter call.
//!
//! Each attempt runs under `per_attempt_timeout`. A timeout or a
//! [`StageError::Retryable`] schedules another attempt after
//! `base_delay * backoff_multiplier^(attempt - 1)`, scaled by a jitter factor
//! drawn from `[1 - jitter_fraction, 1 + jitter_fraction]`. A
//! [`StageError::Terminal`] stops immediately. Running out of attempts is
//! reported as [`RetryFailure::Exhausted`], which callers map differently per
//! stage.

use crate::errors::StageError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Retry discipline applied to one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_fraction: f64,
    #[serde(
        rename = "per_attempt_timeout_ms",
        with = "option_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub per_attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter_fraction: 0.2,
            per_attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no delay, no timeout.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_fraction: 0.0,
            per_attempt_timeout: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = Some(timeout);
        self
    }

    /// Check the policy and return every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_attempts < 1 {
            problems.push("max_attempts must be >= 1".to_string());
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            problems.push(format!(
                "backoff_multiplier must be >= 1.0 (got {})",
                self.backoff_multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            problems.push(format!(
                "jitter_fraction must be within [0.0, 1.0] (got {})",
                self.jitter_fraction
            ));
        }
        if self.per_attempt_timeout == Some(Duration::ZERO) {
            problems.push("per_attempt_timeout must be greater than zero".to_string());
        }
        problems
    }

    /// Un-jittered delay scheduled after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Source of the multiplicative jitter factor.
pub trait JitterSource: Send + Sync {
    /// Return a factor within `[1 - fraction, 1 + fraction]`.
    fn factor(&self, fraction: f64) -> f64;
}

/// Uniform jitter from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformJitter;

impl JitterSource for UniformJitter {
    fn factor(&self, fraction: f64) -> f64 {
        if fraction <= 0.0 {
            return 1.0;
        }
        let fraction = fraction.min(1.0);
        rand::rng().random_range((1.0 - fraction)..=(1.0 + fraction))
    }
}

/// Why one attempt did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    Failed(StageError),
    TimedOut(Duration),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Failed(err) => write!(f, "{}", err),
            AttemptError::TimedOut(limit) => {
                write!(f, "attempt timed out after {}ms", limit.as_millis())
            }
        }
    }
}

/// Value produced by a successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySuccess<T> {
    pub value: T,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Final failure of a retried unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryFailure {
    #[error("{stage} failed with a non-retryable error on attempt {attempts}: {error}")]
    Terminal {
        stage: String,
        attempts: u32,
        error: StageError,
    },

    #[error("{stage} failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        stage: String,
        attempts: u32,
        last_error: AttemptError,
    },
}

impl RetryFailure {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryFailure::Terminal { attempts, .. } | RetryFailure::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryFailure::Exhausted { .. })
    }
}

/// Runs stage work under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    jitter: Arc<dyn JitterSource>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            jitter: Arc::new(UniformJitter),
        }
    }

    /// Replace the jitter source (deterministic jitter in tests).
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay to sleep after the given failed attempt, jitter applied.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.policy.backoff(attempt);
        let factor = self.jitter.factor(self.policy.jitter_fraction).max(0.0);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. A timed-out attempt is
    /// dropped (cancelled); the run itself is unaffected.
    pub async fn run<T, F, Fut>(&self, stage: &str, mut op: F) -> Result<RetrySuccess<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match self.policy.per_attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op(attempt)).await {
                    Ok(result) => result.map_err(AttemptError::Failed),
                    Err(_) => Err(AttemptError::TimedOut(limit)),
                },
                None => op(attempt).await.map_err(AttemptError::Failed),
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(stage, attempt, "stage succeeded after retry");
                    }
                    return Ok(RetrySuccess {
                        value,
                        attempts: attempt,
                    });
                }
                Err(AttemptError::Failed(error @ StageError::Terminal(_))) => {
                    tracing::warn!(stage, attempt, error = %error, "stage failed terminally");
                    return Err(RetryFailure::Terminal {
                        stage: stage.to_string(),
                        attempts: attempt,
                        error,
                    });
                }
                Err(err) => err,
            };

            if attempt >= max_attempts {
                tracing::warn!(stage, attempts = attempt, error = %err, "stage exhausted retries");
                return Err(RetryFailure::Exhausted {
                    stage: stage.to_string(),
                    attempts: attempt,
                    last_error: err,
                });
            }

            let delay = self.delay_after(attempt);
            tracing::debug!(
                stage,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "stage attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Serde helpers for Duration serialization.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    struct FixedJitter(f64);

    impl JitterSource for FixedJitter {
        fn factor(&self, _fraction: f64) -> f64 {
            self.0
        }
    }

    fn policy_ms(max_attempts: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_base_delay(Duration::from_millis(base_ms))
            .with_backoff_multiplier(2.0)
            .with_jitter_fraction(0.0)
    }

    #[test]
    fn test_backoff_is_exponential() {
        let policy = policy_ms(5, 100);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_applies_jitter_factor() {
        let executor = RetryExecutor::new(policy_ms(3, 100).with_jitter_fraction(0.5))
            .with_jitter(Arc::new(FixedJitter(1.5)));
        assert_eq!(executor.delay_after(1), Duration::from_millis(150));
        assert_eq!(executor.delay_after(2), Duration::from_millis(300));
    }

    #[test]
    fn test_uniform_jitter_stays_in_band() {
        let jitter = UniformJitter;
        for _ in 0..200 {
            let f = jitter.factor(0.2);
            assert!((0.8..=1.2).contains(&f), "factor {} out of band", f);
        }
        assert_eq!(jitter.factor(0.0), 1.0);
    }

    #[test]
    fn test_validate_rejects_bad_policy() {
        let policy = RetryPolicy {
            max_attempts: 0,
            base_delay: Duration::ZERO,
            backoff_multiplier: 0.5,
            jitter_fraction: 1.5,
            per_attempt_timeout: Some(Duration::ZERO),
        };
        assert_eq!(policy.validate().len(), 4);
        assert!(RetryPolicy::default().validate().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_call_is_attempted_max_times_with_backoff() {
        let executor = RetryExecutor::new(policy_ms(3, 100));
        let calls: Mutex<Vec<Instant>> = Mutex::new(Vec::new());

        let result: Result<RetrySuccess<()>, _> = executor
            .run("branch", |_| {
                calls.lock().unwrap().push(Instant::now());
                async { Err(StageError::retryable("flaky")) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 3);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1] - calls[0];
        let second_gap = calls[2] - calls[1];
        assert!(
            first_gap >= Duration::from_millis(100) && first_gap < Duration::from_millis(110),
            "first gap {:?}",
            first_gap
        );
        assert!(
            second_gap >= Duration::from_millis(200) && second_gap < Duration::from_millis(210),
            "second gap {:?}",
            second_gap
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_short_circuits() {
        let executor = RetryExecutor::new(policy_ms(5, 10));
        let calls = AtomicU32::new(0);

        let result: Result<RetrySuccess<()>, _> = executor
            .run("scan", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StageError::terminal("malformed input")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result.unwrap_err() {
            RetryFailure::Terminal { attempts, error, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(error, StageError::terminal("malformed input"));
            }
            other => panic!("Expected Terminal, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let executor = RetryExecutor::new(policy_ms(4, 10));

        let result = executor
            .run("join", |attempt| async move {
                if attempt < 3 {
                    Err(StageError::retryable("busy"))
                } else {
                    Ok(attempt * 10)
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, 30);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_retryable_attempt() {
        let executor = RetryExecutor::new(
            policy_ms(2, 10).with_timeout(Duration::from_millis(50)),
        );
        let calls = AtomicU32::new(0);

        let result: Result<RetrySuccess<()>, _> = executor
            .run("branch", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match result.unwrap_err() {
            RetryFailure::Exhausted { last_error, .. } => {
                assert_eq!(last_error, AttemptError::TimedOut(Duration::from_millis(50)));
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_policy_serde_uses_milliseconds() {
        let policy = policy_ms(3, 250).with_timeout(Duration::from_secs(2));
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["base_delay_ms"], 250);
        assert_eq!(json["per_attempt_timeout_ms"], 2000);
        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }

    #[test]
    fn test_policy_fields_default_individually() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert!(policy.per_attempt_timeout.is_none());
    }
}
