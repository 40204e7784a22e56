//! Rate-limit aware retries for outbound calls and backoff policies for jobs.
//!
//! The [`RetryingInvoker`] wraps a single outbound call. It retries only when
//! the caller-supplied predicate classifies the error as a rate-limit signal
//! (an HTTP 429 by default), sleeping between attempts according to a
//! [`BackoffPolicy`]. Every other error, transient or not, is returned to the
//! caller untouched after the first attempt.
//!
//! # Examples
//!
//! ```rust
//! use cadence_queue::retry::{HttpStatusError, RetryingInvoker};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let invoker = RetryingInvoker::<HttpStatusError>::rate_limited();
//!
//! let value = invoker
//!     .invoke(|| async { Ok::<_, HttpStatusError>(42) }, 3)
//!     .await
//!     .unwrap();
//! assert_eq!(value, 42);
//! # }
//! ```
//!
//! Outbound clients that already speak a concrete error type only need to
//! implement [`RateLimitSignal`] and call [`retry_on_rate_limit`].

use crate::config::{RetryConfig, duration_str};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

/// Retry budget used when the caller does not pick one.
pub const DEFAULT_RETRIES: u32 = 3;

/// Upper bound for any single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_millis(60_000);

/// Random component added on top of the deterministic backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Jitter {
    /// No randomness; the delay equals the base delay.
    None,
    /// Add a uniformly random duration in `min..=max`.
    Uniform {
        #[serde(with = "duration_str")]
        min: Duration,
        #[serde(with = "duration_str")]
        max: Duration,
    },
}

impl Jitter {
    pub fn sample(&self) -> Duration {
        match self {
            Jitter::None => Duration::ZERO,
            Jitter::Uniform { min, max } => {
                let low = min.as_millis() as u64;
                let high = (max.as_millis() as u64).max(low);
                Duration::from_millis(rand::thread_rng().gen_range(low..=high))
            }
        }
    }
}

/// Capped exponential backoff.
///
/// `base_delay(i) = min(base * 2^i, max_delay)` is a pure, non-decreasing
/// function of the attempt index. [`delay`](Self::delay) adds jitter and
/// clamps the sum to `max_delay` again, so no sleep ever exceeds the cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(with = "duration_str")]
    pub base: Duration,
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
    pub jitter: Jitter,
}

impl BackoffPolicy {
    /// Exponential backoff without jitter.
    pub fn exponential(base: Duration, max_delay: Duration) -> Self {
        Self {
            base,
            max_delay,
            jitter: Jitter::None,
        }
    }

    /// The policy outbound integrations use on HTTP 429:
    /// `2^i` ms plus 1..=1000 ms of jitter, capped at one minute.
    pub fn rate_limit_default() -> Self {
        Self {
            base: Duration::from_millis(1),
            max_delay: MAX_BACKOFF,
            jitter: Jitter::Uniform {
                min: Duration::from_millis(1),
                max: Duration::from_millis(1000),
            },
        }
    }

    /// Default policy for re-queuing failed jobs.
    pub fn job_default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(300))
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn base_delay(&self, attempt_index: u32) -> Duration {
        let factor = 1u128 << attempt_index.min(64);
        let millis = self.base.as_millis().saturating_mul(factor);
        let capped = millis.min(self.max_delay.as_millis());
        Duration::from_millis(capped as u64)
    }

    pub fn delay(&self, attempt_index: u32) -> Duration {
        (self.base_delay(attempt_index) + self.jitter.sample()).min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::rate_limit_default()
    }
}

/// Retry bookkeeping for one logical call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub initial_budget: u32,
    pub remaining: u32,
}

impl RetryState {
    pub fn new(initial_budget: u32) -> Self {
        Self {
            initial_budget,
            remaining: initial_budget,
        }
    }

    /// Index of the retry about to happen, starting at 1 for the first retry.
    pub fn attempt_index(&self) -> u32 {
        self.initial_budget + 1 - self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Spend one retry. Returns false once the budget is gone.
    pub fn consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// Errors that can tell whether the remote side asked us to slow down.
pub trait RateLimitSignal {
    fn is_rate_limited(&self) -> bool;
}

/// Minimal HTTP failure for clients that do not expose a richer error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("HTTP {status}: {message}")]
pub struct HttpStatusError {
    pub status: u16,
    pub message: String,
}

impl HttpStatusError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl RateLimitSignal for HttpStatusError {
    fn is_rate_limited(&self) -> bool {
        self.status == 429
    }
}

#[cfg(feature = "http")]
impl RateLimitSignal for reqwest::Error {
    fn is_rate_limited(&self) -> bool {
        self.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS)
    }
}

type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Wraps an outbound call with bounded, rate-limit triggered retries.
///
/// Total attempts never exceed `initial_retries + 1`. The caller receives
/// either the first successful value or the error of the final attempt.
pub struct RetryingInvoker<E> {
    should_retry: RetryPredicate<E>,
    backoff: BackoffPolicy,
    default_retries: u32,
    label: String,
}

impl<E> Clone for RetryingInvoker<E> {
    fn clone(&self) -> Self {
        Self {
            should_retry: Arc::clone(&self.should_retry),
            backoff: self.backoff.clone(),
            default_retries: self.default_retries,
            label: self.label.clone(),
        }
    }
}

impl<E: RateLimitSignal + 'static> RetryingInvoker<E> {
    /// Retry only on errors reporting a rate-limit signal.
    pub fn rate_limited() -> Self {
        Self::new(|err: &E| err.is_rate_limited())
    }

    /// Rate-limit invoker with the budget and backoff of the `[retry]` section.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::rate_limited()
            .with_backoff(config.backoff.clone())
            .with_default_retries(config.initial_retries)
    }
}

impl<E> RetryingInvoker<E> {
    pub fn new<P>(should_retry: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            should_retry: Arc::new(should_retry),
            backoff: BackoffPolicy::rate_limit_default(),
            default_retries: DEFAULT_RETRIES,
            label: "outbound".to_string(),
        }
    }

    /// Budget used by [`call`](Self::call)
    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Name used in log lines, usually the integration being called.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn default_retries(&self) -> u32 {
        self.default_retries
    }

    /// [`invoke`](Self::invoke) with the configured default budget.
    pub async fn call<T, F, Fut>(&self, call: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.invoke(call, self.default_retries).await
    }

    pub async fn invoke<T, F, Fut>(&self, mut call: F, initial_retries: u32) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut state = RetryState::new(initial_retries);

        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !(self.should_retry)(&err) {
                debug!(integration = %self.label, error = %err, "Outbound call failed without a retryable signal");
                return Err(err);
            }

            if state.is_exhausted() {
                warn!(
                    integration = %self.label,
                    attempts = initial_retries + 1,
                    error = %err,
                    "Retry budget exhausted"
                );
                return Err(err);
            }

            let delay = self.backoff.delay(state.attempt_index());
            warn!(
                integration = %self.label,
                remaining = state.remaining,
                attempt = state.attempt_index(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Rate limited, retrying outbound call"
            );
            tokio::time::sleep(delay).await;
            state.consume();
        }
    }
}

/// Run `call` with the default rate-limit invoker and a budget of
/// [`DEFAULT_RETRIES`].
pub async fn retry_on_rate_limit<T, E, F, Fut>(call: F) -> Result<T, E>
where
    E: RateLimitSignal + Display + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    RetryingInvoker::rate_limited()
        .invoke(call, DEFAULT_RETRIES)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn deterministic() -> BackoffPolicy {
        BackoffPolicy::exponential(Duration::from_secs(1), MAX_BACKOFF)
    }

    #[test]
    fn test_base_delay_is_non_decreasing_and_capped() {
        for policy in [
            BackoffPolicy::rate_limit_default(),
            BackoffPolicy::job_default(),
            deterministic(),
        ] {
            let mut previous = Duration::ZERO;
            for attempt in 0..200 {
                let delay = policy.base_delay(attempt);
                assert!(delay >= previous, "attempt {attempt} decreased");
                assert!(delay <= policy.max_delay);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_jittered_delay_never_exceeds_cap() {
        let policy = BackoffPolicy::rate_limit_default();
        for attempt in 0..100 {
            let delay = policy.delay(attempt);
            assert!(delay <= MAX_BACKOFF);
            assert!(delay >= policy.base_delay(attempt).min(MAX_BACKOFF));
        }
    }

    #[test]
    fn test_rate_limit_default_shape() {
        let policy = BackoffPolicy::rate_limit_default();
        assert_eq!(policy.base_delay(0), Duration::from_millis(1));
        assert_eq!(policy.base_delay(3), Duration::from_millis(8));
        assert_eq!(policy.base_delay(40), MAX_BACKOFF);

        let delay = policy.delay(1);
        assert!(delay >= Duration::from_millis(3));
        assert!(delay <= Duration::from_millis(1002));
    }

    #[test]
    fn test_retry_state() {
        let mut state = RetryState::new(3);
        assert_eq!(state.attempt_index(), 1);
        assert!(state.consume());
        assert_eq!(state.attempt_index(), 2);
        assert!(state.consume());
        assert!(state.consume());
        assert!(state.is_exhausted());
        assert!(!state.consume());
        assert_eq!(state.remaining, 0);
    }

    #[test]
    fn test_backoff_serialization() {
        let policy = BackoffPolicy::rate_limit_default();
        let json = serde_json::to_string(&policy).unwrap();
        let back: BackoffPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_three_rate_limited_attempts() {
        let calls = AtomicU32::new(0);
        let invoker = RetryingInvoker::<HttpStatusError>::rate_limited().with_backoff(deterministic());
        let start = Instant::now();

        let result = invoker
            .invoke(
                || {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if attempt <= 3 {
                            Err(HttpStatusError::new(429, "slow down"))
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                3,
            )
            .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // Three sleeps: attempt indices 1, 2 and 3 -> 2s + 4s + 8s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(14));
        assert!(elapsed < Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoker_from_retry_config() {
        let config = RetryConfig {
            initial_retries: 1,
            backoff: BackoffPolicy::exponential(Duration::from_secs(5), Duration::from_secs(5)),
        };
        let invoker = RetryingInvoker::<HttpStatusError>::from_config(&config);
        assert_eq!(invoker.default_retries(), 1);
        assert_eq!(invoker.backoff(), &config.backoff);

        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result: Result<(), _> = invoker
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(HttpStatusError::new(429, "slow down")) }
            })
            .await;

        assert_eq!(result.unwrap_err().status, 429);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(
            RetryingInvoker::<HttpStatusError>::rate_limited().default_retries(),
            DEFAULT_RETRIES
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_rate_limited_makes_budget_plus_one_calls() {
        let calls = AtomicU32::new(0);
        let invoker = RetryingInvoker::<HttpStatusError>::rate_limited();

        let result: Result<(), _> = invoker
            .invoke(
                || {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Err(HttpStatusError::new(429, format!("attempt {attempt}"))) }
                },
                3,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.unwrap_err().message, "attempt 4");
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_rate_limit_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), _> = retry_on_rate_limit(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(HttpStatusError::new(503, "unavailable")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().status, 503);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_surfaces_first_error() {
        let calls = AtomicU32::new(0);
        let invoker = RetryingInvoker::<HttpStatusError>::rate_limited();

        let result: Result<(), _> = invoker
            .invoke(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(HttpStatusError::new(429, "busy")) }
                },
                0,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate() {
        #[derive(Debug)]
        struct Flaky(bool);
        impl Display for Flaky {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "flaky({})", self.0)
            }
        }

        let calls = AtomicU32::new(0);
        let invoker = RetryingInvoker::new(|err: &Flaky| err.0)
            .with_label("custom")
            .with_backoff(deterministic());

        let result = invoker
            .invoke(
                || {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        match attempt {
                            0 => Err(Flaky(true)),
                            1 => Err(Flaky(false)),
                            _ => Ok(()),
                        }
                    }
                },
                5,
            )
            .await;

        assert!(!result.unwrap_err().0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
