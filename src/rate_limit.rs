use crate::{config::duration_str, error::CadenceError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// At most `max` operations per `per`, shared by every worker of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max: u64,
    #[serde(with = "duration_str")]
    pub per: Duration,
    /// Tokens that may be taken back to back; defaults to `max`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u64>,
}

impl RateLimit {
    pub fn new(max: u64, per: Duration) -> Self {
        Self {
            max,
            per,
            burst: None,
        }
    }

    pub fn per_second(max: u64) -> Self {
        Self::new(max, Duration::from_secs(1))
    }

    pub fn per_minute(max: u64) -> Self {
        Self::new(max, Duration::from_secs(60))
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn capacity(&self) -> u64 {
        self.burst.unwrap_or(self.max)
    }

    fn refill_rate_per_ms(&self) -> f64 {
        let window = self.per.as_millis().max(1) as f64;
        self.max as f64 / window
    }
}

/// Token bucket refilled continuously at `max / per`
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// tokens per millisecond
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    pub fn try_consume(&mut self, tokens: f64) -> bool {
        self.refill();

        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let tokens_to_add = self.refill_rate * elapsed.as_millis() as f64;

        // Keep the sub-millisecond remainder for the next refill
        if tokens_to_add > 0.0 {
            self.tokens = (self.tokens + tokens_to_add).min(self.capacity);
            self.last_refill += Duration::from_millis(elapsed.as_millis() as u64);
        }
    }

    pub fn available_tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    /// Time until one more token is available; `None` if the bucket never refills.
    pub fn time_until_token(&mut self) -> Option<Duration> {
        self.refill();

        if self.tokens >= 1.0 {
            Some(Duration::ZERO)
        } else if self.refill_rate <= 0.0 {
            None
        } else {
            let tokens_needed = 1.0 - self.tokens;
            let ms_needed = (tokens_needed / self.refill_rate).ceil() as u64;
            Some(Duration::from_millis(ms_needed.max(1)))
        }
    }
}

/// Pool-wide limiter. Clones share one bucket.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
    rate_limit: RateLimit,
}

impl RateLimiter {
    pub fn new(rate_limit: RateLimit) -> Self {
        let capacity = rate_limit.capacity() as f64;
        let refill_rate = rate_limit.refill_rate_per_ms();

        Self {
            bucket: Arc::new(Mutex::new(TokenBucket::new(capacity, refill_rate))),
            rate_limit,
        }
    }

    /// Take a permit if one is available right now
    pub fn try_acquire(&self) -> bool {
        match self.bucket.lock() {
            Ok(mut bucket) => bucket.try_consume(1.0),
            // A poisoned lock only means another holder panicked mid-update
            Err(poisoned) => poisoned.into_inner().try_consume(1.0),
        }
    }

    /// Wait until a permit is available
    pub async fn acquire(&self) -> Result<(), CadenceError> {
        loop {
            let wait_time = {
                let mut bucket = self.bucket.lock().map_err(|_| CadenceError::RateLimit {
                    message: "Rate limiter lock poisoned".to_string(),
                })?;
                if bucket.try_consume(1.0) {
                    return Ok(());
                }
                bucket.time_until_token()
            };

            match wait_time {
                Some(wait) => sleep(wait).await,
                None => {
                    return Err(CadenceError::RateLimit {
                        message: format!(
                            "Rate limit of {} per {:?} never grants a permit",
                            self.rate_limit.max, self.rate_limit.per
                        ),
                    });
                }
            }
        }
    }

    pub fn rate_limit(&self) -> &RateLimit {
        &self.rate_limit
    }

    pub fn available_tokens(&self) -> f64 {
        self.bucket
            .lock()
            .map(|mut bucket| bucket.available_tokens())
            .unwrap_or(0.0)
    }
}
