//! Token Bucket Rate Limiter for INSERT Submission
//!
//! Makes load intensity an explicit parameter instead of "as fast as the store
//! accepts". One limiter is shared by every worker of a run.
//!
//! ## Algorithm
//!
//! Start with `burst` tokens, refill at `rate` tokens/second, capped at
//! `burst`. Each INSERT consumes one token. When the bucket is empty the
//! caller sleeps exactly until the next token is due, so `acquire()` never
//! spins.
//!
//! Time comes from `tokio::time`, which lets tests drive the bucket with a
//! paused clock.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    /// Tokens per second.
    pub rate: f64,
    /// Bucket capacity.
    pub burst: f64,
}

impl BucketConfig {
    /// Capacity of one second's worth of tokens, but never less than one.
    pub fn per_second(rate: f64) -> Self {
        Self {
            rate,
            burst: rate.max(1.0),
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    config: BucketConfig,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// A negative or NaN rate is treated as zero: after the initial burst,
    /// `acquire()` waits until cancelled.
    pub fn new(config: BucketConfig) -> Self {
        let config = BucketConfig {
            rate: if config.rate.is_nan() { 0.0 } else { config.rate.max(0.0) },
            burst: if config.burst.is_nan() { 0.0 } else { config.burst.max(0.0) },
        };
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn per_second(rate: f64) -> Self {
        Self::new(BucketConfig::per_second(rate))
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // Zero rate: the division is infinite and no token ever comes.
                Duration::try_from_secs_f64((1.0 - state.tokens) / self.config.rate)
                    .unwrap_or(Duration::MAX)
            };
            tokio::time::sleep(wait.max(Duration::from_micros(1))).await;
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.config.rate)
            .min(self.config.burst);
        state.last_refill = now;
    }
}
