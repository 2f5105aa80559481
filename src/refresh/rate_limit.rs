//! Token-bucket rate limiter.
//!
//! Shared by the refresh sweeper (global refresh QPS budget) and the
//! credential listeners (per-listener request rate). Non-blocking only: a
//! denied acquire is a decision, never a queue.

use std::sync::Mutex;

use tokio::time::Instant;

pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate_per_second: f64,
    burst: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Panics if the rate is non-positive or the burst below one token;
    /// limiter parameters come from validated configuration.
    pub fn new(rate_per_second: f64, burst: f64) -> Self {
        assert!(rate_per_second > 0.0, "rate must be positive");
        assert!(burst >= 1.0, "burst must allow at least one token");
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            rate_per_second,
            burst,
        }
    }

    /// Take one token if available right now.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_second).min(self.burst);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
