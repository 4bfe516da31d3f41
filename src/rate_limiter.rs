//! Token bucket rate limiter bound to a single endpoint.
//!
//! Hand-rolled rather than built on a crate like `governor`: the pool's
//! fallback path (spec §4.2 step 4) needs `reserve()`/`cancel()` as
//! explicit, separately-cancellable operations rather than an all-in-one
//! rate-limited-call wrapper.

use tokio::sync::Mutex;
use tokio::time::Instant;
use std::time::Duration;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    rate_per_second: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

/// A held reservation; `cancel` returns its tokens to the bucket.
pub struct Reservation {
    tokens: f64,
}

impl RateLimiter {
    pub fn new(rate_per_second: f64, burst: f64) -> Self {
        Self {
            rate_per_second,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_second).min(self.burst);
        state.last_refill = now;
    }

    /// Non-blocking: consume a token if one is immediately available.
    pub async fn allow(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Returns the duration after which a token is guaranteed to be available,
    /// and holds that token reserved (subtracts it from the bucket immediately
    /// so concurrent callers don't oversubscribe the same future token).
    pub async fn reserve(&self) -> (Duration, Reservation) {
        let mut state = self.state.lock().await;
        self.refill(&mut state);

        let wait = if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            let deficit = 1.0 - state.tokens;
            Duration::from_secs_f64(deficit / self.rate_per_second)
        };
        state.tokens -= 1.0;

        (wait, Reservation { tokens: 1.0 })
    }

    /// Credit a cancelled reservation's tokens back to the bucket.
    pub async fn cancel(&self, reservation: Reservation) {
        let mut state = self.state.lock().await;
        state.tokens = (state.tokens + reservation.tokens).min(self.burst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_exhausts_burst_then_refuses() {
        let limiter = RateLimiter::new(1.0, 3.0);
        assert!(limiter.allow().await);
        assert!(limiter.allow().await);
        assert!(limiter.allow().await);
        assert!(!limiter.allow().await);
    }

    #[tokio::test]
    async fn reserve_returns_zero_wait_when_tokens_available() {
        let limiter = RateLimiter::new(1.0, 5.0);
        let (wait, _res) = limiter.reserve().await;
        assert_eq!(wait, Duration::ZERO);
    }

    #[tokio::test]
    async fn reserve_returns_positive_wait_when_exhausted() {
        let limiter = RateLimiter::new(1.0, 1.0);
        let (_wait, _first) = limiter.reserve().await;
        let (wait, _second) = limiter.reserve().await;
        assert!(wait > Duration::ZERO);
    }

    #[tokio::test]
    async fn cancel_undoes_a_reservation() {
        let limiter = RateLimiter::new(1.0, 1.0);
        assert!(limiter.allow().await); // bucket now empty

        let (wait_before, extra) = limiter.reserve().await; // reserves a second, not-yet-refilled token
        limiter.cancel(extra).await; // give it back immediately

        let (wait_after, _res) = limiter.reserve().await;
        assert!((wait_after.as_secs_f64() - wait_before.as_secs_f64()).abs() < 0.05);
    }
}
