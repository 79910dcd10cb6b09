//! Token-bucket throttle for error-retry loops.

use std::time::Duration;
use tokio::time::Instant;

/// A queueless token bucket replenished continuously over a window.
///
/// The worker calls [`increment`](RateLimiter::increment) on every
/// error-path traversal. While tokens remain, calls return immediately,
/// so short error bursts drain quickly; once the bucket is empty the
/// caller is slept exactly long enough for one token to accrue. This
/// throttles a tight error loop (broker entirely down) to the
/// configured rate without a fixed sleep.
pub struct RateLimiter {
    max_rate: f64,
    allowance: f64,
    window: Duration,
    last_check: Instant,
}

impl RateLimiter {
    /// Default capacity: one token.
    pub const DEFAULT_RATE: f64 = 1.0;

    /// Default replenishment window.
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

    pub fn new(max_rate: f64, window: Duration) -> Self {
        Self {
            max_rate,
            allowance: max_rate,
            window,
            last_check: Instant::now(),
        }
    }

    /// Consume one token, sleeping for the shortfall if none is
    /// available.
    pub async fn increment(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_check);
        self.last_check = now;

        self.allowance += elapsed.as_secs_f64() * (self.max_rate / self.window.as_secs_f64());
        if self.allowance > self.max_rate {
            self.allowance = self.max_rate;
        }

        if self.allowance < 1.0 {
            let shortfall = (1.0 - self.allowance) * (self.window.as_secs_f64() / self.max_rate);
            tokio::time::sleep(Duration::from_secs_f64(shortfall)).await;
            self.allowance = 0.0;
        } else {
            self.allowance -= 1.0;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RATE, Self::DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_token_is_free() {
        let mut limiter = RateLimiter::default();
        let before = Instant::now();
        limiter.increment().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bucket_sleeps_for_the_shortfall() {
        let mut limiter = RateLimiter::default();
        limiter.increment().await;

        let before = Instant::now();
        limiter.increment().await;
        // One token over a ten-second window.
        assert_eq!(before.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_replenish_over_time() {
        let mut limiter = RateLimiter::default();
        limiter.increment().await;

        tokio::time::advance(Duration::from_secs(10)).await;

        let before = Instant::now();
        limiter.increment().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_drain_a_larger_bucket_before_blocking() {
        let mut limiter = RateLimiter::new(3.0, Duration::from_secs(9));
        let before = Instant::now();
        limiter.increment().await;
        limiter.increment().await;
        limiter.increment().await;
        assert_eq!(before.elapsed(), Duration::ZERO);

        limiter.increment().await;
        // Three tokens per nine seconds: one accrues every three.
        assert_eq!(before.elapsed(), Duration::from_secs(3));
    }
}
