use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Per-adapter request pacing. Two modes:
///
/// - [`RateLimiter::every`]: a minimum inter-request interval (the default,
///   1 s between calls).
/// - [`RateLimiter::per_second`]: a token bucket with configurable rate and
///   burst.
///
/// `acquire()` suspends on a tokio timer, so a caller that drops the future
/// (or races it against `tokio::time::timeout`) unblocks immediately instead
/// of sleeping out the full wait.
#[derive(Debug)]
pub enum RateLimiter {
    Interval(IntervalLimiter),
    Bucket(TokenBucket),
}

impl RateLimiter {
    /// Enforce a minimum gap between consecutive requests.
    pub fn every(min_interval: Duration) -> Self {
        RateLimiter::Interval(IntervalLimiter::new(min_interval))
    }

    /// Token bucket admitting `rate` requests per second with the given burst.
    pub fn per_second(rate: f64, burst: f64) -> Self {
        RateLimiter::Bucket(TokenBucket::new(rate, burst))
    }

    pub async fn acquire(&self) {
        match self {
            RateLimiter::Interval(l) => l.acquire().await,
            RateLimiter::Bucket(b) => b.acquire().await,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::every(Duration::from_secs(1))
    }
}

// ── Interval limiter ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct IntervalLimiter {
    min_interval: Duration,
    next_ready: Mutex<Option<Instant>>,
}

impl IntervalLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_ready: Mutex::new(None),
        }
    }

    /// Reserve the next slot, then sleep until it arrives. The slot is
    /// reserved up front, so a cancelled waiter burns its slot rather than
    /// letting a concurrent caller jump the interval.
    pub async fn acquire(&self) {
        let ready_at = {
            let mut next = self.next_ready.lock().expect("limiter lock poisoned");
            let now = Instant::now();
            let ready_at = next.map_or(now, |t| t.max(now));
            *next = Some(ready_at + self.min_interval);
            ready_at
        };
        if ready_at > Instant::now() {
            tokio::time::sleep_until(ready_at).await;
        }
    }
}

// ── Token bucket ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate: rate.max(f64::EPSILON),
            burst: burst.max(1.0),
            state: Mutex::new(BucketState {
                tokens: burst.max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("bucket lock poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // No token reserved while sleeping: a cancelled waiter leaves
                // the bucket untouched and concurrent waiters re-compete.
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn interval_limiter_spaces_requests() {
        let limiter = RateLimiter::every(Duration::from_secs(1));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(
            start.elapsed() >= Duration::from_secs(2),
            "three acquires need two full intervals, got {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_allows_burst_then_throttles() {
        let limiter = RateLimiter::per_second(1.0, 2.0);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10), "burst should be immediate");

        limiter.acquire().await;
        assert!(
            start.elapsed() >= Duration::from_millis(990),
            "third acquire should wait for a refill, got {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_unblocks_promptly() {
        // 0.1 req/s with burst 1: the second acquire would wait ~10 s.
        let limiter = RateLimiter::per_second(0.1, 1.0);
        limiter.acquire().await;

        let start = Instant::now();
        let result = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(result.is_err(), "acquire should have been cancelled");
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "cancellation must unblock within ~100ms, took {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_bucket_wait_does_not_consume_a_token() {
        let limiter = TokenBucket::new(1.0, 1.0);
        limiter.acquire().await;

        // Cancel a waiter halfway through the refill window.
        let _ = tokio::time::timeout(Duration::from_millis(500), limiter.acquire()).await;

        // A full second after the first acquire the bucket must have a token
        // again — the cancelled waiter must not have taken it.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }
}
