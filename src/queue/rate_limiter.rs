//! Rate limiters deciding how long a requeued key waits before redelivery

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Overall requeue rate of the default controller limiter
const DEFAULT_QPS: f64 = 10.0;

/// Burst size of the default controller limiter
const DEFAULT_BURST: u32 = 100;

/// Decides the cool-down of a key that is being requeued after a failure.
pub trait RateLimiter: Send + Sync {
    /// Delay before `key` may be handed out again. Each call counts as one
    /// more failure for the key.
    fn when(&self, key: &str) -> Duration;

    /// Drop all retry state of `key`
    fn forget(&self, key: &str);

    /// Number of failures recorded for `key` since the last `forget`
    fn num_requeues(&self, key: &str) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    /// Create a limiter starting at `base` and never exceeding `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.to_string()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);

        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.max)
            .min(self.max)
    }

    fn forget(&self, key: &str) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by all keys, limiting the overall requeue rate.
///
/// Keeps no per-key state, so `forget` and `num_requeues` are no-ops.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Create a bucket refilled at `qps` tokens per second holding at most `burst`
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &str) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;

        // Reserve a token even when the bucket is empty; the debt is paid
        // back by waiting.
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &str) {}

    fn num_requeues(&self, _key: &str) -> u32 {
        0
    }
}

/// Combines limiters, waiting for the slowest of them.
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &str) -> Duration {
        // Every limiter must observe the failure, so no short-circuiting.
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, key: &str) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key exponential backoff combined with an overall 10 qps / 100 burst bucket
pub fn default_controller_rate_limiter(base: Duration, max: Duration) -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(base, max)),
        Box::new(BucketRateLimiter::new(DEFAULT_QPS, DEFAULT_BURST)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_per_failure() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        );

        assert_eq!(limiter.when("default/foo"), Duration::from_millis(5));
        assert_eq!(limiter.when("default/foo"), Duration::from_millis(10));
        assert_eq!(limiter.when("default/foo"), Duration::from_millis(20));
        assert_eq!(limiter.num_requeues("default/foo"), 3);

        // Other keys have their own counters
        assert_eq!(limiter.when("default/bar"), Duration::from_millis(5));
        assert_eq!(limiter.num_requeues("default/bar"), 1);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_millis(8));

        let delays: Vec<_> = (0..6).map(|_| limiter.when("default/foo")).collect();
        assert_eq!(
            delays,
            vec![1, 2, 4, 8, 8, 8]
                .into_iter()
                .map(Duration::from_millis)
                .collect::<Vec<_>>()
        );

        // Far past the point where 2^n overflows
        for _ in 0..64 {
            limiter.when("default/foo");
        }
        assert_eq!(limiter.when("default/foo"), Duration::from_millis(8));
    }

    #[test]
    fn forget_resets_backoff() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        );
        limiter.when("default/foo");
        limiter.when("default/foo");

        limiter.forget("default/foo");

        assert_eq!(limiter.num_requeues("default/foo"), 0);
        assert_eq!(limiter.when("default/foo"), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_throttles() {
        let limiter = BucketRateLimiter::new(2.0, 2);

        assert_eq!(limiter.when("a"), Duration::ZERO);
        assert_eq!(limiter.when("b"), Duration::ZERO);
        assert_eq!(limiter.when("c"), Duration::from_millis(500));
        assert_eq!(limiter.when("d"), Duration::from_millis(1000));

        // Refills while time passes
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.when("e"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn max_of_takes_slowest_and_tracks_requeues() {
        let limiter = default_controller_rate_limiter(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        );

        assert_eq!(limiter.when("default/foo"), Duration::from_millis(5));
        assert_eq!(limiter.when("default/foo"), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues("default/foo"), 2);

        limiter.forget("default/foo");
        assert_eq!(limiter.num_requeues("default/foo"), 0);
    }
}
