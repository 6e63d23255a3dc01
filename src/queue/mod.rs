//! Rate-limited work queue feeding the worker pool
//!
//! Event handlers add keys, workers take them one at a time, and failures
//! are requeued with a per-key backoff.

mod rate_limiter;
mod work_queue;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};
pub use work_queue::WorkQueue;
