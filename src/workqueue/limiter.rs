//! Retry delays for queue items
//!
//! The delay of an item is the larger of its own exponential backoff and the
//! wait imposed by a bucket shared by all items. Every call reserves a slot in
//! the bucket, so a burst of failures is spread out at the bucket's rate
//! instead of retrying together.

use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use governor::Quota;
use tokio::time::Instant;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(100);
pub const DEFAULT_QPS: u32 = 10;
pub const DEFAULT_BURST: u32 = 100;

/// Shared token bucket handing out reservations
///
/// `next_free` is the theoretical arrival time of the next slot; a caller
/// waits for whatever part of it lies beyond the burst allowance.
struct Bucket {
    interval: Duration,
    tolerance: Duration,
    next_free: Mutex<Option<Instant>>,
}

impl Bucket {
    fn new(quota: Quota) -> Self {
        let interval = quota.replenish_interval();
        Self {
            interval,
            tolerance: interval.saturating_mul(quota.burst_size().get()),
            next_free: Mutex::new(None),
        }
    }

    /// Claim the next slot and return how long to wait for it
    fn reserve(&self, now: Instant) -> Duration {
        let mut next_free = self
            .next_free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let start = match *next_free {
            Some(at) if at > now => at,
            _ => now,
        };
        let claimed = start + self.interval;
        *next_free = Some(claimed);
        (claimed - now).saturating_sub(self.tolerance)
    }
}

pub struct ItemRateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    failures: DashMap<String, u32>,
    bucket: Bucket,
}

impl Default for ItemRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_QPS, DEFAULT_BURST)
    }
}

impl ItemRateLimiter {
    pub fn new(base_delay: Duration, max_delay: Duration, qps: u32, burst: u32) -> Self {
        let qps = NonZeroU32::new(qps.max(1)).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            base_delay,
            max_delay,
            failures: DashMap::new(),
            bucket: Bucket::new(Quota::per_second(qps).allow_burst(burst)),
        }
    }

    /// Delay before `key` may be retried; every call counts as one more failure
    pub fn when(&self, key: &str) -> Duration {
        let attempt = {
            let mut count = self.failures.entry(key.to_string()).or_insert(0);
            let attempt = *count;
            *count = count.saturating_add(1);
            attempt
        };
        self.backoff(attempt).max(self.bucket.reserve(Instant::now()))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        // 2^31 * 50ms is far past any sane ceiling
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Number of failures recorded for `key`
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Reset the backoff of `key`
    pub fn forget(&self, key: &str) {
        self.failures.remove(key);
    }
}
