//! Local rate limiting (stage 5 of the pipeline).
//!
//! Two primitives, both in process-local shared memory so the hot path never
//! yields:
//!
//! - a token bucket per key for `rate_per_second` rules, refilled
//!   continuously and capped at the burst size;
//! - a fixed 60-second window counter per key for `rate_per_minute` rules.
//!
//! The fixed window is intentionally approximate: a burst straddling the
//! window edge can pass up to twice the limit. Cross-instance fairness comes
//! from the control plane's enforcement directives, not from this layer.
//!
//! **Security**: tracked keys are capped to prevent OOM from spoofed IPs.

use dashmap::DashMap;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

#[derive(Debug, Clone)]
struct FixedWindow {
    count: u32,
    window_start: Instant,
    last_access: Instant,
}

/// In-process rate limiter shared by all request tasks.
pub struct LocalRateLimiter {
    buckets: Arc<DashMap<String, TokenBucket>>,
    windows: Arc<DashMap<String, FixedWindow>>,
    entry_ttl: Duration,
    max_entries: usize,
}

impl Default for LocalRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRateLimiter {
    const DEFAULT_MAX_ENTRIES: usize = 100_000;
    const WINDOW: Duration = Duration::from_secs(60);

    #[must_use]
    pub fn new() -> Self {
        Self::with_max_entries(Self::DEFAULT_MAX_ENTRIES)
    }

    #[must_use]
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            windows: Arc::new(DashMap::new()),
            entry_ttl: Duration::from_secs(300),
            max_entries,
        }
    }

    /// Spawns a periodic task evicting entries idle longer than the TTL.
    pub fn start_cleanup_task(&self) {
        let buckets = self.buckets.clone();
        let windows = self.windows.clone();
        let entry_ttl = self.entry_ttl;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(entry_ttl);
            loop {
                interval.tick().await;
                let now = Instant::now();
                buckets.retain(|_, b| now.duration_since(b.last_access) < entry_ttl);
                windows.retain(|_, w| now.duration_since(w.last_access) < entry_ttl);
            }
        });
    }

    /// Token-bucket check for a `rate_per_second` rule.
    ///
    /// Returns `true` when the request is admitted. A `rate` of zero always
    /// denies (callers skip the check instead). New keys at capacity are
    /// denied to bound memory.
    #[must_use]
    pub fn check_per_second(&self, key: &str, rate: u32, burst: u32) -> bool {
        let now = Instant::now();

        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return Self::take_token(&mut bucket, now, rate, burst);
        }

        if self.buckets.len() >= self.max_entries {
            return false;
        }

        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| TokenBucket {
            tokens: f64::from(burst),
            last_refill: now,
            last_access: now,
        });
        Self::take_token(&mut bucket, now, rate, burst)
    }

    fn take_token(bucket: &mut TokenBucket, now: Instant, rate: u32, burst: u32) -> bool {
        bucket.last_access = now;

        let elapsed = now.duration_since(bucket.last_refill);
        let refill = (elapsed.as_secs_f64() * f64::from(rate)).min(f64::from(burst));
        if refill > 0.0 {
            bucket.tokens = (bucket.tokens + refill).min(f64::from(burst));
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Fixed-window check for a `rate_per_minute` rule.
    ///
    /// The first observation in a window seeds the count to one; subsequent
    /// requests are admitted while the count stays below `limit`.
    #[must_use]
    pub fn check_per_minute(&self, key: &str, limit: u32) -> bool {
        let now = Instant::now();

        if let Some(mut window) = self.windows.get_mut(key) {
            window.last_access = now;
            if now.duration_since(window.window_start) >= Self::WINDOW {
                window.window_start = now;
                window.count = 1;
                return limit >= 1;
            }
            if window.count >= limit {
                return false;
            }
            window.count += 1;
            return true;
        }

        if self.windows.len() >= self.max_entries {
            return false;
        }

        self.windows
            .entry(key.to_string())
            .or_insert_with(|| FixedWindow { count: 1, window_start: now, last_access: now });
        limit >= 1
    }

    /// Evicts idle entries immediately, returning how many were removed.
    #[must_use]
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len() + self.windows.len();
        self.buckets.retain(|_, b| now.duration_since(b.last_access) < self.entry_ttl);
        self.windows.retain(|_, w| now.duration_since(w.last_access) < self.entry_ttl);
        before - (self.buckets.len() + self.windows.len())
    }

    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len() + self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_burst_then_deny() {
        let limiter = LocalRateLimiter::new();
        for _ in 0..10 {
            assert!(limiter.check_per_second("ip:1.2.3.4", 10, 10));
        }
        assert!(!limiter.check_per_second("ip:1.2.3.4", 10, 10));
    }

    #[tokio::test]
    async fn test_bucket_refills_over_time() {
        let limiter = LocalRateLimiter::new();
        assert!(limiter.check_per_second("k", 2, 1));
        assert!(!limiter.check_per_second("k", 2, 1));

        // 750ms at 2 tokens/sec refills 1.5 tokens, capped at burst 1.
        sleep(Duration::from_millis(750)).await;
        assert!(limiter.check_per_second("k", 2, 1));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = LocalRateLimiter::new();
        assert!(limiter.check_per_second("a", 1, 1));
        assert!(limiter.check_per_second("b", 1, 1));
        assert!(!limiter.check_per_second("a", 1, 1));
        assert!(!limiter.check_per_second("b", 1, 1));
    }

    #[tokio::test]
    async fn test_zero_burst_always_denies() {
        let limiter = LocalRateLimiter::new();
        assert!(!limiter.check_per_second("k", 0, 0));
    }

    #[tokio::test]
    async fn test_per_minute_window() {
        let limiter = LocalRateLimiter::new();
        assert!(limiter.check_per_minute("k", 3));
        assert!(limiter.check_per_minute("k", 3));
        assert!(limiter.check_per_minute("k", 3));
        assert!(!limiter.check_per_minute("k", 3));
        assert!(!limiter.check_per_minute("k", 3));
    }

    #[tokio::test]
    async fn test_per_minute_zero_limit() {
        let limiter = LocalRateLimiter::new();
        assert!(!limiter.check_per_minute("k", 0));
    }

    #[tokio::test]
    async fn test_max_entries_denies_new_keys() {
        let limiter = LocalRateLimiter::with_max_entries(2);
        assert!(limiter.check_per_second("a", 10, 10));
        assert!(limiter.check_per_second("b", 10, 10));
        assert!(!limiter.check_per_second("c", 10, 10));
        // Existing keys keep working at capacity.
        assert!(limiter.check_per_second("a", 10, 10));
    }

    #[tokio::test]
    async fn test_cleanup_retains_recent_entries() {
        let limiter = LocalRateLimiter::new();
        let _ = limiter.check_per_second("a", 10, 10);
        let _ = limiter.check_per_minute("b", 10);
        assert_eq!(limiter.tracked_keys(), 2);
        assert_eq!(limiter.cleanup(), 0);
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_bounded_by_burst() {
        let limiter = Arc::new(LocalRateLimiter::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let mut admitted = 0u32;
                for _ in 0..5 {
                    if limiter.check_per_second("shared", 10, 10) {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert!(total <= 10, "admitted {total} requests past a burst of 10");
    }
}
