//! Per-client token-bucket rate limiting.
//!
//! One bucket per client fingerprint (Client-ID if present, else peer IP),
//! held in a shared map behind a single mutex. Buckets refill lazily on
//! every [`RateLimiter::allow`] call rather than via a background timer, so
//! there is no task to schedule and no lock held outside a single method
//! call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Governs refill rate, burst capacity, and block duration for one or more
/// buckets. Cheap to clone; installing an override does not reset or
/// resize an already-allocated bucket's current token count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitPolicy {
    pub refill_rate_per_sec: f64,
    pub burst_capacity: u32,
    pub block_duration: Duration,
}

impl RateLimitPolicy {
    #[must_use]
    pub fn new(refill_rate_per_sec: f64, burst_capacity: u32, block_duration: Duration) -> Self {
        Self {
            refill_rate_per_sec,
            burst_capacity,
            block_duration,
        }
    }
}

/// Per-client bucket state.
#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Option<Instant>,
    is_blocked: bool,
    blocked_until: Instant,
}

impl TokenBucket {
    fn new() -> Self {
        Self {
            tokens: 0.0,
            last_refill: None,
            is_blocked: false,
            blocked_until: Instant::now(),
        }
    }

    /// Refills, checks the block state, and consumes a token in that
    /// order. Returns whether the call is allowed.
    fn allow(&mut self, policy: &RateLimitPolicy, now: Instant) -> bool {
        match self.last_refill {
            None => {
                self.tokens = f64::from(policy.burst_capacity);
                self.last_refill = Some(now);
            }
            Some(last) => {
                let elapsed = now.saturating_duration_since(last).as_secs_f64();
                let refilled = self.tokens + elapsed * policy.refill_rate_per_sec;
                self.tokens = refilled.min(f64::from(policy.burst_capacity));
                self.last_refill = Some(now);
            }
        }

        if self.is_blocked {
            if now < self.blocked_until {
                return false;
            }
            self.is_blocked = false;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            if !policy.block_duration.is_zero() {
                self.is_blocked = true;
                self.blocked_until = now + policy.block_duration;
            }
            false
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        match self.last_refill {
            Some(last) => now.saturating_duration_since(last) > ttl,
            None => false,
        }
    }

    fn is_actively_blocked(&self, now: Instant) -> bool {
        self.is_blocked && now < self.blocked_until
    }
}

/// Snapshot of rate limiter counters, returned by [`RateLimiter::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub total_buckets: usize,
    pub blocked_buckets: usize,
    pub allowed_count: u64,
    pub blocked_count: u64,
}

const BUCKET_TTL: Duration = Duration::from_secs(60 * 60);

/// Shared, thread-safe token-bucket rate limiter.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    overrides: Mutex<HashMap<String, RateLimitPolicy>>,
    default_policy: RateLimitPolicy,
    allowed_count: AtomicU64,
    blocked_count: AtomicU64,
}

impl RateLimiter {
    #[must_use]
    pub fn new(default_policy: RateLimitPolicy) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
            default_policy,
            allowed_count: AtomicU64::new(0),
            blocked_count: AtomicU64::new(0),
        }
    }

    /// Returns whether one data unit from this client may pass. The
    /// fingerprint is `client_id` when non-empty, else `ip`.
    pub fn allow(&self, ip: &str, client_id: &str) -> bool {
        self.allow_at(ip, client_id, Instant::now())
    }

    fn allow_at(&self, ip: &str, client_id: &str, now: Instant) -> bool {
        let fingerprint = if client_id.is_empty() { ip } else { client_id };

        let policy = if client_id.is_empty() {
            self.default_policy
        } else {
            self.overrides
                .lock()
                .expect("overrides mutex poisoned")
                .get(client_id)
                .copied()
                .unwrap_or(self.default_policy)
        };

        let allowed = {
            let mut buckets = self.buckets.lock().expect("buckets mutex poisoned");
            let bucket = buckets
                .entry(fingerprint.to_string())
                .or_insert_with(TokenBucket::new);
            bucket.allow(&policy, now)
        };

        if allowed {
            self.allowed_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.blocked_count.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    /// Installs or replaces a per-client policy override. Does not touch
    /// any existing bucket.
    pub fn set_client_policy(&self, client_id: &str, policy: RateLimitPolicy) {
        self.overrides
            .lock()
            .expect("overrides mutex poisoned")
            .insert(client_id.to_string(), policy);
    }

    /// Removes buckets that have not been touched in over an hour.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("buckets mutex poisoned");
        buckets.retain(|_, bucket| !bucket.is_expired(now, BUCKET_TTL));
    }

    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let buckets = self.buckets.lock().expect("buckets mutex poisoned");
        let blocked_buckets = buckets
            .values()
            .filter(|bucket| bucket.is_actively_blocked(now))
            .count();
        RateLimiterStats {
            total_buckets: buckets.len(),
            blocked_buckets,
            allowed_count: self.allowed_count.load(Ordering::Relaxed),
            blocked_count: self.blocked_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RateLimitPolicy {
        RateLimitPolicy::new(2.0, 3, Duration::from_secs(1))
    }

    #[test]
    fn burst_capacity_allows_then_denies() {
        let limiter = RateLimiter::new(policy());
        let now = Instant::now();

        assert!(limiter.allow_at("1.1.1.1", "c", now));
        assert!(limiter.allow_at("1.1.1.1", "c", now));
        assert!(limiter.allow_at("1.1.1.1", "c", now));
        assert!(
            !limiter.allow_at("1.1.1.1", "c", now),
            "fourth call in the same instant must be denied"
        );

        let stats = limiter.stats();
        assert_eq!(stats.allowed_count, 3);
        assert_eq!(stats.blocked_count, 1);
    }

    #[test]
    fn block_window_is_honored_then_expires() {
        let limiter = RateLimiter::new(policy());
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(limiter.allow_at("1.1.1.1", "c", t0));
        }
        assert!(!limiter.allow_at("1.1.1.1", "c", t0));

        // Still within the 1s block window.
        let t_mid = t0 + Duration::from_millis(500);
        assert!(!limiter.allow_at("1.1.1.1", "c", t_mid));

        // Block window has elapsed; refill (1.1s * 2/s > 1 token) admits.
        let t_after = t0 + Duration::from_millis(1100);
        assert!(limiter.allow_at("1.1.1.1", "c", t_after));
    }

    #[test]
    fn distinct_fingerprints_do_not_interfere() {
        let limiter = RateLimiter::new(policy());
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.allow_at("1.1.1.1", "a", now));
            assert!(limiter.allow_at("2.2.2.2", "b", now));
        }
        assert_eq!(limiter.stats().allowed_count, 6);
        assert_eq!(limiter.stats().total_buckets, 2);
    }

    #[test]
    fn empty_client_id_falls_back_to_ip_fingerprint() {
        let limiter = RateLimiter::new(policy());
        let now = Instant::now();

        limiter.allow_at("9.9.9.9", "", now);
        limiter.allow_at("9.9.9.9", "", now);
        assert_eq!(limiter.stats().total_buckets, 1);
    }

    #[test]
    fn zero_block_duration_never_blocks() {
        let never_blocks = RateLimitPolicy::new(0.0, 1, Duration::ZERO);
        let limiter = RateLimiter::new(never_blocks);
        let now = Instant::now();

        assert!(limiter.allow_at("1.1.1.1", "c", now));
        assert!(!limiter.allow_at("1.1.1.1", "c", now));
        assert!(!limiter.allow_at("1.1.1.1", "c", now + Duration::from_millis(1)));

        let stats = limiter.stats();
        assert_eq!(stats.blocked_buckets, 0, "no block state without a block duration");
    }

    #[test]
    fn per_client_override_applies_to_future_refills() {
        let limiter = RateLimiter::new(policy());
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.allow_at("1.1.1.1", "c", now));
        }
        assert!(!limiter.allow_at("1.1.1.1", "c", now));

        limiter.set_client_policy("c", RateLimitPolicy::new(2.0, 5, Duration::from_secs(1)));

        let t_after = now + Duration::from_millis(1100);
        assert!(limiter.allow_at("1.1.1.1", "c", t_after));
    }

    #[test]
    fn cleanup_expired_is_idempotent_and_removes_stale_buckets() {
        let limiter = RateLimiter::new(policy());
        let now = Instant::now();
        limiter.allow_at("1.1.1.1", "c", now);
        assert_eq!(limiter.stats().total_buckets, 1);

        {
            let mut buckets = limiter.buckets.lock().unwrap();
            for bucket in buckets.values_mut() {
                bucket.last_refill = Some(now - Duration::from_secs(3600 + 1));
            }
        }

        limiter.cleanup_expired();
        assert_eq!(limiter.stats().total_buckets, 0);
        limiter.cleanup_expired();
        assert_eq!(limiter.stats().total_buckets, 0);
    }

    #[test]
    fn tokens_never_exceed_burst_capacity() {
        let limiter = RateLimiter::new(policy());
        let now = Instant::now();
        limiter.allow_at("1.1.1.1", "c", now);

        let far_future = now + Duration::from_secs(3600);
        limiter.allow_at("1.1.1.1", "c", far_future);

        let buckets = limiter.buckets.lock().unwrap();
        let bucket = buckets.get("c").unwrap();
        assert!(bucket.tokens <= 3.0);
    }
}
