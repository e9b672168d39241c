//! Per-IP sliding-window rate limiting.
//!
//! Each client IP gets a ring of request timestamps within the last 60
//! seconds. When the ring is full the caller receives the number of seconds
//! until the oldest entry leaves the window, suitable for a `Retry-After`
//! header. Management routes and `/health` bypass the limiter entirely.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
/// Above this many tracked IPs, stale buckets are swept on the next check.
const CLEANUP_THRESHOLD: usize = 1024;

pub struct RateLimiter {
    /// Requests allowed per window per IP; 0 disables limiting.
    limit: u32,
    buckets: DashMap<IpAddr, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        RateLimiter {
            limit,
            buckets: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.limit > 0
    }

    /// Record a request from `ip`. Returns `None` when allowed, or
    /// `Some(retry_after_secs)` when the window is full.
    pub fn check(&self, ip: IpAddr) -> Option<u64> {
        if self.limit == 0 {
            return None;
        }
        let now = Instant::now();
        let mut bucket = self.buckets.entry(ip).or_default();
        while let Some(&front) = bucket.front() {
            if now.duration_since(front) >= WINDOW {
                bucket.pop_front();
            } else {
                break;
            }
        }
        if bucket.len() >= self.limit as usize {
            let oldest = *bucket.front().expect("non-empty at limit");
            let wait = WINDOW.saturating_sub(now.duration_since(oldest));
            drop(bucket);
            self.maybe_cleanup(now);
            return Some(wait.as_secs().max(1));
        }
        bucket.push_back(now);
        drop(bucket);
        self.maybe_cleanup(now);
        None
    }

    fn maybe_cleanup(&self, now: Instant) {
        if self.buckets.len() <= CLEANUP_THRESHOLD {
            return;
        }
        self.buckets.retain(|_, times| {
            times
                .back()
                .map(|&last| now.duration_since(last) < WINDOW)
                .unwrap_or(false)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn allows_normal_traffic() {
        let limiter = RateLimiter::new(60);
        for _ in 0..10 {
            assert_eq!(limiter.check(ip(1)), None);
        }
    }

    #[test]
    fn blocks_excessive_traffic_with_retry_after() {
        let limiter = RateLimiter::new(5);
        for _ in 0..5 {
            assert_eq!(limiter.check(ip(2)), None);
        }
        let wait = limiter.check(ip(2)).expect("sixth request limited");
        assert!(wait >= 1 && wait <= 60, "retry-after out of range: {wait}");
    }

    #[test]
    fn different_ips_independent() {
        let limiter = RateLimiter::new(2);
        assert_eq!(limiter.check(ip(3)), None);
        assert_eq!(limiter.check(ip(3)), None);
        assert!(limiter.check(ip(3)).is_some());
        assert_eq!(limiter.check(ip(4)), None);
    }

    #[test]
    fn zero_limit_disables() {
        let limiter = RateLimiter::new(0);
        assert!(!limiter.enabled());
        for _ in 0..1000 {
            assert_eq!(limiter.check(ip(5)), None);
        }
    }

    #[test]
    fn limited_request_not_counted() {
        let limiter = RateLimiter::new(3);
        for _ in 0..3 {
            assert_eq!(limiter.check(ip(6)), None);
        }
        // Rejected attempts must not extend the window.
        for _ in 0..10 {
            assert!(limiter.check(ip(6)).is_some());
        }
        let bucket = limiter.buckets.get(&ip(6)).unwrap();
        assert_eq!(bucket.len(), 3);
    }
}
