//! Request metrics: per-route counters and a rolling latency histogram.
//!
//! Cheap enough to record on every request; snapshots are served on
//! `/manage/stats`.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket upper bounds in milliseconds; the last bucket is open.
const BUCKET_BOUNDS_MS: [u64; 8] = [10, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Default)]
struct RouteCounters {
    count: AtomicU64,
    errors: AtomicU64,
    latency_us_sum: AtomicU64,
}

pub struct Metrics {
    started: Instant,
    routes: DashMap<String, RouteCounters>,
    rate_limited: AtomicU64,
    buckets: [AtomicU64; 9],
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            started: Instant::now(),
            routes: DashMap::new(),
            rate_limited: AtomicU64::new(0),
            buckets: Default::default(),
        }
    }

    pub fn record(&self, route: &str, latency: Duration, error: bool) {
        let counters = self.routes.entry(route.to_string()).or_default();
        counters.count.fetch_add(1, Ordering::Relaxed);
        counters
            .latency_us_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        if error {
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        drop(counters);

        let ms = latency.as_millis() as u64;
        let idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut endpoints = std::collections::BTreeMap::new();
        let mut total = 0u64;
        let mut errors = 0u64;
        for entry in self.routes.iter() {
            let count = entry.count.load(Ordering::Relaxed);
            let errs = entry.errors.load(Ordering::Relaxed);
            let sum_us = entry.latency_us_sum.load(Ordering::Relaxed);
            total += count;
            errors += errs;
            endpoints.insert(
                entry.key().clone(),
                EndpointStats {
                    count,
                    errors: errs,
                    avg_latency_ms: if count > 0 {
                        (sum_us as f64 / count as f64) / 1000.0
                    } else {
                        0.0
                    },
                },
            );
        }
        let mut latency_buckets = Vec::with_capacity(9);
        for (i, bucket) in self.buckets.iter().enumerate() {
            let label = if i < BUCKET_BOUNDS_MS.len() {
                format!("<={}ms", BUCKET_BOUNDS_MS[i])
            } else {
                format!(">{}ms", BUCKET_BOUNDS_MS[BUCKET_BOUNDS_MS.len() - 1])
            };
            latency_buckets.push(BucketStat {
                le: label,
                count: bucket.load(Ordering::Relaxed),
            });
        }
        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs(),
            total_requests: total,
            errors,
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            endpoints,
            latency_buckets,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
pub struct EndpointStats {
    pub count: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
}

#[derive(Serialize)]
pub struct BucketStat {
    pub le: String,
    pub count: u64,
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub errors: u64,
    pub rate_limited: u64,
    pub endpoints: std::collections::BTreeMap<String, EndpointStats>,
    pub latency_buckets: Vec<BucketStat>,
}
