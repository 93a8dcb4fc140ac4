//! Metrics collection
//!
//! Prometheus-compatible counters for the replication engine plus
//! per-endpoint request latency histograms. Every failure class from the
//! error taxonomy that never reaches a client (async degraded, partial
//! reconciliation) is only observable here and in the logs.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// Fixed-bucket latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: &'static [f64],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: (0..=LATENCY_BUCKETS.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: &LATENCY_BUCKETS,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value_ms: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value_ms <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value_ms * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(le, count)` pairs, ending with `+Inf`
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0u64;
        let mut out = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            running += bucket.load(Ordering::Relaxed);
            let le = self.boundaries.get(i).copied().unwrap_or(f64::INFINITY);
            out.push((le, running));
        }
        out
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests_total: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

/// Counters for the write path, async channel and reconcilers
#[derive(Debug, Default)]
pub struct ReplicationMetrics {
    pub writes_accepted: Counter,
    pub writes_rejected: Counter,
    pub writes_rolled_back: Counter,
    pub sync_attempts: Counter,
    pub sync_failures: Counter,
    pub replicate_received: Counter,

    pub async_enqueued: Counter,
    pub async_enqueue_failed: Counter,
    pub async_delivered: Counter,
    pub async_dropped: Counter,
    pub async_applied: Counter,
    pub async_filtered: Counter,
    pub async_pending: Gauge,

    pub membership_applied: Counter,
    pub membership_stale: Counter,
    pub reconcile_passes: Counter,
    pub failover_promotions: Counter,
    pub failover_repairs: Counter,
    pub failover_degraded: Counter,
    pub failover_dropped: Counter,
    pub recovery_repairs: Counter,

    pub local_keys: Gauge,
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    endpoints: Mutex<HashMap<String, Arc<EndpointMetrics>>>,
    pub total_requests: Counter,
    pub total_errors: Counter,
    pub replication: ReplicationMetrics,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            total_requests: Counter::new(),
            total_errors: Counter::new(),
            replication: ReplicationMetrics::default(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for an endpoint
    pub fn endpoint(&self, path: &str) -> Arc<EndpointMetrics> {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
        endpoints.entry(path.to_string()).or_default().clone()
    }

    pub fn record_request(&self, path: &str, duration: Duration, success: bool) {
        let endpoint = self.endpoint(path);
        endpoint.requests_total.inc();
        endpoint.latency.observe(duration.as_secs_f64() * 1000.0);
        self.total_requests.inc();
        if !success {
            endpoint.requests_error.inc();
            self.total_errors.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let r = &self.replication;

        let scalars: [(&str, &str, &str, u64); 25] = [
            ("requests_total", "counter", "Total HTTP requests", self.total_requests.get()),
            ("errors_total", "counter", "Total HTTP errors", self.total_errors.get()),
            ("uptime_seconds", "gauge", "Process uptime", self.uptime_seconds()),
            ("writes_accepted_total", "counter", "Client writes acknowledged", r.writes_accepted.get()),
            ("writes_rejected_total", "counter", "Client writes rejected", r.writes_rejected.get()),
            ("writes_rolled_back_total", "counter", "Tentative writes rolled back", r.writes_rolled_back.get()),
            ("sync_attempts_total", "counter", "Synchronous replicate calls", r.sync_attempts.get()),
            ("sync_failures_total", "counter", "Failed synchronous replicate calls", r.sync_failures.get()),
            ("replicate_received_total", "counter", "Replicate requests stored", r.replicate_received.get()),
            ("async_enqueued_total", "counter", "Async payloads enqueued", r.async_enqueued.get()),
            ("async_enqueue_failed_total", "counter", "Async enqueue failures", r.async_enqueue_failed.get()),
            ("async_delivered_total", "counter", "Async payloads delivered", r.async_delivered.get()),
            ("async_dropped_total", "counter", "Async payloads given up on", r.async_dropped.get()),
            ("async_applied_total", "counter", "Async payloads applied locally", r.async_applied.get()),
            ("async_filtered_total", "counter", "Async payloads addressed elsewhere", r.async_filtered.get()),
            ("async_pending", "gauge", "Async payloads awaiting delivery", r.async_pending.get()),
            ("membership_applied_total", "counter", "Membership snapshots applied", r.membership_applied.get()),
            ("membership_stale_total", "counter", "Stale membership snapshots discarded", r.membership_stale.get()),
            ("reconcile_passes_total", "counter", "Reconciliation passes run", r.reconcile_passes.get()),
            ("failover_promotions_total", "counter", "Local promotions to primary", r.failover_promotions.get()),
            ("failover_repairs_total", "counter", "Replica slots repaired by failover", r.failover_repairs.get()),
            ("failover_degraded_total", "counter", "Keys left with a null replica slot", r.failover_degraded.get()),
            ("failover_dropped_total", "counter", "Keys dropped by failover", r.failover_dropped.get()),
            ("recovery_repairs_total", "counter", "Replica slots repaired by recovery", r.recovery_repairs.get()),
            ("local_keys", "gauge", "Key records held by this node", r.local_keys.get()),
        ];

        for (name, kind, help, value) in scalars {
            let _ = writeln!(out, "# HELP replikv_{} {}", name, help);
            let _ = writeln!(out, "# TYPE replikv_{} {}", name, kind);
            let _ = writeln!(out, "replikv_{} {}", name, value);
        }

        let endpoints = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());

        out.push_str("# HELP replikv_request_duration_ms Request duration in milliseconds\n");
        out.push_str("# TYPE replikv_request_duration_ms histogram\n");
        for (path, metrics) in endpoints.iter() {
            for (le, count) in metrics.latency.cumulative() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "replikv_request_duration_ms_bucket{{path=\"{}\",le=\"{}\"}} {}",
                    path, le, count
                );
            }
            let _ = writeln!(
                out,
                "replikv_request_duration_ms_sum{{path=\"{}\"}} {}",
                path,
                metrics.latency.sum()
            );
            let _ = writeln!(
                out,
                "replikv_request_duration_ms_count{{path=\"{}\"}} {}",
                path,
                metrics.latency.count()
            );
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
