//! Prometheus metrics for monitoring
//!
//! Counters, gauges and histograms rendered in the Prometheus text format
//! and served on `GET /metrics`.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Name and help text shared by every metric kind
struct Descriptor {
    name: &'static str,
    help: &'static str,
}

impl Descriptor {
    fn header(&self, kind: &str) -> String {
        format!(
            "# HELP {name} {help}\n# TYPE {name} {kind}\n",
            name = self.name,
            help = self.help
        )
    }
}

/// Counter metric (monotonically increasing)
pub struct Counter {
    desc: Descriptor,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Descriptor { name, help },
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut out = self.desc.header("counter");
        let _ = writeln!(out, "{} {}", self.desc.name, self.get());
        out
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    desc: Descriptor,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Descriptor { name, help },
            value: AtomicI64::new(0),
        }
    }

    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut out = self.desc.header("gauge");
        let _ = writeln!(out, "{} {}", self.desc.name, self.get());
        out
    }
}

/// Upper bounds (seconds) for chunk processing latency
const LATENCY_BOUNDS: [f64; 10] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0];

/// Histogram for latency measurements
pub struct Histogram {
    desc: Descriptor,
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    /// Sum in microseconds
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Histogram with the default latency buckets
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self::with_bounds(name, help, &LATENCY_BOUNDS)
    }

    pub fn with_bounds(name: &'static str, help: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            desc: Descriptor { name, help },
            bounds,
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Observe a value in seconds
    pub fn observe(&self, seconds: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);

        // Buckets are cumulative
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            if seconds <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let name = self.desc.name;
        let mut out = self.desc.header("histogram");

        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            let _ = writeln!(
                out,
                "{}_bucket{{le=\"{}\"}} {}",
                name,
                bound,
                bucket.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, self.count());
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let _ = writeln!(out, "{}_sum {}", name, sum);
        let _ = writeln!(out, "{}_count {}", name, self.count());
        out
    }
}

/// Standard analyzer metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static CHUNKS_ASSIGNED: Counter =
        Counter::new("loganalyzer_chunks_assigned_total", "Chunk assignments handed to workers");

    pub static CHUNKS_COMPLETED: Counter =
        Counter::new("loganalyzer_chunks_completed_total", "Chunks whose metrics were aggregated");

    pub static CHUNKS_REQUEUED: Counter =
        Counter::new("loganalyzer_chunks_requeued_total", "Chunks returned to the pending queue");

    pub static CHUNKS_FAILED: Counter =
        Counter::new("loganalyzer_chunks_failed_total", "Chunks that exhausted their retries");

    pub static STALE_REPORTS: Counter =
        Counter::new("loganalyzer_stale_reports_total", "Worker reports discarded as stale");

    pub static HEALTHY_WORKERS: Gauge =
        Gauge::new("loganalyzer_healthy_workers", "Number of healthy workers");

    pub static CHUNK_PROCESSING_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new(
            "loganalyzer_chunk_processing_duration_seconds",
            "Worker-side chunk processing latency",
        )
    });
}

/// Render every standard metric
pub fn gather_system_metrics() -> String {
    [
        standard::CHUNKS_ASSIGNED.to_prometheus(),
        standard::CHUNKS_COMPLETED.to_prometheus(),
        standard::CHUNKS_REQUEUED.to_prometheus(),
        standard::CHUNKS_FAILED.to_prometheus(),
        standard::STALE_REPORTS.to_prometheus(),
        standard::HEALTHY_WORKERS.to_prometheus(),
        standard::CHUNK_PROCESSING_DURATION.to_prometheus(),
    ]
    .concat()
}
