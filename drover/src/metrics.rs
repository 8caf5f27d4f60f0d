//! Prometheus metrics for drover.
//!
//! Compiled only with the `metrics` feature. Call sites go through
//! [`crate::telemetry`], which forwards here when the feature is enabled.
//!
//! # Metrics
//!
//! ## Counters
//! - `drover_units_fetched_total` - Units returned by backend fetches
//! - `drover_units_settled_total` - Units settled, by outcome
//! - `drover_transport_errors_total` - Failed backend calls, by operation
//! - `drover_slot_restarts_total` - Execution slots respawned after a crash
//! - `drover_units_abandoned_total` - Units abandoned by a forced shutdown
//!
//! ## Gauges
//! - `drover_handoff_depth` - Units buffered between fetching and execution
//!
//! ## Histograms
//! - `drover_perform_duration_seconds` - Job execution time
#![cfg(feature = "metrics")]

use prometheus::{
    CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, exponential_buckets,
};
use std::sync::LazyLock;

/// Global Prometheus registry for drover metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static UNITS_FETCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "drover_units_fetched_total",
        "Units returned by backend fetches",
    );
    CounterVec::new(opts, &["queue"]).expect("drover_units_fetched_total metric creation failed")
});

/// Labels: `queue`, `outcome` (completed, rejected, exhausted, abandoned).
pub static UNITS_SETTLED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("drover_units_settled_total", "Units settled, by outcome");
    CounterVec::new(opts, &["queue", "outcome"])
        .expect("drover_units_settled_total metric creation failed")
});

/// Labels: `queue`, `operation` (fetch, complete, reject, dead_letter).
pub static TRANSPORT_ERRORS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "drover_transport_errors_total",
        "Failed queue backend calls",
    );
    CounterVec::new(opts, &["queue", "operation"])
        .expect("drover_transport_errors_total metric creation failed")
});

pub static SLOT_RESTARTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "drover_slot_restarts_total",
        "Execution slots respawned after a crash",
    );
    CounterVec::new(opts, &["queue"]).expect("drover_slot_restarts_total metric creation failed")
});

pub static UNITS_ABANDONED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "drover_units_abandoned_total",
        "Units abandoned by a forced shutdown",
    );
    CounterVec::new(opts, &["queue"])
        .expect("drover_units_abandoned_total metric creation failed")
});

pub static HANDOFF_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "drover_handoff_depth",
        "Units buffered between fetching and execution",
    );
    GaugeVec::new(opts, &["queue"]).expect("drover_handoff_depth metric creation failed")
});

/// Labels: `queue`, `job`, `outcome`.
pub static PERFORM_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "drover_perform_duration_seconds",
        "Job execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["queue", "job", "outcome"])
        .expect("drover_perform_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(UNITS_FETCHED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(UNITS_SETTLED_TOTAL.clone()),
        Box::new(TRANSPORT_ERRORS_TOTAL.clone()),
        Box::new(SLOT_RESTARTS_TOTAL.clone()),
        Box::new(UNITS_ABANDONED_TOTAL.clone()),
        Box::new(HANDOFF_DEPTH.clone()),
        Box::new(PERFORM_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_fetched(queue: &str, count: usize) {
    UNITS_FETCHED_TOTAL
        .with_label_values(&[queue])
        .inc_by(count as f64);
}

pub fn record_settled(queue: &str, outcome: &str) {
    UNITS_SETTLED_TOTAL
        .with_label_values(&[queue, outcome])
        .inc();
}

pub fn record_transport_error(queue: &str, operation: &str) {
    TRANSPORT_ERRORS_TOTAL
        .with_label_values(&[queue, operation])
        .inc();
}

pub fn record_slot_restart(queue: &str) {
    SLOT_RESTARTS_TOTAL.with_label_values(&[queue]).inc();
}

pub fn record_abandoned(queue: &str, count: usize) {
    UNITS_ABANDONED_TOTAL
        .with_label_values(&[queue])
        .inc_by(count as f64);
}

pub fn set_handoff_depth(queue: &str, depth: usize) {
    HANDOFF_DEPTH.with_label_values(&[queue]).set(depth as f64);
}

pub fn observe_perform_duration(queue: &str, job: &str, outcome: &str, duration_secs: f64) {
    PERFORM_DURATION_SECONDS
        .with_label_values(&[queue, job, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
