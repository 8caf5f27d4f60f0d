//! Tracing spans, subscriber setup and metric recording helpers.
//!
//! Every `record_*` helper logs through `tracing` and, with the `metrics`
//! feature enabled, also updates the matching Prometheus series in
//! [`crate::metrics`]. Without the feature they only log.
//!
//! # Example
//!
//! ```ignore
//! use drover::telemetry::{perform_span, PerformTimer};
//!
//! let span = perform_span("mailer", "m-1", "Welcome", 1);
//! let _enter = span.enter();
//! let timer = PerformTimer::start();
//! // ... job execution
//! timer.finish("mailer", "Welcome", "completed");
//! ```

use std::time::{Duration, Instant};

use tracing::{Span, info_span};
use tracing_subscriber::EnvFilter;

use crate::config::Configuration;
use crate::runtime::SlotInfo;

/// Span around one fetch call.
#[must_use]
pub fn fetch_span(queue: impl AsRef<str>, batch_size: usize) -> Span {
    info_span!(
        "drover.fetch",
        queue = %queue.as_ref(),
        batch_size = batch_size,
    )
}

/// Span around one unit's execution.
#[must_use]
pub fn perform_span(
    queue: impl AsRef<str>,
    message_id: impl AsRef<str>,
    job: impl AsRef<str>,
    attempt: u32,
) -> Span {
    info_span!(
        "drover.perform",
        queue = %queue.as_ref(),
        message_id = %message_id.as_ref(),
        job = %job.as_ref(),
        attempt = attempt,
    )
}

/// Span around a complete / reject / dead-letter call.
#[must_use]
pub fn settle_span(
    queue: impl AsRef<str>,
    message_id: impl AsRef<str>,
    outcome: impl AsRef<str>,
) -> Span {
    info_span!(
        "drover.settle",
        queue = %queue.as_ref(),
        message_id = %message_id.as_ref(),
        outcome = %outcome.as_ref(),
    )
}

/// Span covering the lifetime of an execution slot.
#[must_use]
pub fn slot_span(slot: &SlotInfo) -> Span {
    info_span!(
        "drover.slot",
        queue = %slot.queue_name,
        slot = slot.index,
        generation = slot.generation,
    )
}

/// Install a stderr `fmt` subscriber filtered at `config.log_level`.
///
/// `RUST_LOG`, when set, replaces the configured level. Stdout is left alone
/// because forked children use it to report back to the parent. Returns
/// `false` if a global subscriber was already installed.
pub fn init_tracing(config: &Configuration) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .is_ok();

    if !installed {
        tracing::debug!("global tracing subscriber already initialized");
    }
    installed
}

pub fn record_fetched(queue: impl AsRef<str>, count: usize) {
    tracing::debug!(queue = %queue.as_ref(), count = count, "units fetched");

    #[cfg(feature = "metrics")]
    crate::metrics::record_fetched(queue.as_ref(), count);
}

/// Record a settled unit. `outcome` is the unit's final state.
pub fn record_settled(
    queue: impl AsRef<str>,
    message_id: impl AsRef<str>,
    outcome: impl AsRef<str>,
) {
    tracing::info!(
        queue = %queue.as_ref(),
        message_id = %message_id.as_ref(),
        outcome = %outcome.as_ref(),
        "unit settled"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_settled(queue.as_ref(), outcome.as_ref());
}

pub fn record_transport_error(
    queue: impl AsRef<str>,
    operation: impl AsRef<str>,
    err: &dyn std::error::Error,
) {
    tracing::warn!(
        queue = %queue.as_ref(),
        operation = %operation.as_ref(),
        "transport error: {err}"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_transport_error(queue.as_ref(), operation.as_ref());
}

pub fn record_slot_crash(slot: &SlotInfo, reason: impl AsRef<str>) {
    tracing::error!(
        queue = %slot.queue_name,
        slot = slot.index,
        generation = slot.generation,
        "execution slot crashed, respawning: {}",
        reason.as_ref()
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_slot_restart(&slot.queue_name);
}

pub fn record_abandoned(queue: impl AsRef<str>, count: usize) {
    if count == 0 {
        return;
    }
    tracing::warn!(
        queue = %queue.as_ref(),
        count = count,
        "units abandoned by forced shutdown"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_abandoned(queue.as_ref(), count);
}

pub fn set_handoff_depth(queue: impl AsRef<str>, depth: usize) {
    tracing::trace!(queue = %queue.as_ref(), depth = depth, "hand-off depth");

    #[cfg(feature = "metrics")]
    crate::metrics::set_handoff_depth(queue.as_ref(), depth);
}

/// Measures one job execution.
#[derive(Debug)]
pub struct PerformTimer {
    start: Instant,
}

impl PerformTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Log (and, with `metrics`, observe) the elapsed time.
    pub fn finish(self, queue: impl AsRef<str>, job: impl AsRef<str>, outcome: impl AsRef<str>) {
        let duration_secs = self.elapsed().as_secs_f64();
        tracing::debug!(
            queue = %queue.as_ref(),
            job = %job.as_ref(),
            outcome = %outcome.as_ref(),
            duration_secs = duration_secs,
            "perform finished"
        );

        #[cfg(feature = "metrics")]
        crate::metrics::observe_perform_duration(
            queue.as_ref(),
            job.as_ref(),
            outcome.as_ref(),
            duration_secs,
        );
    }
}
