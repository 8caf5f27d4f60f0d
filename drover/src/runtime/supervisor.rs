use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::WorkerStrategyKind;
use crate::error::DroverError;
use crate::telemetry;
use crate::unit_of_work::MessageId;

/// How long slots get to report abandoned units after a forced shutdown
/// before they are aborted.
pub const FORCE_GRACE: Duration = Duration::from_secs(1);

/// Token for signaling shutdown to consumer loops and execution slots.
///
/// Cancelling asks for a graceful stop: no new fetches, no new units.
/// Forcing additionally tells in-flight work to stop waiting and abandon.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug, Default)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    forced: AtomicBool,
    cancel_notify: Notify,
    force_notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal graceful cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.cancel_notify.notify_waiters();
    }

    /// Signal forced shutdown. Implies [`cancel`](Self::cancel).
    pub fn force(&self) {
        self.inner.forced.store(true, Ordering::SeqCst);
        self.cancel();
        self.inner.force_notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_forced(&self) -> bool {
        self.inner.forced.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.cancel_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Wait until forced.
    pub async fn forced(&self) {
        let notified = self.inner.force_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_forced() {
            return;
        }
        notified.await;
    }
}

/// Identity of one execution slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlotInfo {
    pub queue_name: String,
    /// Position in the pool, `0..num_workers`.
    pub index: usize,
    /// Incremented each time the slot is respawned after a crash.
    pub generation: u64,
    pub strategy: WorkerStrategyKind,
}

impl SlotInfo {
    pub fn new(queue_name: impl Into<String>, index: usize, strategy: WorkerStrategyKind) -> Self {
        Self {
            queue_name: queue_name.into(),
            index,
            generation: 0,
            strategy,
        }
    }

    /// The same slot, respawned.
    pub fn next_generation(&self) -> Self {
        Self {
            generation: self.generation + 1,
            ..self.clone()
        }
    }
}

impl fmt::Display for SlotInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}.{}",
            self.queue_name, self.index, self.generation
        )
    }
}

/// Why an execution slot stopped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SlotExit {
    /// The hand-off queue closed and nothing was left to take.
    Drained,
    /// Shutdown was requested and the slot finished its in-flight work.
    Stopped,
    /// The slot died unexpectedly and should be respawned.
    Crashed { reason: String },
    /// Forced shutdown left these units neither completed nor rejected.
    Abandoned { units: Vec<MessageId> },
}

/// Outcome of stopping one or more worker strategies.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShutdownReport {
    /// Units that were in flight when shutdown was forced.
    pub abandoned: Vec<MessageId>,
    /// Slots that had to be aborted without reporting.
    pub aborted_slots: usize,
    /// Slot crashes observed over the strategy's lifetime.
    pub slot_crashes: usize,
    /// Buffered units handed back to the backend with `reject`.
    pub returned: usize,
    /// Whether the graceful drain hit `shutdown_timeout`.
    pub timed_out: bool,
}

impl ShutdownReport {
    pub fn merge(&mut self, other: ShutdownReport) {
        self.abandoned.extend(other.abandoned);
        self.aborted_slots += other.aborted_slots;
        self.slot_crashes += other.slot_crashes;
        self.returned += other.returned;
        self.timed_out |= other.timed_out;
    }

    /// True when nothing was abandoned.
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty() && self.aborted_slots == 0
    }

    /// Process exit status: non-zero only if a forced shutdown abandoned work.
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() { 0 } else { 1 }
    }

    /// The abandonment as an error, for callers that want one.
    pub fn as_error(&self) -> Option<DroverError> {
        (!self.is_clean()).then(|| DroverError::ShutdownTimeout {
            abandoned: self.abandoned.len() + self.aborted_slots,
        })
    }
}

/// Keeps `num_workers` execution slots alive for one queue.
///
/// Crashed slots (a panic, or [`SlotExit::Crashed`]) are logged and respawned
/// with the next generation until shutdown is requested. Once cancelled, the
/// pool waits up to `shutdown_timeout` for slots to stop, forces the token,
/// gives slots [`FORCE_GRACE`] to report what they abandoned, then aborts
/// whatever is left.
#[derive(Clone, Debug)]
pub struct SlotPool {
    pub queue_name: String,
    pub strategy: WorkerStrategyKind,
    pub num_workers: usize,
    pub shutdown_timeout: Duration,
    pub force_grace: Duration,
}

impl SlotPool {
    pub fn new(
        queue_name: impl Into<String>,
        strategy: WorkerStrategyKind,
        num_workers: usize,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            strategy,
            num_workers: num_workers.max(1),
            shutdown_timeout,
            force_grace: FORCE_GRACE,
        }
    }

    /// Run slots built by `spawn_slot` until they all exit.
    pub async fn supervise<F, Fut>(&self, shutdown: &ShutdownToken, spawn_slot: F) -> ShutdownReport
    where
        F: Fn(SlotInfo) -> Fut,
        Fut: Future<Output = SlotExit> + Send + 'static,
    {
        let mut slots = JoinSet::new();
        for index in 0..self.num_workers {
            let slot = SlotInfo::new(self.queue_name.as_str(), index, self.strategy);
            Self::spawn(&mut slots, slot, &spawn_slot);
        }

        let mut report = ShutdownReport::default();
        let mut drain_deadline: Option<Instant> = None;
        let mut abort_at: Option<Instant> = None;
        let mut aborted = false;

        loop {
            if drain_deadline.is_none() && shutdown.is_cancelled() {
                drain_deadline = Some(Instant::now() + self.shutdown_timeout);
            }
            if abort_at.is_none() && shutdown.is_forced() {
                abort_at = Some(Instant::now() + self.force_grace);
            }

            let joined = tokio::select! {
                joined = slots.join_next() => joined,
                _ = shutdown.cancelled(), if drain_deadline.is_none() => continue,
                _ = shutdown.forced(), if abort_at.is_none() => continue,
                _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                    if drain_deadline.is_some() && abort_at.is_none() =>
                {
                    tracing::warn!(
                        queue = %self.queue_name,
                        "shutdown timeout of {:?} elapsed with slots still busy, forcing",
                        self.shutdown_timeout
                    );
                    report.timed_out = true;
                    shutdown.force();
                    continue;
                }
                _ = tokio::time::sleep_until(abort_at.unwrap_or_else(Instant::now)),
                    if abort_at.is_some() && !aborted =>
                {
                    tracing::warn!(
                        queue = %self.queue_name,
                        remaining = slots.len(),
                        "aborting execution slots that did not stop"
                    );
                    slots.abort_all();
                    aborted = true;
                    continue;
                }
            };

            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok((slot, exit)) => {
                    if let Some(respawn) = self.handle_exit(&slot, exit, shutdown, &mut report) {
                        Self::spawn(&mut slots, respawn, &spawn_slot);
                    }
                }
                Err(err) if err.is_cancelled() => report.aborted_slots += 1,
                Err(err) => {
                    tracing::error!(queue = %self.queue_name, "execution slot task failed: {err}");
                    report.slot_crashes += 1;
                }
            }
        }

        telemetry::record_abandoned(
            &self.queue_name,
            report.abandoned.len() + report.aborted_slots,
        );
        report
    }

    fn spawn<F, Fut>(slots: &mut JoinSet<(SlotInfo, SlotExit)>, slot: SlotInfo, spawn_slot: &F)
    where
        F: Fn(SlotInfo) -> Fut,
        Fut: Future<Output = SlotExit> + Send + 'static,
    {
        let span = telemetry::slot_span(&slot);
        let run = spawn_slot(slot.clone());
        slots.spawn(
            async move {
                let exit = match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(exit) => exit,
                    Err(panic) => SlotExit::Crashed {
                        reason: panic_message(panic.as_ref()),
                    },
                };
                (slot, exit)
            }
            .instrument(span),
        );
    }

    fn handle_exit(
        &self,
        slot: &SlotInfo,
        exit: SlotExit,
        shutdown: &ShutdownToken,
        report: &mut ShutdownReport,
    ) -> Option<SlotInfo> {
        match exit {
            SlotExit::Drained | SlotExit::Stopped => {
                tracing::debug!(slot = %slot, "execution slot stopped");
                None
            }
            SlotExit::Abandoned { units } => {
                tracing::warn!(slot = %slot, count = units.len(), "execution slot abandoned units");
                report.abandoned.extend(units);
                None
            }
            SlotExit::Crashed { reason } => {
                report.slot_crashes += 1;
                let crash = DroverError::SlotCrash {
                    slot: slot.to_string(),
                    reason,
                };
                if shutdown.is_cancelled() {
                    tracing::warn!(slot = %slot, "{crash}; not respawning during shutdown");
                    return None;
                }
                telemetry::record_slot_crash(slot, crash.to_string());
                Some(slot.next_generation())
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
