use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::handoff::HandoffQueue;
use crate::hooks::HookArgs;
use crate::unit_of_work::UnitOfWork;

/// Child-process side of the forked worker strategy.
pub mod child;
/// Process-isolated worker strategy.
pub mod forked;
/// Slot supervision, shutdown signalling and reporting.
pub mod supervisor;
/// In-process worker strategy.
pub mod threaded;
/// Per-unit execution and settlement.
pub mod worker;

pub use child::{ChildBatch, ChildReport, ForkedChild, ReportAction};
pub use forked::ForkedWorkerStrategy;
pub use supervisor::{ShutdownReport, ShutdownToken, SlotExit, SlotInfo, SlotPool};
pub use threaded::ThreadedWorkerStrategy;
pub use worker::{Verdict, Worker};

/// Concurrency and isolation model for executing units.
///
/// A strategy keeps exactly `num_workers` execution slots pulling from the
/// hand-off queue until `shutdown` is cancelled, then drains within the
/// configured timeout and reports what it had to abandon.
#[async_trait]
pub trait WorkerStrategy: Send + Sync {
    async fn run(
        &self,
        handoff: Arc<HandoffQueue<UnitOfWork>>,
        shutdown: ShutdownToken,
    ) -> ShutdownReport;
}

/// Fire a slot lifecycle event. Hook failures are logged, not fatal to the slot.
pub(crate) fn fire_slot_hooks(context: &Context, slot: &SlotInfo, event: &str) {
    let args = HookArgs::Slot { slot };
    if let Err(err) = context.hooks().run_hooks_for(event, &args) {
        tracing::warn!(slot = %slot, "{event} hook failed: {err:#}");
    }
}
