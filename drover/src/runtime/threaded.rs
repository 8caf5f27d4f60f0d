use std::sync::Arc;

use async_trait::async_trait;

use super::supervisor::{ShutdownReport, ShutdownToken, SlotExit, SlotInfo, SlotPool, panic_message};
use super::worker::Worker;
use super::{WorkerStrategy, fire_slot_hooks};
use crate::config::WorkerStrategyKind;
use crate::context::Context;
use crate::handoff::HandoffQueue;
use crate::hooks::events;
use crate::unit_of_work::UnitOfWork;

/// Executes units on blocking threads inside this process.
///
/// Each of the `num_workers` slots takes one unit at a time from the
/// hand-off queue and runs it on the blocking pool. A job that panics takes
/// its slot down; the pool logs the crash and starts a replacement.
pub struct ThreadedWorkerStrategy {
    context: Arc<Context>,
    worker: Arc<Worker>,
    pool: SlotPool,
}

impl std::fmt::Debug for ThreadedWorkerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedWorkerStrategy")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl ThreadedWorkerStrategy {
    pub fn new(queue_name: impl Into<String>, context: Arc<Context>, worker: Arc<Worker>) -> Self {
        let config = context.config();
        let pool = SlotPool::new(
            queue_name,
            WorkerStrategyKind::Threaded,
            config.num_workers,
            config.shutdown_timeout(),
        );
        Self {
            context,
            worker,
            pool,
        }
    }

    pub fn with_pool(mut self, pool: SlotPool) -> Self {
        self.pool = pool;
        self
    }
}

#[async_trait]
impl WorkerStrategy for ThreadedWorkerStrategy {
    async fn run(
        &self,
        handoff: Arc<HandoffQueue<UnitOfWork>>,
        shutdown: ShutdownToken,
    ) -> ShutdownReport {
        self.pool
            .supervise(&shutdown, |slot| {
                run_slot(
                    slot,
                    self.context.clone(),
                    self.worker.clone(),
                    handoff.clone(),
                    shutdown.clone(),
                )
            })
            .await
    }
}

async fn run_slot(
    slot: SlotInfo,
    context: Arc<Context>,
    worker: Arc<Worker>,
    handoff: Arc<HandoffQueue<UnitOfWork>>,
    shutdown: ShutdownToken,
) -> SlotExit {
    fire_slot_hooks(&context, &slot, events::BEFORE_SLOT_START);
    fire_slot_hooks(&context, &slot, events::AFTER_SLOT_START);

    loop {
        let unit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return SlotExit::Stopped,
            unit = handoff.pop() => match unit {
                Some(unit) => unit,
                None => return SlotExit::Drained,
            },
        };

        let id = unit.id().clone();
        let process = worker.process(unit);
        tokio::pin!(process);

        tokio::select! {
            biased;
            result = &mut process => match result {
                Ok(_) => {}
                Err(err) if err.is_panic() => {
                    return SlotExit::Crashed {
                        reason: format!(
                            "job panicked on message {id}: {}",
                            panic_message(err.into_panic().as_ref())
                        ),
                    };
                }
                Err(err) => {
                    return SlotExit::Crashed {
                        reason: format!("blocking task for message {id} failed: {err}"),
                    };
                }
            },
            _ = shutdown.forced() => {
                tracing::warn!(slot = %slot, message_id = %id, "abandoning in-flight unit");
                return SlotExit::Abandoned { units: vec![id] };
            }
        }
    }
}
