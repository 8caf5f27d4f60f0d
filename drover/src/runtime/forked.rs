use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use super::child::{ChildBatch, ChildReport, QUEUE_ENV, SLOT_ENV};
use super::supervisor::{ShutdownReport, ShutdownToken, SlotExit, SlotInfo, SlotPool};
use super::worker::{Verdict, Worker};
use super::{WorkerStrategy, fire_slot_hooks};
use crate::config::{Configuration, WorkerCommand, WorkerStrategyKind};
use crate::context::Context;
use crate::error::Result;
use crate::handoff::HandoffQueue;
use crate::hooks::events;
use crate::retry::Backoff;
use crate::telemetry;
use crate::unit_of_work::{MessageId, UnitOfWork};

/// Executes each batch of units in a fresh child OS process.
///
/// A slot pulls up to `batch_size` units, fires `before_fork`, spawns the
/// configured [`WorkerCommand`] and pipes the batch to it. The child's
/// settle reports are applied to the real consumer here in the parent. If
/// the child exits non-zero, units it never reported are abandoned to the
/// backend's visibility timeout, the crash is logged, and the slot spawns a
/// new child for its next batch.
pub struct ForkedWorkerStrategy {
    context: Arc<Context>,
    worker: Arc<Worker>,
    command: WorkerCommand,
    batch_size: usize,
    crash_backoff: Backoff,
    pool: SlotPool,
}

impl std::fmt::Debug for ForkedWorkerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkedWorkerStrategy")
            .field("command", &self.command)
            .field("batch_size", &self.batch_size)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl ForkedWorkerStrategy {
    /// Build a strategy using `worker_command`, or the current executable.
    pub fn new(
        queue_name: impl Into<String>,
        context: Arc<Context>,
        worker: Arc<Worker>,
    ) -> Result<Self> {
        let config = context.config();
        let command = match config.worker_command.clone() {
            Some(command) => command,
            None => WorkerCommand::current_exe()?,
        };
        Ok(Self::with_command(queue_name, context, worker, command, &config))
    }

    fn with_command(
        queue_name: impl Into<String>,
        context: Arc<Context>,
        worker: Arc<Worker>,
        command: WorkerCommand,
        config: &Configuration,
    ) -> Self {
        let pool = SlotPool::new(
            queue_name,
            WorkerStrategyKind::Forked,
            config.num_workers,
            config.shutdown_timeout(),
        );
        Self {
            context,
            worker,
            command,
            batch_size: config.batch_size.max(1),
            crash_backoff: Backoff::from_config(config),
            pool,
        }
    }

    /// Replace the child command.
    pub fn command(mut self, command: WorkerCommand) -> Self {
        self.command = command;
        self
    }

    pub fn with_pool(mut self, pool: SlotPool) -> Self {
        self.pool = pool;
        self
    }
}

#[async_trait]
impl WorkerStrategy for ForkedWorkerStrategy {
    async fn run(
        &self,
        handoff: Arc<HandoffQueue<UnitOfWork>>,
        shutdown: ShutdownToken,
    ) -> ShutdownReport {
        self.pool
            .supervise(&shutdown, |slot| {
                ForkedSlot {
                    slot,
                    context: self.context.clone(),
                    worker: self.worker.clone(),
                    command: self.command.clone(),
                    batch_size: self.batch_size,
                    crash_backoff: self.crash_backoff.clone(),
                    handoff: handoff.clone(),
                    shutdown: shutdown.clone(),
                }
                .run()
            })
            .await
    }
}

enum BatchOutcome {
    Finished,
    Crashed { reason: String },
    Abandoned { units: Vec<MessageId> },
}

struct ForkedSlot {
    slot: SlotInfo,
    context: Arc<Context>,
    worker: Arc<Worker>,
    command: WorkerCommand,
    batch_size: usize,
    crash_backoff: Backoff,
    handoff: Arc<HandoffQueue<UnitOfWork>>,
    shutdown: ShutdownToken,
}

impl ForkedSlot {
    async fn run(mut self) -> SlotExit {
        loop {
            let first = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return SlotExit::Stopped,
                unit = self.handoff.pop() => match unit {
                    Some(unit) => unit,
                    None => return SlotExit::Drained,
                },
            };

            let mut batch = vec![first];
            while batch.len() < self.batch_size {
                match self.handoff.try_pop() {
                    Some(unit) => batch.push(unit),
                    None => break,
                }
            }

            match self.run_batch(batch).await {
                BatchOutcome::Finished => self.crash_backoff.reset(),
                BatchOutcome::Abandoned { units } => return SlotExit::Abandoned { units },
                BatchOutcome::Crashed { reason } => {
                    telemetry::record_slot_crash(&self.slot, &reason);
                    self.slot = self.slot.next_generation();
                    let delay = self.crash_backoff.next_delay();
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn run_batch(&self, mut units: Vec<UnitOfWork>) -> BatchOutcome {
        fire_slot_hooks(&self.context, &self.slot, events::BEFORE_FORK);

        let mut child = match self.spawn_child() {
            Ok(child) => child,
            Err(err) => {
                // Nothing started; hand the batch straight back.
                for unit in &mut units {
                    if let Err(err) = self.worker.settle(unit, Verdict::Rejected).await {
                        tracing::warn!(
                            slot = %self.slot,
                            message_id = %unit.id(),
                            "could not return unit after failed spawn: {err}"
                        );
                    }
                }
                return BatchOutcome::Crashed {
                    reason: format!("could not spawn {}: {err}", self.command.program.display()),
                };
            }
        };

        let batch = ChildBatch::new(&self.slot, units.iter().map(UnitOfWork::to_wire).collect());
        if let Err(err) = self.write_batch(&mut child, &batch).await {
            tracing::warn!(slot = %self.slot, "could not hand batch to worker child: {err}");
        }

        let Some(stdout) = child.stdout.take() else {
            return self.abandon_after_crash(&mut child, units, "worker child has no stdout").await;
        };
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let line = tokio::select! {
                biased;
                _ = self.shutdown.forced() => return self.kill(&mut child, units).await,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => self.apply_report(&line, &mut units).await,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(slot = %self.slot, "reading worker child reports failed: {err}");
                    break;
                }
            }
        }

        let status = tokio::select! {
            biased;
            _ = self.shutdown.forced() => return self.kill(&mut child, units).await,
            status = child.wait() => status,
        };

        match status {
            Ok(status) if status.success() => {
                for unit in units.iter_mut().filter(|unit| !unit.is_settled()) {
                    tracing::debug!(message_id = %unit.id(), "worker child left unit unsettled");
                    let _ = unit.abandon();
                }
                BatchOutcome::Finished
            }
            Ok(status) => self.crashed(units, exit_reason(status)),
            Err(err) => self.crashed(units, format!("waiting for worker child failed: {err}")),
        }
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        Command::new(&self.command.program)
            .args(&self.command.args)
            .env(SLOT_ENV, self.slot.to_string())
            .env(QUEUE_ENV, &self.slot.queue_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }

    async fn write_batch(&self, child: &mut Child, batch: &ChildBatch) -> Result<()> {
        let payload = serde_json::to_vec(batch)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }
        Ok(())
    }

    async fn apply_report(&self, line: &str, units: &mut [UnitOfWork]) {
        let report: ChildReport = match serde_json::from_str(line) {
            Ok(report) => report,
            Err(err) => {
                tracing::warn!(slot = %self.slot, "ignoring malformed worker child report: {err}");
                return;
            }
        };
        let Some(unit) = units
            .iter_mut()
            .find(|unit| unit.id() == &report.id && !unit.is_settled())
        else {
            tracing::warn!(
                slot = %self.slot,
                message_id = %report.id,
                "report for a unit not pending in this batch"
            );
            return;
        };
        if let Err(err) = self.worker.settle(unit, report.action.verdict()).await {
            tracing::warn!(message_id = %report.id, "could not apply worker child report: {err}");
        }
    }

    async fn kill(&self, child: &mut Child, mut units: Vec<UnitOfWork>) -> BatchOutcome {
        if let Err(err) = child.start_kill() {
            tracing::warn!(slot = %self.slot, "could not kill worker child: {err}");
        }
        let _ = child.wait().await;

        let abandoned = abandon_pending(&mut units);
        tracing::warn!(
            slot = %self.slot,
            count = abandoned.len(),
            "worker child killed by forced shutdown"
        );
        BatchOutcome::Abandoned { units: abandoned }
    }

    async fn abandon_after_crash(
        &self,
        child: &mut Child,
        units: Vec<UnitOfWork>,
        reason: &str,
    ) -> BatchOutcome {
        let _ = child.start_kill();
        let _ = child.wait().await;
        self.crashed(units, reason.to_string())
    }

    fn crashed(&self, mut units: Vec<UnitOfWork>, reason: String) -> BatchOutcome {
        let abandoned = abandon_pending(&mut units);
        if !abandoned.is_empty() {
            tracing::warn!(
                slot = %self.slot,
                count = abandoned.len(),
                "units left to visibility timeout after worker child crash"
            );
        }
        BatchOutcome::Crashed { reason }
    }
}

fn abandon_pending(units: &mut [UnitOfWork]) -> Vec<MessageId> {
    units
        .iter_mut()
        .filter(|unit| !unit.is_settled())
        .map(|unit| {
            let _ = unit.abandon();
            unit.id().clone()
        })
        .collect()
}

fn exit_reason(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("worker child exited with status {code}"),
        None => format!("worker child terminated: {status}"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::consumer::Consumer;
    use crate::error::TransportError;
    use crate::job::JobRegistry;
    use crate::unit_of_work::Delivery;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Ledger {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Consumer for Ledger {
        fn queue_name(&self) -> &str {
            "work"
        }

        async fn fetch(&self, _max: usize) -> std::result::Result<Vec<Delivery>, TransportError> {
            Ok(Vec::new())
        }

        async fn complete(&self, unit: &UnitOfWork) -> std::result::Result<(), TransportError> {
            self.calls.lock().push(format!("complete {}", unit.id()));
            Ok(())
        }

        async fn reject(&self, unit: &UnitOfWork) -> std::result::Result<(), TransportError> {
            self.calls.lock().push(format!("reject {}", unit.id()));
            Ok(())
        }
    }

    fn strategy(script: &str, shutdown_timeout_ms: u64) -> (ForkedWorkerStrategy, Arc<Context>) {
        let context = Context::new().shared();
        context
            .configure(json!({
                "num_workers": 1,
                "batch_size": 5,
                "fetch_backoff_ms": 1,
                "shutdown_timeout_ms": shutdown_timeout_ms,
                "worker_command": { "program": "/bin/sh", "args": ["-c", script] },
            }))
            .unwrap();
        let worker = Arc::new(Worker::new(context.clone(), Arc::new(JobRegistry::new())));
        let strategy = ForkedWorkerStrategy::new("work", context.clone(), worker).unwrap();
        (strategy, context)
    }

    async fn load(handoff: &HandoffQueue<UnitOfWork>, consumer: &Arc<dyn Consumer>, ids: &[&str]) {
        for id in ids {
            let unit = UnitOfWork::new(Delivery::new(*id, "{}"), "work", consumer);
            handoff.push(unit).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_child_reports_are_applied_by_parent() {
        let script = r#"cat >/dev/null
echo "{\"action\":\"complete\",\"id\":\"a\"}"
echo "{\"action\":\"reject\",\"id\":\"b\"}""#;
        let (strategy, context) = strategy(script, 5_000);
        let forks = Arc::new(Mutex::new(0));
        let counter = forks.clone();
        context
            .hooks()
            .add_hook(events::BEFORE_FORK, move |_: &crate::hooks::HookArgs<'_>| {
                *counter.lock() += 1;
            });

        let ledger = Arc::new(Ledger::default());
        let consumer: Arc<dyn Consumer> = ledger.clone();
        let handoff = Arc::new(HandoffQueue::new(5));
        load(&handoff, &consumer, &["a", "b"]).await;
        handoff.close();

        let report = timeout(Duration::from_secs(10), strategy.run(handoff, ShutdownToken::new()))
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(*ledger.calls.lock(), vec!["complete a", "reject b"]);
        assert_eq!(*forks.lock(), 1);
    }

    #[tokio::test]
    async fn test_child_crash_abandons_unreported_units_and_respawns() {
        let script = r#"cat >/dev/null
echo "{\"action\":\"complete\",\"id\":\"a\"}"
exit 3"#;
        let (strategy, _context) = strategy(script, 5_000);
        let ledger = Arc::new(Ledger::default());
        let consumer: Arc<dyn Consumer> = ledger.clone();
        let handoff = Arc::new(HandoffQueue::new(5));
        load(&handoff, &consumer, &["a", "b"]).await;

        let shutdown = ShutdownToken::new();
        let run = {
            let handoff = handoff.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { strategy.run(handoff, shutdown).await })
        };

        // The crashed slot keeps serving: the next batch gets a new child.
        tokio::time::sleep(Duration::from_millis(300)).await;
        load(&handoff, &consumer, &["a"]).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        handoff.close();

        let report = timeout(Duration::from_secs(10), run).await.unwrap().unwrap();
        assert!(report.is_clean());
        assert_eq!(*ledger.calls.lock(), vec!["complete a", "complete a"]);
    }

    #[tokio::test]
    async fn test_forced_shutdown_kills_child_and_reports_abandoned() {
        let (strategy, _context) = strategy("cat >/dev/null; sleep 30", 100);
        let ledger = Arc::new(Ledger::default());
        let consumer: Arc<dyn Consumer> = ledger.clone();
        let handoff = Arc::new(HandoffQueue::new(5));
        load(&handoff, &consumer, &["slow"]).await;

        let shutdown = ShutdownToken::new();
        let run = {
            let handoff = handoff.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { strategy.run(handoff, shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();

        let report = timeout(Duration::from_secs(10), run).await.unwrap().unwrap();
        assert!(report.timed_out);
        assert_eq!(report.abandoned, vec![MessageId::new("slow")]);
        assert!(ledger.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unspawnable_command_rejects_batch() {
        let (strategy, _context) = strategy("true", 5_000);
        let strategy = strategy.command(WorkerCommand::new("/nonexistent/drover-child"));
        let ledger = Arc::new(Ledger::default());
        let consumer: Arc<dyn Consumer> = ledger.clone();
        let handoff = Arc::new(HandoffQueue::new(5));
        load(&handoff, &consumer, &["x"]).await;
        handoff.close();

        timeout(Duration::from_secs(10), strategy.run(handoff, ShutdownToken::new()))
            .await
            .unwrap();
        assert_eq!(*ledger.calls.lock(), vec!["reject x"]);
    }
}
