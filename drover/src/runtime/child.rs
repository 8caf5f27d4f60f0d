//! Worker child process protocol.
//!
//! The parent writes one [`ChildBatch`] as JSON to the child's stdin and
//! closes it. The child runs every unit and writes one [`ChildReport`] JSON
//! line to stdout per settle decision. Logs go to stderr. Units the child
//! never reports are left to the backend's visibility timeout.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::fire_slot_hooks;
use super::supervisor::{SlotInfo, panic_message};
use super::worker::{Verdict, Worker};
use crate::config::WorkerStrategyKind;
use crate::consumer::Consumer;
use crate::context::Context;
use crate::error::{DroverError, Result, TransportError};
use crate::hooks::events;
use crate::job::JobRegistry;
use crate::unit_of_work::{Delivery, MessageId, UnitOfWork, WireUnit};

/// Set in a worker child's environment to its slot identity.
pub const SLOT_ENV: &str = "DROVER_FORKED_SLOT";
/// Set in a worker child's environment to the queue it works for.
pub const QUEUE_ENV: &str = "DROVER_QUEUE";

/// Work handed from the parent to one child.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChildBatch {
    pub batch_id: Uuid,
    pub queue_name: String,
    pub slot: usize,
    pub generation: u64,
    pub units: Vec<WireUnit>,
}

impl ChildBatch {
    pub fn new(slot: &SlotInfo, units: Vec<WireUnit>) -> Self {
        Self {
            batch_id: Uuid::now_v7(),
            queue_name: slot.queue_name.clone(),
            slot: slot.index,
            generation: slot.generation,
            units,
        }
    }

    fn slot_info(&self) -> SlotInfo {
        SlotInfo {
            queue_name: self.queue_name.clone(),
            index: self.slot,
            generation: self.generation,
            strategy: WorkerStrategyKind::Forked,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportAction {
    Complete,
    Reject,
    DeadLetter,
}

impl ReportAction {
    /// The verdict the parent applies for this report.
    pub fn verdict(&self) -> Verdict {
        match self {
            ReportAction::Complete => Verdict::Completed,
            ReportAction::Reject => Verdict::Rejected,
            ReportAction::DeadLetter => Verdict::Exhausted,
        }
    }
}

/// One settle decision, written by the child as a JSON line.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChildReport {
    pub action: ReportAction,
    pub id: MessageId,
}

/// Consumer used inside a child: settles are reported to the parent.
pub struct ReportingConsumer<W> {
    queue_name: String,
    writer: Mutex<W>,
}

impl<W> ReportingConsumer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(queue_name: impl Into<String>, writer: W) -> Self {
        Self {
            queue_name: queue_name.into(),
            writer: Mutex::new(writer),
        }
    }

    async fn report(&self, action: ReportAction, unit: &UnitOfWork) -> Result<(), TransportError> {
        let report = ChildReport {
            action,
            id: unit.id().clone(),
        };
        let mut line = serde_json::to_string(&report)
            .map_err(|err| {
                TransportError::with_source(&self.queue_name, "could not encode report", err)
            })?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|err| {
                TransportError::with_source(&self.queue_name, "parent pipe closed", err)
            })?;
        writer
            .flush()
            .await
            .map_err(|err| TransportError::with_source(&self.queue_name, "parent pipe closed", err))
    }
}

#[async_trait]
impl<W> Consumer for ReportingConsumer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn fetch(&self, _max_batch_size: usize) -> Result<Vec<Delivery>, TransportError> {
        Err(TransportError::new(
            &self.queue_name,
            "worker children receive units from their parent and cannot fetch",
        ))
    }

    async fn complete(&self, unit: &UnitOfWork) -> Result<(), TransportError> {
        self.report(ReportAction::Complete, unit).await
    }

    async fn reject(&self, unit: &UnitOfWork) -> Result<(), TransportError> {
        self.report(ReportAction::Reject, unit).await
    }

    async fn dead_letter(&self, unit: &UnitOfWork) -> Result<(), TransportError> {
        self.report(ReportAction::DeadLetter, unit).await
    }
}

/// Entry point for a process launched by the forked worker strategy.
pub struct ForkedChild {
    context: Arc<Context>,
    jobs: Arc<JobRegistry>,
}

impl std::fmt::Debug for ForkedChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkedChild")
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

impl ForkedChild {
    pub fn new(context: Arc<Context>, jobs: Arc<JobRegistry>) -> Self {
        Self { context, jobs }
    }

    /// Whether this process was started as a worker child.
    pub fn is_child() -> bool {
        std::env::var_os(SLOT_ENV).is_some()
    }

    /// A child runner if this process is a worker child.
    pub fn from_env(context: Arc<Context>, jobs: Arc<JobRegistry>) -> Option<Self> {
        Self::is_child().then(|| Self::new(context, jobs))
    }

    /// Run the batch on stdin, reporting on stdout. Returns the units run.
    pub async fn run(&self) -> Result<usize> {
        self.run_with_io(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Run one batch read from `reader`, writing reports to `writer`.
    ///
    /// Up to `threads_per_queue` units execute at once. A job panic is
    /// returned as [`DroverError::SlotCrash`] after the other units finish,
    /// so the parent sees a failed child and abandons the unreported unit.
    pub async fn run_with_io<R, W>(&self, mut reader: R, writer: W) -> Result<usize>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut input = String::new();
        reader.read_to_string(&mut input).await?;
        let batch: ChildBatch = serde_json::from_str(&input)?;

        let slot = batch.slot_info();
        fire_slot_hooks(&self.context, &slot, events::AFTER_FORK);
        tracing::debug!(
            slot = %slot,
            batch_id = %batch.batch_id,
            units = batch.units.len(),
            "worker child started"
        );

        let consumer: Arc<dyn Consumer> =
            Arc::new(ReportingConsumer::new(batch.queue_name.clone(), writer));
        let worker = Arc::new(Worker::new(self.context.clone(), self.jobs.clone()));
        let concurrency = self.context.config().threads_per_queue.max(1);
        let total = batch.units.len();

        let units: Vec<UnitOfWork> = batch
            .units
            .into_iter()
            .map(|wire| UnitOfWork::from_wire(wire, &consumer))
            .collect();

        let panics: Vec<String> = futures::stream::iter(units)
            .map(|unit| {
                let worker = worker.clone();
                async move {
                    let id = unit.id().clone();
                    match worker.process(unit).await {
                        Ok(_) => None,
                        Err(err) if err.is_panic() => Some(format!(
                            "job panicked on message {id}: {}",
                            panic_message(err.into_panic().as_ref())
                        )),
                        Err(err) => Some(format!("message {id}: {err}")),
                    }
                }
            })
            .buffer_unordered(concurrency)
            .filter_map(|panic| async move { panic })
            .collect()
            .await;

        if let Some(reason) = panics.into_iter().next() {
            return Err(DroverError::SlotCrash {
                slot: slot.to_string(),
                reason,
            });
        }
        Ok(total)
    }
}
