//! Top-level orchestration: one pipeline per queue, signal handling and
//! graceful shutdown.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::{Configuration, WorkerStrategyKind};
use crate::consumer::{Consumer, ConsumerFactory, QueueAdmin, QueueProvision};
use crate::consumer_strategy::{self, ConsumerStrategy};
use crate::context::Context;
use crate::error::{DroverError, Result};
use crate::fetcher::Fetcher;
use crate::handoff::HandoffQueue;
use crate::hooks::{HookArgs, events};
use crate::job::JobRegistry;
use crate::publisher::{JobPublisher, Publisher};
use crate::runtime::{
    ForkedChild, ForkedWorkerStrategy, ShutdownReport, ShutdownToken, ThreadedWorkerStrategy,
    Worker, WorkerStrategy,
};
use crate::telemetry;
use crate::unit_of_work::UnitOfWork;

mod builder;
mod signals;

pub use builder::ManagerBuilder;
pub use signals::{ShutdownSignal, SignalListener};

/// Runs every registered job queue until told to stop.
///
/// Each distinct (prefixed) job queue gets its own pipeline: a consumer from
/// the configured factory, a [`Fetcher`], a bounded hand-off queue, a
/// consumer strategy that fills it and a worker strategy that empties it.
pub struct Manager {
    context: Arc<Context>,
    jobs: Arc<JobRegistry>,
    factory: Arc<dyn ConsumerFactory>,
    shutdown: ShutdownToken,
    started: AtomicBool,
    pipelines: Mutex<Vec<Pipeline>>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("jobs", &self.jobs)
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("pipelines", &self.pipelines.lock().len())
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

impl Manager {
    pub(crate) fn new(
        context: Arc<Context>,
        jobs: Arc<JobRegistry>,
        factory: Arc<dyn ConsumerFactory>,
    ) -> Self {
        Self {
            context,
            jobs,
            factory,
            shutdown: ShutdownToken::new(),
            started: AtomicBool::new(false),
            pipelines: Mutex::new(Vec::new()),
        }
    }

    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Token shared by every pipeline; cancel it to begin a graceful stop.
    pub fn shutdown_token(&self) -> &ShutdownToken {
        &self.shutdown
    }

    /// Every registered job's queue, with `queue_prefix` applied.
    pub fn queue_names(&self) -> Vec<String> {
        let config = self.context.config();
        self.jobs
            .queue_names()
            .iter()
            .map(|queue| config.prefixed_queue_name(queue))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// A publisher that enqueues this manager's jobs through `publisher`.
    pub fn publisher(&self, publisher: Arc<dyn Publisher>) -> JobPublisher {
        JobPublisher::new(self.context.clone(), (*self.jobs).clone(), publisher)
    }

    /// Start one pipeline per queue and return immediately.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no jobs are registered or the
    /// manager was already started, and a transport error if a consumer
    /// cannot be created. Nothing is started on error.
    pub async fn start(&self) -> Result<()> {
        self.ensure_jobs()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DroverError::config("manager already started"));
        }

        let specs = match self.prepare() {
            Ok(specs) => specs,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let pipelines: Vec<Pipeline> = specs
            .into_iter()
            .map(|spec| spec.spawn(&self.shutdown))
            .collect();
        tracing::info!(queues = pipelines.len(), "manager started");
        *self.pipelines.lock() = pipelines;
        Ok(())
    }

    fn prepare(&self) -> Result<Vec<PipelineSpec>> {
        let config = self.context.config();
        let worker = Arc::new(Worker::new(self.context.clone(), self.jobs.clone()));
        let consumer_strategy = consumer_strategy::from_config(&config);

        self.queue_names()
            .into_iter()
            .map(|queue_name| -> Result<PipelineSpec> {
                let consumer = self.factory.consumer_for(&queue_name)?;
                let worker_strategy = self.worker_strategy(&config, &queue_name, worker.clone())?;
                Ok(PipelineSpec {
                    handoff: Arc::new(HandoffQueue::new(config.handoff_capacity())),
                    fetcher: Arc::new(Fetcher::new(consumer.clone(), self.context.clone())),
                    consumer,
                    consumer_strategy: consumer_strategy.clone(),
                    worker_strategy,
                    queue_name,
                })
            })
            .collect()
    }

    fn worker_strategy(
        &self,
        config: &Configuration,
        queue_name: &str,
        worker: Arc<Worker>,
    ) -> Result<Arc<dyn WorkerStrategy>> {
        Ok(match config.worker_strategy {
            WorkerStrategyKind::Threaded => {
                Arc::new(ThreadedWorkerStrategy::new(queue_name, self.context.clone(), worker))
            }
            WorkerStrategyKind::Forked => {
                Arc::new(ForkedWorkerStrategy::new(queue_name, self.context.clone(), worker)?)
            }
        })
    }

    /// Run until a signal arrives, then shut down.
    ///
    /// SIGINT and SIGTERM start a graceful shutdown; SIGQUIT, or any second
    /// signal while draining, forces it. In a process launched as a forked
    /// worker child this runs the child's batch instead and returns an
    /// empty report.
    pub async fn run(&self) -> Result<ShutdownReport> {
        telemetry::init_tracing(&self.context.config());

        if let Some(child) = ForkedChild::from_env(self.context.clone(), self.jobs.clone()) {
            let units = child.run().await?;
            tracing::debug!(units, "worker child finished");
            return Ok(ShutdownReport::default());
        }

        let signals = SignalListener::install()?;
        self.run_until(signals.into_stream()).await
    }

    /// Start, then shut down on the first item of `signals`.
    ///
    /// A forced signal skips the graceful drain, and any further signal
    /// while draining forces it. If `signals` ends before yielding, the
    /// shutdown is graceful.
    pub async fn run_until<S>(&self, signals: S) -> Result<ShutdownReport>
    where
        S: Stream<Item = ShutdownSignal> + Send,
    {
        tokio::pin!(signals);
        self.start().await?;

        let forced = signals.next().await.is_some_and(|first| first.is_forced());
        let stop = self.stop(forced);
        tokio::pin!(stop);

        let mut listening = true;
        loop {
            tokio::select! {
                report = &mut stop => return Ok(report),
                signal = signals.next(), if listening => match signal {
                    Some(signal) => {
                        tracing::warn!("{signal} received while draining, forcing shutdown");
                        self.shutdown.force();
                    }
                    None => listening = false,
                },
            }
        }
    }

    /// Stop fetching, let in-flight units finish within `shutdown_timeout`,
    /// and return never-started units to their queues.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.stop(false).await
    }

    /// Stop immediately, abandoning in-flight units to the backend's
    /// visibility timeout.
    pub async fn force_shutdown(&self) -> ShutdownReport {
        self.stop(true).await
    }

    async fn stop(&self, forced: bool) -> ShutdownReport {
        let args = HookArgs::Shutdown { forced };
        if let Err(err) = self.context.hooks().run_hooks_for(events::BEFORE_SHUTDOWN, &args) {
            tracing::warn!("before_shutdown hook failed: {err:#}");
        }

        tracing::info!(forced, "shutting down");
        self.shutdown.cancel();
        if forced {
            self.shutdown.force();
        }

        let pipelines = std::mem::take(&mut *self.pipelines.lock());
        let mut report = ShutdownReport::default();
        for stopped in join_all(pipelines.into_iter().map(Pipeline::stop)).await {
            report.merge(stopped);
        }

        if report.is_clean() {
            tracing::info!(returned = report.returned, "shutdown complete");
        } else {
            tracing::warn!(
                abandoned = report.abandoned.len(),
                aborted_slots = report.aborted_slots,
                "shutdown abandoned in-flight units"
            );
        }
        report
    }

    /// Create every registered job's queue.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no jobs are registered, or the
    /// first transport error the backend reports.
    pub async fn create_queues(
        &self,
        admin: &dyn QueueAdmin,
    ) -> Result<Vec<(String, QueueProvision)>> {
        self.ensure_jobs()?;
        let mut outcomes = Vec::new();
        for queue in self.queue_names() {
            let outcome = admin.create_queue(&queue).await?;
            tracing::info!(queue = %queue, "queue {outcome}");
            outcomes.push((queue, outcome));
        }
        Ok(outcomes)
    }

    /// Delete every registered job's queue.
    ///
    /// # Errors
    ///
    /// Same as [`create_queues`](Self::create_queues).
    pub async fn delete_queues(
        &self,
        admin: &dyn QueueAdmin,
    ) -> Result<Vec<(String, QueueProvision)>> {
        self.ensure_jobs()?;
        let mut outcomes = Vec::new();
        for queue in self.queue_names() {
            let outcome = admin.delete_queue(&queue).await?;
            tracing::info!(queue = %queue, "queue {outcome}");
            outcomes.push((queue, outcome));
        }
        Ok(outcomes)
    }

    fn ensure_jobs(&self) -> Result<()> {
        if self.jobs.is_empty() {
            return Err(DroverError::config("no jobs registered"));
        }
        Ok(())
    }
}

struct PipelineSpec {
    queue_name: String,
    consumer: Arc<dyn Consumer>,
    fetcher: Arc<Fetcher>,
    handoff: Arc<HandoffQueue<UnitOfWork>>,
    consumer_strategy: Arc<dyn ConsumerStrategy>,
    worker_strategy: Arc<dyn WorkerStrategy>,
}

impl PipelineSpec {
    fn spawn(self, shutdown: &ShutdownToken) -> Pipeline {
        let fetching = {
            let (strategy, fetcher) = (self.consumer_strategy, self.fetcher);
            let (handoff, shutdown) = (self.handoff.clone(), shutdown.clone());
            tokio::spawn(async move { strategy.run(fetcher, handoff, shutdown).await })
        };
        let working = {
            let strategy = self.worker_strategy;
            let (handoff, shutdown) = (self.handoff.clone(), shutdown.clone());
            tokio::spawn(async move { strategy.run(handoff, shutdown).await })
        };
        tracing::debug!(queue = %self.queue_name, "pipeline started");

        Pipeline {
            queue_name: self.queue_name,
            _consumer: self.consumer,
            handoff: self.handoff,
            fetching,
            working,
        }
    }
}

struct Pipeline {
    queue_name: String,
    // Units only hold a weak reference; keep the consumer alive to return them.
    _consumer: Arc<dyn Consumer>,
    handoff: Arc<HandoffQueue<UnitOfWork>>,
    fetching: JoinHandle<()>,
    working: JoinHandle<ShutdownReport>,
}

impl Pipeline {
    async fn stop(self) -> ShutdownReport {
        if let Err(err) = self.fetching.await {
            tracing::error!(queue = %self.queue_name, "consumer strategy failed: {err}");
        }

        let mut report = match self.working.await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(queue = %self.queue_name, "worker strategy failed: {err}");
                ShutdownReport::default()
            }
        };

        self.handoff.close();
        for mut unit in self.handoff.drain() {
            match unit.reject().await {
                Ok(()) => report.returned += 1,
                Err(err) => {
                    tracing::warn!(
                        queue = %self.queue_name,
                        message_id = %unit.id(),
                        "could not return unit: {err}"
                    );
                }
            }
        }
        telemetry::set_handoff_depth(&self.queue_name, 0);

        if report.returned > 0 {
            tracing::info!(
                queue = %self.queue_name,
                returned = report.returned,
                "returned buffered units"
            );
        }
        report
    }
}
