use std::fmt;
use std::sync::Arc;

use tracing::Instrument;

use crate::config::{Configuration, MaxAttempts};
use crate::context::Context;
use crate::encoding::JobPayload;
use crate::error::{DroverError, Result};
use crate::hooks::{HookArgs, events};
use crate::job::{JobRegistry, RegisteredJob};
use crate::retry::Backoff;
use crate::telemetry::{self, PerformTimer};
use crate::unit_of_work::{UnitOfWork, UnitState};

/// What should happen to a unit after its job ran.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Acknowledge: the job (and its after hooks) succeeded.
    Completed,
    /// Release for redelivery: failed with attempts remaining.
    Rejected,
    /// Drop or dead-letter: failed on the last allowed attempt.
    Exhausted,
    /// A hook declined to run the job. The unit is left to the backend.
    Vetoed,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Completed => "completed",
            Verdict::Rejected => "rejected",
            Verdict::Exhausted => "exhausted",
            Verdict::Vetoed => "vetoed",
        }
    }

    /// Backend operation the verdict maps to.
    pub fn operation(&self) -> &'static str {
        match self {
            Verdict::Completed => "complete",
            Verdict::Rejected => "reject",
            Verdict::Exhausted => "dead_letter",
            Verdict::Vetoed => "abandon",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs units through job logic and hooks, then settles them.
///
/// [`execute`](Worker::execute) is synchronous and must run on a blocking
/// thread; it never talks to the backend. [`settle`](Worker::settle) applies
/// the verdict through the unit's consumer, retrying transport failures.
pub struct Worker {
    context: Arc<Context>,
    jobs: Arc<JobRegistry>,
    max_attempts: MaxAttempts,
    settle_retries: u32,
    settle_backoff: Backoff,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("jobs", &self.jobs)
            .field("max_attempts", &self.max_attempts)
            .field("settle_retries", &self.settle_retries)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(context: Arc<Context>, jobs: Arc<JobRegistry>) -> Self {
        let config = context.config();
        Self::with_config(context, jobs, &config)
    }

    pub fn with_config(
        context: Arc<Context>,
        jobs: Arc<JobRegistry>,
        config: &Configuration,
    ) -> Self {
        Self {
            max_attempts: config.max_attempts,
            settle_retries: config.settle_retries,
            settle_backoff: Backoff::from_config(config),
            context,
            jobs,
        }
    }

    /// Decode, run and judge one unit.
    ///
    /// Order: `around_perform` wraps { `before_perform`, the job,
    /// `after_perform` }. A `before_perform` veto or an around hook that does
    /// not proceed yields [`Verdict::Vetoed`]. Any error, from the job or
    /// from a perform hook, takes the failure path: `on_failure`, then
    /// `on_failure_exhausted` if this was the last allowed attempt.
    pub fn execute(&self, unit: &UnitOfWork) -> Verdict {
        let payload = match JobPayload::decode(unit.message()) {
            Ok(payload) => payload,
            Err(err) => {
                let error = anyhow::Error::new(err).context("undecodable message");
                return self.undeliverable(unit, None, error);
            }
        };
        let Some(job) = self.jobs.get(&payload.job) else {
            let err = anyhow::anyhow!("no job registered as `{}`", payload.job);
            return self.undeliverable(unit, Some(&payload), err);
        };

        let span = telemetry::perform_span(
            unit.queue_name(),
            unit.id().as_str(),
            &payload.job,
            unit.current_attempt(),
        );
        let _enter = span.enter();
        let timer = PerformTimer::start();
        let verdict = self.perform(unit, &payload, &job);
        timer.finish(unit.queue_name(), &payload.job, verdict.as_str());
        verdict
    }

    fn perform(&self, unit: &UnitOfWork, payload: &JobPayload, job: &RegisteredJob) -> Verdict {
        let hooks = self.context.hooks();
        let instance = Some(job.hooks());
        let args = HookArgs::Perform { unit, payload };

        let perform = || -> anyhow::Result<bool> {
            if !hooks.run_hooks_with(events::BEFORE_PERFORM, &args, instance)? {
                return Ok(false);
            }
            job.job().perform(&payload.args)?;
            hooks.run_hooks_with(events::AFTER_PERFORM, &args, instance)?;
            Ok(true)
        };
        let outcome = hooks.run_around_hooks_with(events::AROUND_PERFORM, &args, instance, perform);

        match outcome {
            Ok(Some(Ok(true))) => Verdict::Completed,
            Ok(Some(Ok(false))) => {
                tracing::info!(message_id = %unit.id(), "perform vetoed by before_perform hook");
                Verdict::Vetoed
            }
            Ok(None) => {
                tracing::info!(message_id = %unit.id(), "perform skipped by around_perform hook");
                Verdict::Vetoed
            }
            Ok(Some(Err(err))) | Err(err) => self.fail(unit, Some(payload), Some(job), err),
        }
    }

    fn undeliverable(
        &self,
        unit: &UnitOfWork,
        payload: Option<&JobPayload>,
        error: anyhow::Error,
    ) -> Verdict {
        let args = HookArgs::Failure {
            unit,
            payload,
            error: &error,
        };
        if let Err(err) = self.context.hooks().run_hooks_for(events::ON_REJECTED, &args) {
            tracing::error!(message_id = %unit.id(), "on_rejected hook failed: {err:#}");
        }
        self.fail(unit, payload, None, error)
    }

    fn fail(
        &self,
        unit: &UnitOfWork,
        payload: Option<&JobPayload>,
        job: Option<&RegisteredJob>,
        error: anyhow::Error,
    ) -> Verdict {
        let hooks = self.context.hooks();
        let instance = job.map(RegisteredJob::hooks);
        let attempt = unit.current_attempt();

        let failure = DroverError::JobExecution {
            job: payload.map_or_else(|| "<undecodable>".to_string(), |p| p.job.clone()),
            attempt,
            message: format!("{error:#}"),
        };
        tracing::warn!(queue = %unit.queue_name(), message_id = %unit.id(), "{failure}");

        let args = HookArgs::Failure {
            unit,
            payload,
            error: &error,
        };
        if let Err(err) = hooks.run_hooks_with(events::ON_FAILURE, &args, instance) {
            tracing::error!(message_id = %unit.id(), "on_failure hook failed: {err:#}");
        }

        let max_attempts = job.map_or(self.max_attempts, |job| job.max_attempts(self.max_attempts));
        if !max_attempts.is_exhausted(attempt) {
            return Verdict::Rejected;
        }

        let exhausted = DroverError::AttemptsExhausted {
            id: unit.id().clone(),
            attempt,
        };
        tracing::error!(queue = %unit.queue_name(), max_attempts = %max_attempts, "{exhausted}");
        if let Err(err) = hooks.run_hooks_with(events::ON_FAILURE_EXHAUSTED, &args, instance) {
            tracing::error!(message_id = %unit.id(), "on_failure_exhausted hook failed: {err:#}");
        }
        Verdict::Exhausted
    }

    /// Apply `verdict` to the unit through its consumer.
    ///
    /// Transport failures are retried `settle_retries` times with backoff;
    /// after that the error is returned and redelivery is left to the
    /// backend's visibility timeout.
    pub async fn settle(&self, unit: &mut UnitOfWork, verdict: Verdict) -> Result<()> {
        let span =
            telemetry::settle_span(unit.queue_name(), unit.id().as_str(), verdict.operation());
        let mut backoff = self.settle_backoff.clone();

        async move {
            loop {
                match settle_once(unit, verdict).await {
                    Ok(()) => {
                        let outcome = unit.state().as_str();
                        telemetry::record_settled(unit.queue_name(), unit.id().as_str(), outcome);
                        return Ok(());
                    }
                    Err(DroverError::Transport(err))
                        if backoff.failures() < self.settle_retries =>
                    {
                        let operation = verdict.operation();
                        telemetry::record_transport_error(unit.queue_name(), operation, &err);
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                    Err(err) => {
                        tracing::warn!(
                            queue = %unit.queue_name(),
                            message_id = %unit.id(),
                            "giving up on {}: {err}",
                            verdict.operation()
                        );
                        return Err(err);
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Run `execute` on a blocking thread, then settle.
    ///
    /// A panic inside the job is returned as the join error; the unit is
    /// left unsettled.
    pub async fn process(
        self: &Arc<Self>,
        unit: UnitOfWork,
    ) -> std::result::Result<(UnitOfWork, Verdict), tokio::task::JoinError> {
        let worker = Arc::clone(self);
        let (mut unit, verdict) = tokio::task::spawn_blocking(move || {
            let verdict = worker.execute(&unit);
            (unit, verdict)
        })
        .await?;

        if let Err(err) = self.settle(&mut unit, verdict).await {
            tracing::warn!(message_id = %unit.id(), "unit left unsettled: {err}");
        }
        Ok((unit, verdict))
    }
}

async fn settle_once(unit: &mut UnitOfWork, verdict: Verdict) -> Result<()> {
    match verdict {
        Verdict::Completed => unit.complete().await,
        Verdict::Rejected => unit.reject().await,
        Verdict::Exhausted => unit.dead_letter().await,
        Verdict::Vetoed => unit.abandon(),
    }
}

/// The state a unit ends up in once `verdict` is applied.
pub fn settled_state(verdict: Verdict) -> UnitState {
    match verdict {
        Verdict::Completed => UnitState::Completed,
        Verdict::Rejected => UnitState::Rejected,
        Verdict::Exhausted => UnitState::Exhausted,
        Verdict::Vetoed => UnitState::Abandoned,
    }
}
