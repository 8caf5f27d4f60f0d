use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::config::MaxAttempts;
use crate::error::{DroverError, Result};
use crate::hooks::InstanceHooks;

/// A unit of application logic that can be run from a queue message.
///
/// `perform` runs on a blocking thread (or inside a worker child process) and
/// may block freely. Returning an error, or panicking, counts as a failed
/// attempt.
pub trait Job: Send + Sync + 'static {
    /// Name used in the payload envelope to route messages to this job.
    fn name(&self) -> &str;

    fn options(&self) -> JobOptions;

    fn perform(&self, args: &[Value]) -> anyhow::Result<()>;

    /// Declare job-level hooks. Called once, at registration.
    fn hooks(&self, _hooks: &mut InstanceHooks) {}
}

/// Per-job settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobOptions {
    /// Unprefixed queue the job is published to and consumed from.
    pub queue: String,
    /// Overrides the configured `max_attempts` for this job.
    pub max_attempts: Option<MaxAttempts>,
}

impl JobOptions {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: MaxAttempts) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A job plus everything captured about it at registration.
pub struct RegisteredJob {
    job: Arc<dyn Job>,
    options: JobOptions,
    hooks: InstanceHooks,
}

impl fmt::Debug for RegisteredJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredJob")
            .field("name", &self.job.name())
            .field("options", &self.options)
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl RegisteredJob {
    pub fn name(&self) -> &str {
        self.job.name()
    }

    pub fn job(&self) -> &Arc<dyn Job> {
        &self.job
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn hooks(&self) -> &InstanceHooks {
        &self.hooks
    }

    /// The job's own limit, falling back to `default`.
    pub fn max_attempts(&self, default: MaxAttempts) -> MaxAttempts {
        self.options.max_attempts.unwrap_or(default)
    }
}

/// Name-indexed set of jobs this process can run.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: BTreeMap<String, Arc<RegisteredJob>>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.jobs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<J: Job>(&mut self, job: J) -> Result<&mut Self> {
        self.register_arc(Arc::new(job))
    }

    /// Register a shared job. Names must be unique and queues non-empty.
    pub fn register_arc(&mut self, job: Arc<dyn Job>) -> Result<&mut Self> {
        let name = job.name().to_string();
        if name.trim().is_empty() {
            return Err(DroverError::config("job name must not be empty"));
        }
        if self.jobs.contains_key(&name) {
            return Err(DroverError::config(format!(
                "job `{name}` is already registered"
            )));
        }

        let options = job.options();
        if options.queue.trim().is_empty() {
            return Err(DroverError::config(format!(
                "job `{name}` must name a queue"
            )));
        }

        let mut hooks = InstanceHooks::new();
        job.hooks(&mut hooks);

        self.jobs.insert(
            name,
            Arc::new(RegisteredJob {
                job,
                options,
                hooks,
            }),
        );
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredJob>> {
        self.jobs.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }

    /// Distinct unprefixed queue names, in sorted order.
    pub fn queue_names(&self) -> BTreeSet<String> {
        self.jobs
            .values()
            .map(|job| job.options.queue.clone())
            .collect()
    }
}
