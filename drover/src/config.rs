use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DroverError, Result};

/// Concurrency / isolation model used to execute jobs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStrategyKind {
    /// One child OS process per batch.
    #[default]
    Forked,
    /// A pool of blocking threads inside this process.
    Threaded,
}

/// Schedule on which fetching runs relative to worker availability.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerStrategyKind {
    /// `threads_per_queue` polling loops feeding the hand-off queue.
    #[default]
    Threaded,
    /// One loop that fetches only once workers have taken everything.
    Single,
}

/// Fetcher implementation identity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FetcherKind {
    /// Batched polling against the consumer.
    #[default]
    Polling,
}

/// Policy for duplicate delivery of the same logical message.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeStrategy {
    /// At-least-once: duplicates are executed again.
    #[default]
    Relaxed,
    /// Requires a dedupe store; not supported yet and rejected by
    /// [`Configuration::validate`].
    Strict,
}

/// Log verbosity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Upper bound on delivery attempts for a message.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MaxAttemptsRepr", into = "MaxAttemptsRepr")]
pub enum MaxAttempts {
    /// Never exhaust; failures are always rejected for redelivery.
    #[default]
    Unbounded,
    /// Exhaust once the current attempt reaches this value.
    Limited(NonZeroU32),
}

impl MaxAttempts {
    /// Build a limit, treating zero as a configuration error.
    pub fn limited(attempts: u32) -> Result<Self> {
        NonZeroU32::new(attempts)
            .map(MaxAttempts::Limited)
            .ok_or_else(|| DroverError::config("max_attempts must be at least 1"))
    }

    /// Whether a failure on `current_attempt` is terminal.
    pub fn is_exhausted(&self, current_attempt: u32) -> bool {
        match self {
            MaxAttempts::Unbounded => false,
            MaxAttempts::Limited(max) => current_attempt >= max.get(),
        }
    }
}

impl fmt::Display for MaxAttempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxAttempts::Unbounded => write!(f, "unbounded"),
            MaxAttempts::Limited(max) => write!(f, "{max}"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum MaxAttemptsRepr {
    Count(u32),
    Keyword(String),
}

impl TryFrom<MaxAttemptsRepr> for MaxAttempts {
    type Error = String;

    fn try_from(value: MaxAttemptsRepr) -> std::result::Result<Self, Self::Error> {
        match value {
            MaxAttemptsRepr::Count(count) => NonZeroU32::new(count)
                .map(MaxAttempts::Limited)
                .ok_or_else(|| "max_attempts must be at least 1".to_string()),
            MaxAttemptsRepr::Keyword(word) if word == "unbounded" => {
                Ok(MaxAttempts::Unbounded)
            }
            MaxAttemptsRepr::Keyword(word) => Err(format!(
                "max_attempts must be a positive number or \"unbounded\", got \"{word}\""
            )),
        }
    }
}

impl From<MaxAttempts> for MaxAttemptsRepr {
    fn from(value: MaxAttempts) -> Self {
        match value {
            MaxAttempts::Unbounded => MaxAttemptsRepr::Keyword("unbounded".into()),
            MaxAttempts::Limited(max) => MaxAttemptsRepr::Count(max.get()),
        }
    }
}

/// Command used to launch forked worker children.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Create a command for `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The running executable, re-launched as a worker child.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

/// Process-wide settings, merged from defaults and user overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Configuration {
    /// Queue backend identity, used to pick a registered consumer factory.
    pub consumer: String,
    /// Consumer strategy identity.
    pub consumer_strategy: ConsumerStrategyKind,
    /// Worker strategy identity.
    pub worker_strategy: WorkerStrategyKind,
    /// Fetcher identity.
    pub fetcher: FetcherKind,
    /// Execution slots per queue.
    pub num_workers: usize,
    /// Polling loops per queue, and concurrent executions inside a forked child.
    pub threads_per_queue: usize,
    /// Maximum units requested per fetch.
    pub batch_size: usize,
    /// Log verbosity.
    pub log_level: LogLevel,
    /// Bound on the graceful drain, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Default attempt limit for jobs that do not override it.
    pub max_attempts: MaxAttempts,
    /// Duplicate delivery policy.
    pub dedupe_strategy: DedupeStrategy,
    /// Prefix prepended to every job queue name.
    pub queue_prefix: Option<String>,
    /// Sleep after an empty fetch, in milliseconds.
    pub poll_interval_ms: u64,
    /// Base delay after a failed fetch, in milliseconds.
    pub fetch_backoff_ms: u64,
    /// Cap on the fetch retry delay, in milliseconds.
    pub max_fetch_backoff_ms: u64,
    /// Extra attempts made to deliver a complete / reject to the backend.
    pub settle_retries: u32,
    /// Command for forked children; defaults to the current executable.
    pub worker_command: Option<WorkerCommand>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            consumer: "sqs".to_string(),
            consumer_strategy: ConsumerStrategyKind::default(),
            worker_strategy: WorkerStrategyKind::default(),
            fetcher: FetcherKind::default(),
            num_workers: 4,
            threads_per_queue: 1,
            batch_size: 50,
            log_level: LogLevel::default(),
            shutdown_timeout_ms: 2 * 60 * 1000,
            max_attempts: MaxAttempts::default(),
            dedupe_strategy: DedupeStrategy::default(),
            queue_prefix: None,
            poll_interval_ms: 1000,
            fetch_backoff_ms: 500,
            max_fetch_backoff_ms: 30_000,
            settle_retries: 3,
            worker_command: None,
        }
    }
}

impl Configuration {
    /// Merge a JSON object of overrides into this configuration.
    ///
    /// Each key present in `overrides` replaces the current value; every other
    /// key is kept. Unknown keys and ill-typed values are rejected and leave
    /// the configuration untouched.
    pub fn merge(&mut self, overrides: Value) -> Result<&mut Self> {
        let Value::Object(overrides) = overrides else {
            return Err(DroverError::config(
                "configuration overrides must be a JSON object",
            ));
        };

        let mut current = serde_json::to_value(&*self)?;
        if let Some(fields) = current.as_object_mut() {
            fields.extend(overrides);
        }

        *self = serde_json::from_value(current)
            .map_err(|err| DroverError::config(err.to_string()))?;
        Ok(self)
    }

    /// Check that the configuration can drive a manager.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(DroverError::config("num_workers must be at least 1"));
        }
        if self.threads_per_queue == 0 {
            return Err(DroverError::config(
                "threads_per_queue must be at least 1",
            ));
        }
        if self.batch_size == 0 {
            return Err(DroverError::config("batch_size must be at least 1"));
        }
        if self.consumer.trim().is_empty() {
            return Err(DroverError::config("consumer must name a queue backend"));
        }
        if self.dedupe_strategy == DedupeStrategy::Strict {
            return Err(DroverError::config(
                "dedupe_strategy \"strict\" requires a dedupe store, which is not configured",
            ));
        }
        Ok(())
    }

    /// Graceful shutdown bound.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Sleep after an empty fetch.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Capacity of each queue's hand-off buffer.
    pub fn handoff_capacity(&self) -> usize {
        self.batch_size.max(self.num_workers).max(1)
    }

    /// Apply `queue_prefix` to a job's queue name.
    pub fn prefixed_queue_name(&self, queue: &str) -> String {
        match self.queue_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}_{queue}"),
            _ => queue.to_string(),
        }
    }
}
