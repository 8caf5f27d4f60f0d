use drover::{InstanceHooks, Job, JobOptions, MaxAttempts};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Succeeds and records the arguments of every run.
#[derive(Clone, Debug)]
pub struct TestJob {
    name: String,
    options: JobOptions,
    runs: Arc<Mutex<Vec<Vec<Value>>>>,
}

impl TestJob {
    pub fn new(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: JobOptions::new(queue),
            runs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: MaxAttempts) -> Self {
        self.options = self.options.with_max_attempts(max_attempts);
        self
    }

    pub fn runs(&self) -> Vec<Vec<Value>> {
        self.runs.lock().clone()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().len()
    }
}

impl Job for TestJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> JobOptions {
        self.options.clone()
    }

    fn perform(&self, args: &[Value]) -> anyhow::Result<()> {
        self.runs.lock().push(args.to_vec());
        Ok(())
    }
}

/// Fails a fixed number of times, then succeeds (or fails forever).
#[derive(Clone, Debug)]
pub struct FailingJob {
    name: String,
    options: JobOptions,
    failures: Option<u32>,
    attempts: Arc<AtomicU32>,
    hooks: Option<InstanceHooks>,
}

impl FailingJob {
    /// A job that never succeeds.
    pub fn always(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: JobOptions::new(queue),
            failures: None,
            attempts: Arc::new(AtomicU32::new(0)),
            hooks: None,
        }
    }

    /// A job that fails its first `failures` runs.
    pub fn times(name: impl Into<String>, queue: impl Into<String>, failures: u32) -> Self {
        Self {
            failures: Some(failures),
            ..Self::always(name, queue)
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: MaxAttempts) -> Self {
        self.options = self.options.with_max_attempts(max_attempts);
        self
    }

    /// Instance hooks to install at registration.
    pub fn with_hooks(mut self, hooks: InstanceHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Job for FailingJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> JobOptions {
        self.options.clone()
    }

    fn perform(&self, _args: &[Value]) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.failures {
            Some(failures) if attempt > failures => Ok(()),
            _ => anyhow::bail!("{} failed on run {attempt}", self.name),
        }
    }

    fn hooks(&self, hooks: &mut InstanceHooks) {
        if let Some(extra) = &self.hooks {
            *hooks = extra.clone();
        }
    }
}

/// Blocks its thread for a fixed time, then succeeds.
#[derive(Clone, Debug)]
pub struct SlowJob {
    name: String,
    options: JobOptions,
    duration: Duration,
    finished: Arc<AtomicU32>,
}

impl SlowJob {
    pub fn new(name: impl Into<String>, queue: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            options: JobOptions::new(queue),
            duration,
            finished: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn finished(&self) -> u32 {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Job for SlowJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> JobOptions {
        self.options.clone()
    }

    fn perform(&self, _args: &[Value]) -> anyhow::Result<()> {
        std::thread::sleep(self.duration);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Panics whenever it runs.
#[derive(Clone, Debug)]
pub struct PanickingJob {
    name: String,
    options: JobOptions,
}

impl PanickingJob {
    pub fn new(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: JobOptions::new(queue),
        }
    }
}

impl Job for PanickingJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> JobOptions {
        self.options.clone()
    }

    fn perform(&self, _args: &[Value]) -> anyhow::Result<()> {
        panic!("{} exploded", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failing_job_recovers_after_configured_failures() {
        let job = FailingJob::times("flaky", "q", 2);
        assert!(job.perform(&[]).is_err());
        assert!(job.perform(&[]).is_err());
        assert!(job.perform(&[]).is_ok());
        assert_eq!(job.attempts(), 3);
    }

    #[test]
    fn test_test_job_records_args() {
        let job = TestJob::new("echo", "q");
        job.perform(&[Value::from(1), Value::from("two")]).unwrap();
        assert_eq!(job.runs(), vec![vec![Value::from(1), Value::from("two")]]);
    }
}
