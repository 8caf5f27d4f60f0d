use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::Context;
use crate::encoding::JobPayload;
use crate::error::{DroverError, Result, TransportError};
use crate::job::JobRegistry;

/// Sends encoded messages to a queue backend.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, queue_name: &str, body: String) -> Result<(), TransportError>;
}

/// Publishes jobs by name to their (prefixed) queues.
#[derive(Clone)]
pub struct JobPublisher {
    context: Arc<Context>,
    jobs: JobRegistry,
    publisher: Arc<dyn Publisher>,
}

impl std::fmt::Debug for JobPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPublisher")
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

impl JobPublisher {
    pub fn new(context: Arc<Context>, jobs: JobRegistry, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            context,
            jobs,
            publisher,
        }
    }

    /// Encode `args` for `job_name` and send it to that job's queue.
    ///
    /// Returns the queue the message was published to.
    pub async fn publish(&self, job_name: &str, args: Vec<Value>) -> Result<String> {
        let job = self
            .jobs
            .get(job_name)
            .ok_or_else(|| DroverError::config(format!("job `{job_name}` is not registered")))?;
        let queue = self
            .context
            .config()
            .prefixed_queue_name(&job.options().queue);
        let body = JobPayload::new(job_name, args).encode()?;

        self.publisher.publish(&queue, body).await?;
        tracing::debug!(job = job_name, queue = %queue, "published job");
        Ok(queue)
    }
}
