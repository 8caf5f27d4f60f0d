use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::consumer::ConsumerFactory;
use crate::context::Context;
use crate::error::{DroverError, Result};
use crate::job::{Job, JobRegistry};

use super::Manager;

/// Builder for a [`Manager`] with explicit dependencies.
///
/// Consumer factories are registered under a backend identity; `build`
/// picks the one named by the `consumer` configuration key.
///
/// # Example
///
/// ```ignore
/// use drover::*;
///
/// let manager = ManagerBuilder::new()
///     .configure(serde_json::json!({ "consumer": "memory", "worker_strategy": "threaded" }))?
///     .register(SendEmail)?
///     .with_consumer_factory("memory", memory_consumers)
///     .build()?;
/// ```
#[derive(Default)]
pub struct ManagerBuilder {
    context: Option<Arc<Context>>,
    overrides: Vec<Value>,
    jobs: JobRegistry,
    factories: BTreeMap<String, Arc<dyn ConsumerFactory>>,
}

impl fmt::Debug for ManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerBuilder")
            .field("context_set", &self.context.is_some())
            .field("overrides", &self.overrides.len())
            .field("jobs", &self.jobs.names().collect::<Vec<_>>())
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing process context instead of a fresh one.
    pub fn with_context(mut self, context: Arc<Context>) -> Self {
        self.context = Some(context);
        self
    }

    /// Queue configuration overrides, merged at build time in call order.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `overrides` is not a JSON object.
    pub fn configure(mut self, overrides: Value) -> Result<Self> {
        if !overrides.is_object() {
            return Err(DroverError::config(
                "configuration overrides must be a JSON object",
            ));
        }
        self.overrides.push(overrides);
        Ok(self)
    }

    /// Replace the job registry.
    pub fn with_jobs(mut self, jobs: JobRegistry) -> Self {
        self.jobs = jobs;
        self
    }

    /// Register one job.
    pub fn register<J: Job>(mut self, job: J) -> Result<Self> {
        self.jobs.register(job)?;
        Ok(self)
    }

    /// Register a consumer factory under a backend identity such as `"sqs"`.
    pub fn with_consumer_factory(
        mut self,
        backend: impl Into<String>,
        factory: impl ConsumerFactory + 'static,
    ) -> Self {
        self.factories.insert(backend.into(), Arc::new(factory));
        self
    }

    /// Build the manager.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the merged configuration is invalid
    /// or no factory is registered for the configured backend.
    pub fn build(self) -> Result<Manager> {
        let context = self.context.unwrap_or_else(|| Context::new().shared());
        for overrides in self.overrides {
            context.configure(overrides)?;
        }

        let config = context.config();
        config.validate()?;

        let factory = self.factories.get(&config.consumer).cloned().ok_or_else(|| {
            DroverError::config(format!(
                "no consumer factory registered for backend `{}`",
                config.consumer
            ))
        })?;

        Ok(Manager::new(context, Arc::new(self.jobs), factory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::Consumer;
    use crate::error::TransportError;
    use serde_json::json;

    fn no_consumers(queue: &str) -> std::result::Result<Arc<dyn Consumer>, TransportError> {
        Err(TransportError::new(queue, "unreachable"))
    }

    #[test]
    fn test_build_requires_factory_for_configured_backend() {
        let err = ManagerBuilder::new()
            .with_consumer_factory("redis", no_consumers)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("`sqs`"));

        let manager = ManagerBuilder::new()
            .configure(json!({ "consumer": "redis" }))
            .unwrap()
            .with_consumer_factory("redis", no_consumers)
            .build();
        assert!(manager.is_ok());
    }

    #[test]
    fn test_build_validates_configuration() {
        let err = ManagerBuilder::new()
            .configure(json!({ "num_workers": 0 }))
            .unwrap()
            .with_consumer_factory("sqs", no_consumers)
            .build()
            .unwrap_err();
        assert!(matches!(err, DroverError::Configuration(_)));
    }

    #[test]
    fn test_configure_rejects_non_objects() {
        assert!(ManagerBuilder::new().configure(json!("fast")).is_err());
    }
}
