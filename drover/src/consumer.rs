use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::unit_of_work::{Delivery, UnitOfWork};

/// Capability for fetching and settling messages against one queue.
///
/// Concrete backends (SQS, Redis, an in-memory queue for tests) implement
/// this trait. None of the operations are assumed idempotent, and the engine
/// tolerates duplicate delivery.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Name of the queue this consumer reads from.
    fn queue_name(&self) -> &str;

    /// Fetch up to `max_batch_size` messages.
    async fn fetch(
        &self,
        max_batch_size: usize,
    ) -> Result<Vec<Delivery>, TransportError>;

    /// Acknowledge a unit so it is never redelivered.
    async fn complete(&self, unit: &UnitOfWork) -> Result<(), TransportError>;

    /// Best-effort request to make a unit available for redelivery now.
    async fn reject(&self, unit: &UnitOfWork) -> Result<(), TransportError>;

    /// Terminal handling for a unit that exhausted its attempts.
    ///
    /// Backends with a dead-letter queue should route the message there.
    /// The default drops it by acknowledging.
    async fn dead_letter(&self, unit: &UnitOfWork) -> Result<(), TransportError> {
        self.complete(unit).await
    }
}

/// Builds a [`Consumer`] for a queue name.
///
/// The manager keeps one factory per backend identity and picks the one
/// named by the `consumer` configuration key.
pub trait ConsumerFactory: Send + Sync {
    fn consumer_for(&self, queue_name: &str) -> Result<Arc<dyn Consumer>, TransportError>;
}

impl<F> ConsumerFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn Consumer>, TransportError> + Send + Sync,
{
    fn consumer_for(&self, queue_name: &str) -> Result<Arc<dyn Consumer>, TransportError> {
        self(queue_name)
    }
}

/// Result of an administrative queue operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueProvision {
    Created,
    AlreadyExists,
    Deleted,
    Missing,
}

impl fmt::Display for QueueProvision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QueueProvision::Created => "created",
            QueueProvision::AlreadyExists => "already exists",
            QueueProvision::Deleted => "deleted",
            QueueProvision::Missing => "does not exist",
        };
        f.write_str(label)
    }
}

/// Administrative queue provisioning.
///
/// "Already exists" and "does not exist" must be reported through
/// [`QueueProvision`], not as errors.
#[async_trait]
pub trait QueueAdmin: Send + Sync {
    async fn create_queue(&self, name: &str) -> Result<QueueProvision, TransportError>;

    async fn delete_queue(&self, name: &str) -> Result<QueueProvision, TransportError>;
}
