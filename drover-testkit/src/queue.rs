use async_trait::async_trait;
use drover::{
    Consumer, ConsumerFactory, Delivery, MessageId, Publisher, QueueAdmin, QueueProvision,
    TransportError, UnitOfWork,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// What a consumer did with a delivered message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SettleAction {
    Completed,
    Rejected,
    DeadLettered,
}

/// One settle call observed by the in-memory backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Settle {
    pub queue: String,
    pub id: MessageId,
    pub action: SettleAction,
}

#[derive(Clone, Debug)]
struct StoredMessage {
    id: MessageId,
    body: String,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, StoredMessage>,
    dead_letters: Vec<StoredMessage>,
}

#[derive(Debug, Default)]
struct Backend {
    queues: BTreeMap<String, QueueState>,
    settles: Vec<Settle>,
    receive_counts: HashMap<MessageId, u32>,
    fetch_failures: HashMap<String, usize>,
    settle_failures: usize,
}

/// A queue backend held entirely in memory.
///
/// Messages move from *ready* to *in flight* when fetched and leave on
/// complete or dead-letter; a reject puts them back at the end of the ready
/// list. Abandoned units stay in flight until [`expire_in_flight`] simulates
/// the visibility timeout. Every settle call is recorded.
///
/// [`expire_in_flight`]: InMemoryQueue::expire_in_flight
#[derive(Clone, Debug, Default)]
pub struct InMemoryQueue {
    backend: Arc<Mutex<Backend>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A consumer bound to `queue`.
    pub fn consumer(&self, queue: &str) -> Arc<dyn Consumer> {
        Arc::new(InMemoryConsumer {
            backend: self.backend.clone(),
            queue_name: queue.to_string(),
        })
    }

    /// A factory handing out consumers on this backend.
    pub fn factory(&self) -> impl ConsumerFactory + 'static {
        let queue = self.clone();
        move |name: &str| -> Result<Arc<dyn Consumer>, TransportError> { Ok(queue.consumer(name)) }
    }

    /// Enqueue a message under a fresh id.
    pub fn push(&self, queue: &str, body: impl Into<String>) -> MessageId {
        let id = MessageId::new(Uuid::new_v4().to_string());
        self.push_with_id(queue, id.clone(), body);
        id
    }

    pub fn push_with_id(&self, queue: &str, id: impl Into<MessageId>, body: impl Into<String>) {
        let mut backend = self.backend.lock();
        backend
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(StoredMessage {
                id: id.into(),
                body: body.into(),
                receive_count: 0,
            });
    }

    /// Make the next `count` fetches on `queue` fail.
    pub fn fail_next_fetches(&self, queue: &str, count: usize) {
        self.backend.lock().fetch_failures.insert(queue.to_string(), count);
    }

    /// Make the next `count` settle calls fail, on any queue.
    pub fn fail_next_settles(&self, count: usize) {
        self.backend.lock().settle_failures = count;
    }

    /// Return every in-flight message on `queue` to the ready list, as a
    /// visibility timeout would.
    pub fn expire_in_flight(&self, queue: &str) -> usize {
        let mut backend = self.backend.lock();
        let Some(state) = backend.queues.get_mut(queue) else {
            return 0;
        };
        let expired: Vec<StoredMessage> =
            state.in_flight.drain().map(|(_, message)| message).collect();
        let count = expired.len();
        state.ready.extend(expired);
        count
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        self.backend.lock().queues.get(queue).map_or(0, |state| state.ready.len())
    }

    pub fn in_flight_len(&self, queue: &str) -> usize {
        self.backend
            .lock()
            .queues
            .get(queue)
            .map_or(0, |state| state.in_flight.len())
    }

    /// Ids of messages dead-lettered on `queue`, in order.
    pub fn dead_letters(&self, queue: &str) -> Vec<MessageId> {
        self.backend
            .lock()
            .queues
            .get(queue)
            .map(|state| state.dead_letters.iter().map(|message| message.id.clone()).collect())
            .unwrap_or_default()
    }

    /// How many times `id` has been delivered.
    pub fn receive_count(&self, id: &MessageId) -> u32 {
        self.backend.lock().receive_counts.get(id).copied().unwrap_or(0)
    }

    /// Every settle call so far, in order.
    pub fn settles(&self) -> Vec<Settle> {
        self.backend.lock().settles.clone()
    }

    /// Settle calls for one message.
    pub fn settles_for(&self, id: &MessageId) -> Vec<SettleAction> {
        self.backend
            .lock()
            .settles
            .iter()
            .filter(|settle| &settle.id == id)
            .map(|settle| settle.action)
            .collect()
    }

    pub fn count(&self, action: SettleAction) -> usize {
        self.backend
            .lock()
            .settles
            .iter()
            .filter(|settle| settle.action == action)
            .count()
    }

    /// Poll until at least `expected` settle calls were recorded.
    pub async fn wait_for_settles(&self, expected: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |queue| queue.settles().len() >= expected).await
    }

    /// Poll `condition` every few milliseconds until it holds or `timeout` passes.
    pub async fn wait_until(&self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn settle(
        &self,
        queue: &str,
        unit: &UnitOfWork,
        action: SettleAction,
    ) -> Result<(), TransportError> {
        let mut backend = self.backend.lock();
        if backend.settle_failures > 0 {
            backend.settle_failures -= 1;
            return Err(TransportError::new(queue, "injected settle failure"));
        }

        let Some(state) = backend.queues.get_mut(queue) else {
            return Err(TransportError::new(queue, "queue does not exist"));
        };
        let Some(message) = state.in_flight.remove(unit.receipt()) else {
            return Err(TransportError::new(
                queue,
                format!("receipt `{}` is not in flight", unit.receipt()),
            ));
        };
        match action {
            SettleAction::Completed => {}
            SettleAction::Rejected => state.ready.push_back(message),
            SettleAction::DeadLettered => state.dead_letters.push(message),
        }

        backend.settles.push(Settle {
            queue: queue.to_string(),
            id: unit.id().clone(),
            action,
        });
        tracing::trace!(queue, message_id = %unit.id(), ?action, "in-memory settle");
        Ok(())
    }
}

struct InMemoryConsumer {
    backend: Arc<Mutex<Backend>>,
    queue_name: String,
}

impl InMemoryConsumer {
    fn queue(&self) -> InMemoryQueue {
        InMemoryQueue {
            backend: self.backend.clone(),
        }
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn fetch(&self, max_batch_size: usize) -> Result<Vec<Delivery>, TransportError> {
        let mut backend = self.backend.lock();
        if let Some(failures) = backend.fetch_failures.get_mut(&self.queue_name) {
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::new(&self.queue_name, "injected fetch failure"));
            }
        }

        let Backend {
            queues,
            receive_counts,
            ..
        } = &mut *backend;
        let state = queues.entry(self.queue_name.clone()).or_default();

        let mut deliveries = Vec::new();
        while deliveries.len() < max_batch_size {
            let Some(mut message) = state.ready.pop_front() else {
                break;
            };
            message.receive_count += 1;
            receive_counts.insert(message.id.clone(), message.receive_count);

            let receipt = format!("{}#{}", message.id, message.receive_count);
            deliveries.push(
                Delivery::new(message.id.clone(), message.body.clone())
                    .with_receipt(receipt.clone())
                    .with_previous_attempts(message.receive_count - 1),
            );
            state.in_flight.insert(receipt, message);
        }
        Ok(deliveries)
    }

    async fn complete(&self, unit: &UnitOfWork) -> Result<(), TransportError> {
        self.queue().settle(&self.queue_name, unit, SettleAction::Completed)
    }

    async fn reject(&self, unit: &UnitOfWork) -> Result<(), TransportError> {
        self.queue().settle(&self.queue_name, unit, SettleAction::Rejected)
    }

    async fn dead_letter(&self, unit: &UnitOfWork) -> Result<(), TransportError> {
        self.queue().settle(&self.queue_name, unit, SettleAction::DeadLettered)
    }
}

#[async_trait]
impl Publisher for InMemoryQueue {
    async fn publish(&self, queue_name: &str, body: String) -> Result<(), TransportError> {
        self.push(queue_name, body);
        Ok(())
    }
}

#[async_trait]
impl QueueAdmin for InMemoryQueue {
    async fn create_queue(&self, name: &str) -> Result<QueueProvision, TransportError> {
        let mut backend = self.backend.lock();
        if backend.queues.contains_key(name) {
            return Ok(QueueProvision::AlreadyExists);
        }
        backend.queues.insert(name.to_string(), QueueState::default());
        Ok(QueueProvision::Created)
    }

    async fn delete_queue(&self, name: &str) -> Result<QueueProvision, TransportError> {
        match self.backend.lock().queues.remove(name) {
            Some(_) => Ok(QueueProvision::Deleted),
            None => Ok(QueueProvision::Missing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reject_redelivers_with_higher_attempt() {
        let queue = InMemoryQueue::new();
        queue.push_with_id("q", "m1", "{}");
        let consumer = queue.consumer("q");

        let first = consumer.fetch(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].previous_attempts, 0);

        let unit = UnitOfWork::new(first[0].clone(), "q", &consumer);
        consumer.reject(&unit).await.unwrap();

        let second = consumer.fetch(10).await.unwrap();
        assert_eq!(second[0].previous_attempts, 1);
        assert_ne!(second[0].receipt, first[0].receipt);
        assert_eq!(queue.receive_count(&MessageId::new("m1")), 2);
    }

    #[tokio::test]
    async fn test_stale_receipt_is_a_transport_error() {
        let queue = InMemoryQueue::new();
        queue.push_with_id("q", "m1", "{}");
        let consumer = queue.consumer("q");
        let delivery = consumer.fetch(1).await.unwrap().remove(0);
        let unit = UnitOfWork::new(delivery, "q", &consumer);

        queue.expire_in_flight("q");
        assert!(consumer.complete(&unit).await.is_err());
        assert_eq!(queue.ready_len("q"), 1);
    }

    #[tokio::test]
    async fn test_admin_reports_existing_and_missing_queues() {
        let queue = InMemoryQueue::new();
        assert_eq!(queue.create_queue("a").await.unwrap(), QueueProvision::Created);
        assert_eq!(queue.create_queue("a").await.unwrap(), QueueProvision::AlreadyExists);
        assert_eq!(queue.delete_queue("a").await.unwrap(), QueueProvision::Deleted);
        assert_eq!(queue.delete_queue("a").await.unwrap(), QueueProvision::Missing);
    }

    #[tokio::test]
    async fn test_injected_fetch_failures() {
        let queue = InMemoryQueue::new();
        queue.push("q", "{}");
        queue.fail_next_fetches("q", 1);
        let consumer = queue.consumer("q");
        assert!(consumer.fetch(1).await.is_err());
        assert_eq!(consumer.fetch(1).await.unwrap().len(), 1);
    }
}
