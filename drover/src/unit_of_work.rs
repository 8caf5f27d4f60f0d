use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consumer::Consumer;
use crate::error::{DroverError, Result};

/// Queue-assigned identifier of a message.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A raw message as returned by a queue backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Delivery {
    /// Backend message identifier.
    pub id: MessageId,
    /// Handle the backend needs to acknowledge or release this delivery.
    pub receipt: String,
    /// Message body.
    pub body: String,
    /// Times this message was delivered before this delivery.
    pub previous_attempts: u32,
}

impl Delivery {
    /// A first delivery whose receipt handle is its id.
    pub fn new(id: impl Into<MessageId>, body: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            receipt: id.to_string(),
            id,
            body: body.into(),
            previous_attempts: 0,
        }
    }

    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = receipt.into();
        self
    }

    pub fn with_previous_attempts(mut self, previous_attempts: u32) -> Self {
        self.previous_attempts = previous_attempts;
        self
    }
}

/// Lifecycle state of a [`UnitOfWork`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Fetched and not yet settled.
    Pending,
    /// Acknowledged; the backend will not redeliver it.
    Completed,
    /// Released for immediate redelivery.
    Rejected,
    /// Failed on its last allowed attempt and dropped or dead-lettered.
    Exhausted,
    /// Left to the backend's visibility timeout.
    Abandoned,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UnitState::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::Completed => "completed",
            UnitState::Rejected => "rejected",
            UnitState::Exhausted => "exhausted",
            UnitState::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fetched message plus its delivery handle and attempt count.
///
/// A unit is created by the [`Fetcher`](crate::Fetcher), moved into a worker
/// strategy, and settled exactly once. The consumer reference is weak and is
/// only used to acknowledge, reject or dead-letter this unit; settling a unit
/// twice reports [`DroverError::AlreadySettled`] without touching the backend.
pub struct UnitOfWork {
    id: MessageId,
    queue_name: String,
    message: String,
    receipt: String,
    previous_attempts: u32,
    fetched_at: DateTime<Utc>,
    consumer: Weak<dyn Consumer>,
    state: UnitState,
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("queue_name", &self.queue_name)
            .field("previous_attempts", &self.previous_attempts)
            .field("fetched_at", &self.fetched_at)
            .field("consumer_alive", &(self.consumer.strong_count() > 0))
            .field("state", &self.state)
            .finish()
    }
}

impl UnitOfWork {
    /// Wrap a backend delivery, keeping a weak reference to its consumer.
    pub fn new(
        delivery: Delivery,
        queue_name: impl Into<String>,
        consumer: &Arc<dyn Consumer>,
    ) -> Self {
        Self {
            id: delivery.id,
            queue_name: queue_name.into(),
            message: delivery.body,
            receipt: delivery.receipt,
            previous_attempts: delivery.previous_attempts,
            fetched_at: Utc::now(),
            consumer: Arc::downgrade(consumer),
            state: UnitState::Pending,
        }
    }

    /// Rebuild a unit shipped to another process, bound to a local consumer.
    pub fn from_wire(wire: WireUnit, consumer: &Arc<dyn Consumer>) -> Self {
        let delivery = Delivery {
            id: wire.id,
            receipt: wire.receipt,
            body: wire.message,
            previous_attempts: wire.previous_attempts,
        };
        Self::new(delivery, wire.queue_name, consumer)
    }

    /// Serializable copy without the consumer reference.
    pub fn to_wire(&self) -> WireUnit {
        WireUnit {
            id: self.id.clone(),
            queue_name: self.queue_name.clone(),
            message: self.message.clone(),
            receipt: self.receipt.clone(),
            previous_attempts: self.previous_attempts,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn receipt(&self) -> &str {
        &self.receipt
    }

    pub fn previous_attempts(&self) -> u32 {
        self.previous_attempts
    }

    /// The attempt this delivery represents: `previous_attempts + 1`.
    pub fn current_attempt(&self) -> u32 {
        self.previous_attempts.saturating_add(1)
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn is_settled(&self) -> bool {
        self.state.is_terminal()
    }

    /// Acknowledge the unit so the backend never redelivers it.
    pub async fn complete(&mut self) -> Result<()> {
        let consumer = self.settle_target()?;
        consumer.complete(self).await?;
        self.state = UnitState::Completed;
        Ok(())
    }

    /// Ask the backend to make the message available again right away.
    pub async fn reject(&mut self) -> Result<()> {
        let consumer = self.settle_target()?;
        consumer.reject(self).await?;
        self.state = UnitState::Rejected;
        Ok(())
    }

    /// Drop the message, or route it to a dead-letter path if the backend has one.
    pub async fn dead_letter(&mut self) -> Result<()> {
        let consumer = self.settle_target()?;
        consumer.dead_letter(self).await?;
        self.state = UnitState::Exhausted;
        Ok(())
    }

    /// Give up on the unit without telling the backend.
    pub fn abandon(&mut self) -> Result<()> {
        self.ensure_pending()?;
        self.state = UnitState::Abandoned;
        Ok(())
    }

    fn ensure_pending(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(DroverError::AlreadySettled {
                id: self.id.clone(),
                state: self.state,
            });
        }
        Ok(())
    }

    fn settle_target(&self) -> Result<Arc<dyn Consumer>> {
        self.ensure_pending()?;
        self.consumer.upgrade().ok_or_else(|| DroverError::ConsumerGone {
            queue: self.queue_name.clone(),
        })
    }
}

/// Serializable form of a unit, used to hand work to a child process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireUnit {
    pub id: MessageId,
    pub queue_name: String,
    pub message: String,
    pub receipt: String,
    pub previous_attempts: u32,
}
