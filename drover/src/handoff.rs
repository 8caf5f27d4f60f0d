//! Bounded hand-off queue between a consumer strategy and a worker strategy.
//!
//! Capacity is tracked with a semaphore of free slots. Producers claim slots
//! before fetching ([`HandoffQueue::reserve`]), so the fetcher never asks the
//! backend for more units than can be buffered, and a full queue blocks the
//! producer instead of dropping work. Popping an item gives its slot back.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};

/// The queue was closed while waiting for capacity.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
#[error("hand-off queue is closed")]
pub struct HandoffClosed;

pub struct HandoffQueue<T> {
    items: Mutex<VecDeque<T>>,
    free: Semaphore,
    capacity: usize,
    item_ready: Notify,
    emptied: Notify,
    closed: AtomicBool,
}

impl<T> fmt::Debug for HandoffQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> HandoffQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            free: Semaphore::new(capacity),
            capacity,
            item_ready: Notify::new(),
            emptied: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for at least one free slot, then claim up to `max` slots.
    pub async fn reserve(&self, max: usize) -> Result<Reservation<'_, T>, HandoffClosed> {
        let first = self.free.acquire().await.map_err(|_| HandoffClosed)?;
        first.forget();

        let mut slots = 1;
        while slots < max {
            match self.free.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    slots += 1;
                }
                Err(_) => break,
            }
        }
        Ok(Reservation { queue: self, slots })
    }

    /// Push one item, waiting while the queue is full.
    ///
    /// Returns the item back if the queue is closed before a slot frees up.
    pub async fn push(&self, item: T) -> Result<(), T> {
        match self.free.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(item),
        }
        self.enqueue(item);
        Ok(())
    }

    /// Push without waiting; returns the item if the queue is full or closed.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        match self.free.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(item),
        }
        self.enqueue(item);
        Ok(())
    }

    /// Wait for the next item. Returns `None` once closed and empty.
    ///
    /// Cancel safe: an item is only removed when this future resolves.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.item_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let (item, now_empty) = {
            let mut items = self.items.lock();
            let item = items.pop_front()?;
            (item, items.is_empty())
        };
        self.free.add_permits(1);
        if now_empty {
            self.emptied.notify_waiters();
        }
        Some(item)
    }

    /// Wait until every buffered item has been taken (or the queue closes).
    pub async fn wait_until_empty(&self) {
        loop {
            let emptied = self.emptied.notified();
            tokio::pin!(emptied);
            emptied.as_mut().enable();

            if self.is_empty() || self.is_closed() {
                return;
            }
            emptied.await;
        }
    }

    /// Stop accepting new capacity claims and wake every waiter.
    ///
    /// Items already buffered stay available to [`pop`](Self::pop) and
    /// [`drain`](Self::drain); outstanding reservations may still be filled.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.free.close();
        self.item_ready.notify_waiters();
        self.emptied.notify_waiters();
    }

    /// Remove and return every buffered item.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.items.lock().drain(..).collect();
        if !drained.is_empty() {
            self.free.add_permits(drained.len());
            self.emptied.notify_waiters();
        }
        drained
    }

    fn enqueue(&self, item: T) {
        self.items.lock().push_back(item);
        self.item_ready.notify_one();
    }
}

/// Slots claimed by [`HandoffQueue::reserve`]. Unused slots are returned on drop.
#[must_use = "dropping a reservation releases its slots"]
pub struct Reservation<'a, T> {
    queue: &'a HandoffQueue<T>,
    slots: usize,
}

impl<T> fmt::Debug for Reservation<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("slots", &self.slots)
            .finish()
    }
}

impl<T> Reservation<'_, T> {
    /// Slots still claimed and unfilled.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Push into a claimed slot, or wait for a new one once they are used up.
    pub async fn push(&mut self, item: T) -> Result<(), T> {
        if self.slots == 0 {
            return self.queue.push(item).await;
        }
        self.slots -= 1;
        self.queue.enqueue(item);
        Ok(())
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if self.slots > 0 {
            self.queue.free.add_permits(self.slots);
        }
    }
}
