use std::sync::Arc;

use tracing::Instrument;

use crate::consumer::Consumer;
use crate::context::Context;
use crate::error::{DroverError, Result};
use crate::hooks::{HookArgs, events};
use crate::telemetry;
use crate::unit_of_work::UnitOfWork;

/// Issues batched fetches against one consumer.
///
/// Each fetch runs the `before_fetch` hooks, asks the backend for at most
/// `min(max, batch_size)` messages, wraps them into [`UnitOfWork`]s that hold
/// a weak reference back to the consumer, and runs the `after_fetch` hooks.
/// A `before_fetch` veto skips the backend call and returns an empty batch.
pub struct Fetcher {
    consumer: Arc<dyn Consumer>,
    context: Arc<Context>,
    queue_name: String,
    batch_size: usize,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("queue_name", &self.queue_name)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    pub fn new(consumer: Arc<dyn Consumer>, context: Arc<Context>) -> Self {
        let batch_size = context.config().batch_size.max(1);
        let queue_name = consumer.queue_name().to_string();
        Self {
            consumer,
            context,
            queue_name,
            batch_size,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn consumer(&self) -> &Arc<dyn Consumer> {
        &self.consumer
    }

    /// Fetch up to `max` units (capped at `batch_size`).
    ///
    /// Transport failures and hook errors are returned; the caller decides
    /// whether to back off and retry.
    pub async fn fetch(&self, max: usize) -> Result<Vec<UnitOfWork>> {
        let limit = max.min(self.batch_size);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let hooks = self.context.hooks();
        let before = HookArgs::Fetch {
            queue_name: &self.queue_name,
            batch_size: limit,
        };
        let proceed = hooks
            .run_hooks_for(events::BEFORE_FETCH, &before)
            .map_err(|err| DroverError::hook(events::BEFORE_FETCH, err))?;
        if !proceed {
            tracing::debug!(queue = %self.queue_name, "fetch vetoed by before_fetch hook");
            return Ok(Vec::new());
        }

        let deliveries = self
            .consumer
            .fetch(limit)
            .instrument(telemetry::fetch_span(&self.queue_name, limit))
            .await?;

        let units: Vec<UnitOfWork> = deliveries
            .into_iter()
            .map(|delivery| UnitOfWork::new(delivery, self.queue_name.as_str(), &self.consumer))
            .collect();
        telemetry::record_fetched(&self.queue_name, units.len());

        let after = HookArgs::Fetched {
            queue_name: &self.queue_name,
            count: units.len(),
        };
        if let Err(err) = hooks.run_hooks_for(events::AFTER_FETCH, &after) {
            self.give_back(units).await;
            return Err(DroverError::hook(events::AFTER_FETCH, err));
        }

        Ok(units)
    }

    // Fetched units the caller will never see go straight back to the queue.
    async fn give_back(&self, units: Vec<UnitOfWork>) {
        for mut unit in units {
            if let Err(err) = unit.reject().await {
                tracing::warn!(
                    queue = %self.queue_name,
                    message_id = %unit.id(),
                    "could not return fetched unit: {err}"
                );
            }
        }
    }
}
