use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;

use crate::config::{Configuration, ConsumerStrategyKind};
use crate::error::DroverError;
use crate::fetcher::Fetcher;
use crate::handoff::HandoffQueue;
use crate::retry::Backoff;
use crate::runtime::ShutdownToken;
use crate::telemetry;
use crate::unit_of_work::UnitOfWork;

/// Schedule on which a queue's fetcher runs.
///
/// A strategy runs until `shutdown` is cancelled. A fetch already in flight
/// is allowed to finish and its units are still pushed, since capacity for
/// them was reserved before the fetch went out.
#[async_trait]
pub trait ConsumerStrategy: Send + Sync {
    async fn run(
        &self,
        fetcher: Arc<Fetcher>,
        handoff: Arc<HandoffQueue<UnitOfWork>>,
        shutdown: ShutdownToken,
    );
}

/// Build the strategy named by `consumer_strategy`.
pub fn from_config(config: &Configuration) -> Arc<dyn ConsumerStrategy> {
    match config.consumer_strategy {
        ConsumerStrategyKind::Threaded => Arc::new(ThreadedConsumerStrategy::new(config)),
        ConsumerStrategyKind::Single => Arc::new(SingleConsumerStrategy::new(config)),
    }
}

#[derive(Clone, Debug)]
struct Pacing {
    poll_interval: Duration,
    backoff: Backoff,
}

impl Pacing {
    fn new(config: &Configuration) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            backoff: Backoff::from_config(config),
        }
    }
}

/// `threads_per_queue` independent polling loops feeding one hand-off queue.
///
/// Each loop waits for free hand-off capacity, fetches at most that many
/// units, and pushes them. A full hand-off queue therefore stops fetching
/// altogether.
#[derive(Clone, Debug)]
pub struct ThreadedConsumerStrategy {
    loops: usize,
    pacing: Pacing,
}

impl ThreadedConsumerStrategy {
    pub fn new(config: &Configuration) -> Self {
        Self {
            loops: config.threads_per_queue.max(1),
            pacing: Pacing::new(config),
        }
    }

    pub fn loops(&self) -> usize {
        self.loops
    }
}

#[async_trait]
impl ConsumerStrategy for ThreadedConsumerStrategy {
    async fn run(
        &self,
        fetcher: Arc<Fetcher>,
        handoff: Arc<HandoffQueue<UnitOfWork>>,
        shutdown: ShutdownToken,
    ) {
        let mut loops = JoinSet::new();
        for _ in 0..self.loops {
            loops.spawn(poll_loop(
                fetcher.clone(),
                handoff.clone(),
                shutdown.clone(),
                self.pacing.clone(),
                false,
            ));
        }

        while let Some(joined) = loops.join_next().await {
            if let Err(err) = joined {
                tracing::error!(queue = %fetcher.queue_name(), "consumer loop failed: {err}");
            }
        }
    }
}

/// One loop that fetches only after workers have taken every buffered unit.
///
/// Suited to backends where messages sitting in a local buffer would burn
/// their visibility timeout.
#[derive(Clone, Debug)]
pub struct SingleConsumerStrategy {
    pacing: Pacing,
}

impl SingleConsumerStrategy {
    pub fn new(config: &Configuration) -> Self {
        Self {
            pacing: Pacing::new(config),
        }
    }
}

#[async_trait]
impl ConsumerStrategy for SingleConsumerStrategy {
    async fn run(
        &self,
        fetcher: Arc<Fetcher>,
        handoff: Arc<HandoffQueue<UnitOfWork>>,
        shutdown: ShutdownToken,
    ) {
        poll_loop(fetcher, handoff, shutdown, self.pacing.clone(), true).await;
    }
}

async fn poll_loop(
    fetcher: Arc<Fetcher>,
    handoff: Arc<HandoffQueue<UnitOfWork>>,
    shutdown: ShutdownToken,
    pacing: Pacing,
    wait_for_empty: bool,
) {
    let queue = fetcher.queue_name().to_string();
    let mut backoff = pacing.backoff.clone();

    loop {
        if wait_for_empty {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = handoff.wait_until_empty() => {}
            }
        }

        let mut reservation = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            reservation = handoff.reserve(fetcher.batch_size()) => match reservation {
                Ok(reservation) => reservation,
                Err(_) => break,
            },
        };

        let fetched = tokio::select! {
            biased;
            _ = shutdown.forced() => {
                tracing::debug!(queue = %queue, "forced shutdown, dropping in-progress fetch");
                break;
            }
            fetched = fetcher.fetch(reservation.slots()) => fetched,
        };

        let pause = match fetched {
            Ok(units) if units.is_empty() => {
                backoff.reset();
                Some(pacing.poll_interval)
            }
            Ok(units) => {
                backoff.reset();
                for unit in units {
                    if let Err(mut unit) = reservation.push(unit).await {
                        tracing::warn!(
                            queue = %queue,
                            message_id = %unit.id(),
                            "hand-off closed, returning unit"
                        );
                        if let Err(err) = unit.reject().await {
                            tracing::warn!(queue = %queue, "could not return unit: {err}");
                        }
                    }
                }
                telemetry::set_handoff_depth(&queue, handoff.len());
                None
            }
            Err(err) => {
                if let DroverError::Transport(transport) = &err {
                    telemetry::record_transport_error(&queue, "fetch", transport);
                }
                let delay = backoff.next_delay();
                tracing::warn!(
                    queue = %queue,
                    failures = backoff.failures(),
                    "fetch failed, retrying in {delay:?}: {err}"
                );
                Some(delay)
            }
        };
        drop(reservation);

        if let Some(pause) = pause {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    tracing::debug!(queue = %queue, "consumer loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::Consumer;
    use crate::context::Context;
    use crate::error::TransportError;
    use crate::unit_of_work::Delivery;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    /// Endless queue that can be told to fail its first few fetches.
    struct Endless {
        fetched: AtomicUsize,
        calls: AtomicUsize,
        failures_left: Mutex<usize>,
    }

    impl Endless {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                fetched: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                failures_left: Mutex::new(failures),
            })
        }
    }

    #[async_trait]
    impl Consumer for Endless {
        fn queue_name(&self) -> &str {
            "endless"
        }

        async fn fetch(&self, max: usize) -> std::result::Result<Vec<Delivery>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut failures = self.failures_left.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(TransportError::new("endless", "connection reset"));
                }
            }
            let start = self.fetched.fetch_add(max, Ordering::SeqCst);
            Ok((start..start + max)
                .map(|n| Delivery::new(format!("m{n}"), "{}"))
                .collect())
        }

        async fn complete(&self, _unit: &UnitOfWork) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn reject(&self, _unit: &UnitOfWork) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    fn setup(
        overrides: serde_json::Value,
        failures: usize,
    ) -> (Arc<Endless>, Arc<Fetcher>, Configuration) {
        let context = Context::new().shared();
        context.configure(overrides).unwrap();
        let consumer = Endless::new(failures);
        let fetcher = Arc::new(Fetcher::new(consumer.clone(), context.clone()));
        (consumer, fetcher, context.config())
    }

    async fn settle_down() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_threaded_fetching_stops_at_handoff_capacity() {
        let (consumer, fetcher, config) =
            setup(json!({ "batch_size": 2, "threads_per_queue": 2 }), 0);
        let handoff = Arc::new(HandoffQueue::new(3));
        let shutdown = ShutdownToken::new();
        let strategy = ThreadedConsumerStrategy::new(&config);
        assert_eq!(strategy.loops(), 2);

        let run = {
            let (handoff, shutdown) = (handoff.clone(), shutdown.clone());
            tokio::spawn(async move { strategy.run(fetcher, handoff, shutdown).await })
        };
        settle_down().await;

        assert_eq!(handoff.len(), 3);
        assert_eq!(consumer.fetched.load(Ordering::SeqCst), 3);

        // Taking one unit frees exactly one slot for the next fetch.
        handoff.pop().await.unwrap();
        settle_down().await;
        assert_eq!(consumer.fetched.load(Ordering::SeqCst), 4);

        shutdown.cancel();
        timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transport_errors_back_off_then_recover() {
        let (consumer, fetcher, config) = setup(
            json!({ "batch_size": 1, "fetch_backoff_ms": 5, "max_fetch_backoff_ms": 10 }),
            3,
        );
        let handoff = Arc::new(HandoffQueue::new(1));
        let shutdown = ShutdownToken::new();
        let strategy = ThreadedConsumerStrategy::new(&config);

        let run = {
            let (handoff, shutdown) = (handoff.clone(), shutdown.clone());
            tokio::spawn(async move { strategy.run(fetcher, handoff, shutdown).await })
        };

        let unit = timeout(Duration::from_secs(1), handoff.pop()).await.unwrap().unwrap();
        assert_eq!(unit.id().as_str(), "m0");
        assert!(consumer.calls.load(Ordering::SeqCst) >= 4);

        shutdown.cancel();
        timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_single_strategy_waits_for_workers_to_drain() {
        let (consumer, fetcher, config) = setup(json!({ "batch_size": 2 }), 0);
        let handoff = Arc::new(HandoffQueue::new(10));
        let shutdown = ShutdownToken::new();
        let strategy = SingleConsumerStrategy::new(&config);

        let run = {
            let (handoff, shutdown) = (handoff.clone(), shutdown.clone());
            tokio::spawn(async move { strategy.run(fetcher, handoff, shutdown).await })
        };
        settle_down().await;
        assert_eq!(consumer.fetched.load(Ordering::SeqCst), 2);
        assert_eq!(handoff.len(), 2);

        handoff.pop().await.unwrap();
        settle_down().await;
        assert_eq!(consumer.fetched.load(Ordering::SeqCst), 2);

        handoff.pop().await.unwrap();
        settle_down().await;
        assert_eq!(consumer.fetched.load(Ordering::SeqCst), 4);

        shutdown.cancel();
        timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_releases_loop_blocked_on_full_handoff() {
        let (_consumer, fetcher, config) = setup(json!({ "batch_size": 1 }), 0);
        let handoff = Arc::new(HandoffQueue::new(1));
        let shutdown = ShutdownToken::new();

        let run = {
            let (handoff, shutdown) = (handoff.clone(), shutdown.clone());
            let strategy = from_config(&config);
            tokio::spawn(async move { strategy.run(fetcher, handoff, shutdown).await })
        };
        settle_down().await;
        assert_eq!(handoff.len(), 1);

        shutdown.cancel();
        timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
        assert_eq!(handoff.len(), 1);
    }
}
