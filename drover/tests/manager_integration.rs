//! Manager integration tests against the in-memory backend.
//!
//! Covers end-to-end processing, retries and dead-lettering, hook ordering,
//! slot crash recovery, graceful and forced shutdown, signal escalation,
//! publishing and queue provisioning.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use drover::*;
use drover_testkit::{
    FailingJob, HookTrace, InMemoryQueue, PanickingJob, SettleAction, SlowJob, TestJob, payload,
    test_context,
};
use futures::channel::mpsc;
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

fn manager(queue: &InMemoryQueue, context: Arc<Context>, jobs: JobRegistry) -> Manager {
    ManagerBuilder::new()
        .with_context(context)
        .with_jobs(jobs)
        .with_consumer_factory("memory", queue.factory())
        .build()
        .unwrap()
}

fn jobs_with<J: Job>(job: J) -> JobRegistry {
    let mut jobs = JobRegistry::new();
    jobs.register(job).unwrap();
    jobs
}

#[tokio::test]
async fn test_jobs_complete_end_to_end() {
    let queue = InMemoryQueue::new();
    let echo = TestJob::new("Echo", "default");
    for n in 0..10 {
        queue.push("default", payload("Echo", vec![json!(n)]));
    }

    let manager = manager(&queue, test_context(json!({})), jobs_with(echo.clone()));
    manager.start().await.unwrap();
    assert!(queue.wait_for_settles(10, WAIT).await);

    let report = manager.shutdown().await;
    assert!(report.is_clean());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(queue.count(SettleAction::Completed), 10);
    assert_eq!(echo.run_count(), 10);
    assert_eq!(queue.ready_len("default") + queue.in_flight_len("default"), 0);
}

#[tokio::test]
async fn test_single_consumer_strategy_processes_everything() {
    let queue = InMemoryQueue::new();
    let echo = TestJob::new("Echo", "default");
    for n in 0..9 {
        queue.push("default", payload("Echo", vec![json!(n)]));
    }

    let context = test_context(json!({ "consumer_strategy": "single", "batch_size": 2 }));
    let manager = manager(&queue, context, jobs_with(echo.clone()));
    manager.start().await.unwrap();
    assert!(queue.wait_for_settles(9, WAIT).await);
    manager.shutdown().await;

    assert_eq!(echo.run_count(), 9);
}

#[tokio::test]
async fn test_failures_are_rejected_until_attempts_exhausted() {
    let queue = InMemoryQueue::new();
    let job = FailingJob::always("Broken", "default")
        .with_max_attempts(MaxAttempts::limited(3).unwrap());
    let id = queue.push("default", payload("Broken", vec![]));

    let context = test_context(json!({}));
    let trace = HookTrace::new();
    trace.attach(
        context.hooks(),
        &[events::ON_FAILURE, events::ON_FAILURE_EXHAUSTED],
    );

    let manager = manager(&queue, context, jobs_with(job.clone()));
    manager.start().await.unwrap();
    assert!(
        queue
            .wait_until(WAIT, |queue| queue.dead_letters("default").len() == 1)
            .await
    );
    manager.shutdown().await;

    assert_eq!(
        queue.settles_for(&id),
        vec![SettleAction::Rejected, SettleAction::Rejected, SettleAction::DeadLettered]
    );
    assert_eq!(queue.receive_count(&id), 3);
    assert_eq!(job.attempts(), 3);
    assert_eq!(trace.count(events::ON_FAILURE), 3);
    assert_eq!(trace.count(events::ON_FAILURE_EXHAUSTED), 1);
}

#[tokio::test]
async fn test_one_worker_batch_of_two_with_two_attempts() {
    let queue = InMemoryQueue::new();
    let good = TestJob::new("A", "default");
    let bad = FailingJob::always("B", "default");
    let a = queue.push("default", payload("A", vec![]));
    let b = queue.push("default", payload("B", vec![]));

    let mut jobs = JobRegistry::new();
    jobs.register(good.clone()).unwrap();
    jobs.register(bad.clone()).unwrap();

    let context = test_context(json!({ "batch_size": 2, "num_workers": 1, "max_attempts": 2 }));
    let manager = manager(&queue, context, jobs);
    manager.start().await.unwrap();
    assert!(queue.wait_for_settles(3, WAIT).await);
    manager.shutdown().await;

    assert_eq!(queue.settles_for(&a), vec![SettleAction::Completed]);
    assert_eq!(
        queue.settles_for(&b),
        vec![SettleAction::Rejected, SettleAction::DeadLettered]
    );
    assert_eq!(good.run_count(), 1);
    assert_eq!(bad.attempts(), 2);
}

#[tokio::test]
async fn test_flaky_job_succeeds_on_redelivery() {
    let queue = InMemoryQueue::new();
    let job = FailingJob::times("Flaky", "default", 1);
    let id = queue.push("default", payload("Flaky", vec![]));

    let manager = manager(&queue, test_context(json!({})), jobs_with(job));
    manager.start().await.unwrap();
    assert!(queue.wait_for_settles(2, WAIT).await);
    manager.shutdown().await;

    assert_eq!(
        queue.settles_for(&id),
        vec![SettleAction::Rejected, SettleAction::Completed]
    );
}

#[tokio::test]
async fn test_undecodable_and_unknown_messages_fire_on_rejected() {
    let queue = InMemoryQueue::new();
    queue.push("default", "not json at all");
    queue.push("default", payload("Ghost", vec![]));

    let context = test_context(json!({ "max_attempts": 1 }));
    let trace = HookTrace::new();
    trace.attach(context.hooks(), &[events::ON_REJECTED, events::ON_FAILURE_EXHAUSTED]);

    let manager = manager(&queue, context, jobs_with(TestJob::new("Echo", "default")));
    manager.start().await.unwrap();
    assert!(queue.wait_for_settles(2, WAIT).await);
    manager.shutdown().await;

    assert_eq!(trace.count(events::ON_REJECTED), 2);
    assert_eq!(trace.count(events::ON_FAILURE_EXHAUSTED), 2);
    assert_eq!(queue.dead_letters("default").len(), 2);
}

#[tokio::test]
async fn test_perform_hooks_wrap_job_in_order() {
    let queue = InMemoryQueue::new();
    queue.push_with_id("default", "m1", payload("Echo", vec![]));

    let context = test_context(json!({ "num_workers": 1 }));
    let trace = HookTrace::new();
    trace.attach_around(context.hooks(), events::AROUND_PERFORM, "around");
    trace.attach(
        context.hooks(),
        &[events::BEFORE_PERFORM, events::AFTER_PERFORM, events::AFTER_FETCH],
    );

    let manager = manager(&queue, context, jobs_with(TestJob::new("Echo", "default")));
    manager.start().await.unwrap();
    assert!(queue.wait_for_settles(1, WAIT).await);
    manager.shutdown().await;

    let perform: Vec<String> = trace
        .entries()
        .into_iter()
        .filter(|entry| !entry.starts_with(events::AFTER_FETCH))
        .collect();
    assert_eq!(
        perform,
        vec!["around:enter", "before_perform:m1", "after_perform:m1", "around:exit"]
    );
    assert!(trace.contains("after_fetch:1"));
}

#[tokio::test]
async fn test_before_perform_veto_abandons_unit() {
    let queue = InMemoryQueue::new();
    let echo = TestJob::new("Echo", "default");
    queue.push("default", payload("Echo", vec![]));

    let context = test_context(json!({}));
    context
        .hooks()
        .add_hook(events::BEFORE_PERFORM, |_: &HookArgs<'_>| false);

    let manager = manager(&queue, context, jobs_with(echo.clone()));
    manager.start().await.unwrap();
    assert!(
        queue
            .wait_until(WAIT, |queue| queue.in_flight_len("default") == 1)
            .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = manager.shutdown().await;

    assert!(report.is_clean());
    assert_eq!(echo.run_count(), 0);
    assert!(queue.settles().is_empty());
    assert_eq!(queue.in_flight_len("default"), 1);
}

#[tokio::test]
async fn test_transport_failures_are_retried() {
    let queue = InMemoryQueue::new();
    queue.push("default", payload("Echo", vec![]));
    queue.fail_next_fetches("default", 3);
    queue.fail_next_settles(1);

    let echo = TestJob::new("Echo", "default");
    let manager = manager(&queue, test_context(json!({})), jobs_with(echo));
    manager.start().await.unwrap();
    assert!(queue.wait_for_settles(1, WAIT).await);
    manager.shutdown().await;

    assert_eq!(queue.count(SettleAction::Completed), 1);
}

#[tokio::test]
async fn test_panicking_job_crashes_slot_which_is_respawned() {
    let queue = InMemoryQueue::new();
    queue.push_with_id("default", "bad", payload("Boom", vec![]));
    let good = queue.push("default", payload("Echo", vec![]));

    let context = test_context(json!({ "num_workers": 1, "batch_size": 1 }));
    let trace = HookTrace::new();
    trace.attach(context.hooks(), &[events::BEFORE_SLOT_START]);

    let echo = TestJob::new("Echo", "default");
    let mut jobs = jobs_with(echo.clone());
    jobs.register(PanickingJob::new("Boom", "default")).unwrap();

    let manager = manager(&queue, context, jobs);
    manager.start().await.unwrap();
    assert!(queue.wait_for_settles(1, WAIT).await);
    let report = manager.shutdown().await;

    assert_eq!(queue.settles_for(&good), vec![SettleAction::Completed]);
    assert_eq!(report.slot_crashes, 1);
    assert!(report.is_clean());
    assert!(trace.count(events::BEFORE_SLOT_START) >= 2);
    // The crashed unit is left to the visibility timeout.
    assert_eq!(queue.in_flight_len("default"), 1);
}

#[tokio::test]
async fn test_graceful_shutdown_finishes_in_flight_and_returns_buffered_units() {
    let queue = InMemoryQueue::new();
    let slow = SlowJob::new("Slow", "default", Duration::from_millis(300));
    for _ in 0..4 {
        queue.push("default", payload("Slow", vec![]));
    }

    let context = test_context(json!({ "num_workers": 1, "batch_size": 4 }));
    let trace = HookTrace::new();
    trace.attach(context.hooks(), &[events::BEFORE_SHUTDOWN]);

    let manager = manager(&queue, context, jobs_with(slow.clone()));
    manager.start().await.unwrap();
    assert!(
        queue
            .wait_until(WAIT, |queue| queue.in_flight_len("default") == 4)
            .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = manager.shutdown().await;
    assert!(report.is_clean());
    assert_eq!(report.returned, 3);
    assert_eq!(slow.finished(), 1);
    assert_eq!(queue.count(SettleAction::Completed), 1);
    assert_eq!(queue.count(SettleAction::Rejected), 3);
    assert_eq!(queue.ready_len("default"), 3);
    assert_eq!(trace.entries(), vec!["before_shutdown:graceful"]);
}

#[tokio::test]
async fn test_forced_shutdown_abandons_in_flight_units() {
    let queue = InMemoryQueue::new();
    let slow = SlowJob::new("Slow", "default", Duration::from_millis(500));
    let id = queue.push("default", payload("Slow", vec![]));

    let context = test_context(json!({ "num_workers": 1 }));
    let trace = HookTrace::new();
    trace.attach(context.hooks(), &[events::BEFORE_SHUTDOWN]);

    let manager = manager(&queue, context, jobs_with(slow));
    manager.start().await.unwrap();
    assert!(
        queue
            .wait_until(WAIT, |queue| queue.in_flight_len("default") == 1)
            .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = manager.force_shutdown().await;
    assert_eq!(report.abandoned, vec![id]);
    assert_eq!(report.exit_code(), 1);
    assert!(matches!(
        report.as_error(),
        Some(DroverError::ShutdownTimeout { abandoned: 1 })
    ));
    assert!(queue.settles().is_empty());
    assert_eq!(trace.entries(), vec!["before_shutdown:forced"]);
}

#[tokio::test]
async fn test_shutdown_timeout_forces_stragglers() {
    let queue = InMemoryQueue::new();
    let slow = SlowJob::new("Slow", "default", Duration::from_millis(600));
    queue.push("default", payload("Slow", vec![]));

    let context = test_context(json!({ "num_workers": 1, "shutdown_timeout_ms": 100 }));
    let manager = manager(&queue, context, jobs_with(slow));
    manager.start().await.unwrap();
    assert!(
        queue
            .wait_until(WAIT, |queue| queue.in_flight_len("default") == 1)
            .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = manager.shutdown().await;
    assert!(report.timed_out);
    assert_eq!(report.abandoned.len(), 1);
}

#[tokio::test]
async fn test_publisher_targets_prefixed_queue() {
    let queue = InMemoryQueue::new();
    let echo = TestJob::new("Echo", "default");
    let context = test_context(json!({ "queue_prefix": "staging" }));
    let manager = manager(&queue, context, jobs_with(echo.clone()));

    let publisher = manager.publisher(Arc::new(queue.clone()));
    let target = publisher.publish("Echo", vec![json!("hi")]).await.unwrap();
    assert_eq!(target, "staging_default");
    assert!(publisher.publish("Nope", vec![]).await.is_err());

    manager.start().await.unwrap();
    assert!(queue.wait_for_settles(1, WAIT).await);
    manager.shutdown().await;

    assert_eq!(echo.runs(), vec![vec![json!("hi")]]);
}

#[tokio::test]
async fn test_queue_provisioning_uses_prefixed_names() {
    let queue = InMemoryQueue::new();
    let context = test_context(json!({ "queue_prefix": "prod" }));
    let mut jobs = jobs_with(TestJob::new("Echo", "mailer"));
    jobs.register(TestJob::new("Resize", "images")).unwrap();
    let manager = manager(&queue, context, jobs);

    let created = manager.create_queues(&queue).await.unwrap();
    assert_eq!(
        created,
        vec![
            ("prod_images".to_string(), QueueProvision::Created),
            ("prod_mailer".to_string(), QueueProvision::Created),
        ]
    );
    let again = manager.create_queues(&queue).await.unwrap();
    assert!(again.iter().all(|(_, outcome)| *outcome == QueueProvision::AlreadyExists));

    let deleted = manager.delete_queues(&queue).await.unwrap();
    assert!(deleted.iter().all(|(_, outcome)| *outcome == QueueProvision::Deleted));
}

#[tokio::test]
async fn test_manager_without_jobs_fails_fast() {
    let queue = InMemoryQueue::new();
    let manager = manager(&queue, test_context(json!({})), JobRegistry::new());

    assert!(matches!(
        manager.create_queues(&queue).await,
        Err(DroverError::Configuration(_))
    ));
    assert!(matches!(manager.start().await, Err(DroverError::Configuration(_))));
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let queue = InMemoryQueue::new();
    let echo = TestJob::new("Echo", "default");
    let manager = manager(&queue, test_context(json!({})), jobs_with(echo));
    manager.start().await.unwrap();
    assert!(manager.start().await.is_err());
    manager.shutdown().await;
}

/// A backend whose fetch never returns within a test's lifetime.
struct StalledConsumer {
    queue_name: String,
    fetching: Arc<AtomicBool>,
}

#[async_trait]
impl Consumer for StalledConsumer {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn fetch(&self, _max: usize) -> Result<Vec<Delivery>, TransportError> {
        self.fetching.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }

    async fn complete(&self, _unit: &UnitOfWork) -> Result<(), TransportError> {
        Ok(())
    }

    async fn reject(&self, _unit: &UnitOfWork) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_forced_shutdown_does_not_wait_for_stalled_fetch() {
    let fetching = Arc::new(AtomicBool::new(false));
    let flag = fetching.clone();
    let factory = move |name: &str| -> Result<Arc<dyn Consumer>, TransportError> {
        Ok(Arc::new(StalledConsumer {
            queue_name: name.to_string(),
            fetching: flag.clone(),
        }))
    };

    let manager = ManagerBuilder::new()
        .with_context(test_context(json!({ "shutdown_timeout_ms": 50 })))
        .with_jobs(jobs_with(TestJob::new("Echo", "default")))
        .with_consumer_factory("memory", factory)
        .build()
        .unwrap();
    manager.start().await.unwrap();

    let deadline = Instant::now() + WAIT;
    while !fetching.load(Ordering::SeqCst) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(fetching.load(Ordering::SeqCst));

    let started = Instant::now();
    let report = tokio::time::timeout(Duration::from_secs(2), manager.force_shutdown())
        .await
        .expect("forced shutdown waited for the fetch");
    assert!(report.is_clean());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_second_signal_escalates_graceful_drain() {
    let queue = InMemoryQueue::new();
    let slow = SlowJob::new("Slow", "default", Duration::from_millis(1_500));
    let id = queue.push("default", payload("Slow", vec![]));

    let context = test_context(json!({ "num_workers": 1, "shutdown_timeout_ms": 10_000 }));
    let trace = HookTrace::new();
    trace.attach(context.hooks(), &[events::BEFORE_SHUTDOWN]);
    let manager = manager(&queue, context, jobs_with(slow.clone()));

    let (signals, received) = mpsc::unbounded();
    let operator = async {
        assert!(
            queue
                .wait_until(WAIT, |queue| queue.in_flight_len("default") == 1)
                .await
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        signals.unbounded_send(ShutdownSignal::Interrupt).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        signals.unbounded_send(ShutdownSignal::Terminate).unwrap();
        Instant::now()
    };

    let (report, escalated_at) = tokio::join!(manager.run_until(received), operator);
    let report = report.unwrap();

    assert!(escalated_at.elapsed() < Duration::from_millis(1_200));
    assert_eq!(report.abandoned, vec![id]);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(slow.finished(), 0);
    assert_eq!(trace.entries(), vec!["before_shutdown:graceful"]);
}

#[tokio::test]
async fn test_quit_signal_forces_immediately() {
    let queue = InMemoryQueue::new();
    let context = test_context(json!({}));
    let trace = HookTrace::new();
    trace.attach(context.hooks(), &[events::BEFORE_SHUTDOWN]);
    let manager = manager(&queue, context, jobs_with(TestJob::new("Echo", "default")));

    let report = manager
        .run_until(futures::stream::iter([ShutdownSignal::Quit]))
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(trace.entries(), vec!["before_shutdown:forced"]);
}
