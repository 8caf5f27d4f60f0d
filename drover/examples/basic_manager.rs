//! Basic manager example with the in-memory queue.
//!
//! Publishes a handful of jobs, runs them with the forked worker strategy
//! (each batch in a child process re-launched from this binary) and shuts
//! down once every message is settled.
//!
//! Run with `cargo run --example basic_manager`. Set
//! `DROVER_DEMO_STRATEGY=threaded` to run jobs on threads instead.

use std::sync::Arc;
use std::time::Duration;

use drover::*;
use drover_testkit::InMemoryQueue;
use serde_json::{Value, json};

/// Prints a greeting for its first argument.
struct Greet;

impl Job for Greet {
    fn name(&self) -> &str {
        "Greet"
    }

    fn options(&self) -> JobOptions {
        JobOptions::new("greetings").with_max_attempts(MaxAttempts::limited(3).expect("non-zero"))
    }

    fn perform(&self, args: &[Value]) -> anyhow::Result<()> {
        let name = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("Greet needs a name"))?;
        eprintln!("[pid {}] hello, {name}", std::process::id());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let strategy = std::env::var("DROVER_DEMO_STRATEGY").unwrap_or_else(|_| "forked".to_string());
    let queue = InMemoryQueue::new();

    let manager = ManagerBuilder::new()
        .configure(json!({
            "consumer": "memory",
            "worker_strategy": strategy,
            "num_workers": 2,
            "threads_per_queue": 1,
            "batch_size": 3,
            "poll_interval_ms": 50,
            "log_level": "info",
        }))?
        .register(Greet)?
        .with_consumer_factory("memory", queue.factory())
        .build()?;

    // A forked child only runs the batch it was handed on stdin.
    if ForkedChild::is_child() {
        manager.run().await?;
        return Ok(());
    }

    telemetry::init_tracing(&manager.context().config());

    let publisher = manager.publisher(Arc::new(queue.clone()));
    let names = ["Ada", "Grace", "Barbara", "Edsger", "Frances"];
    for name in names {
        publisher.publish("Greet", vec![json!(name)]).await?;
    }
    // No name: fails three times, then is dead-lettered.
    publisher.publish("Greet", vec![]).await?;

    manager.start().await?;
    let settled = queue
        .wait_until(Duration::from_secs(30), |queue| {
            queue.count(drover_testkit::SettleAction::Completed) == names.len()
                && queue.dead_letters("greetings").len() == 1
        })
        .await;

    let report = manager.shutdown().await;
    println!(
        "settled everything: {settled}; completed: {}, dead-lettered: {}, returned: {}",
        queue.count(drover_testkit::SettleAction::Completed),
        queue.dead_letters("greetings").len(),
        report.returned,
    );
    std::process::exit(report.exit_code());
}
