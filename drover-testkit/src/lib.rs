//! Test support for drover: an in-memory queue backend, ready-made jobs and
//! a hook recorder.

mod job;
mod queue;
mod trace;

pub use job::{FailingJob, PanickingJob, SlowJob, TestJob};
pub use queue::{InMemoryQueue, Settle, SettleAction};
pub use trace::HookTrace;

use drover::Context;
use serde_json::{Value, json};
use std::sync::Arc;

/// Encoded payload for `job` with `args`, as a publisher would send it.
pub fn payload(job: &str, args: Vec<Value>) -> String {
    json!({ "class": job, "args": args }).to_string()
}

/// A fresh context with fast timings suited to tests, plus `overrides`.
pub fn test_context(overrides: Value) -> Arc<Context> {
    let context = Context::new().shared();
    context
        .configure(json!({
            "consumer": "memory",
            "worker_strategy": "threaded",
            "num_workers": 2,
            "batch_size": 4,
            "poll_interval_ms": 10,
            "fetch_backoff_ms": 5,
            "max_fetch_backoff_ms": 20,
            "shutdown_timeout_ms": 2_000,
        }))
        .expect("test defaults are valid");
    context.configure(overrides).expect("test overrides are valid");
    context
}
