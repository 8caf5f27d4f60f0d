//! Drover - queue-backed background job processing.
//!
//! Drover pulls messages from a queue backend, turns each into a job
//! invocation, runs it under a chosen concurrency model, and acknowledges or
//! rejects it on the backend depending on the outcome. Delivery is
//! at-least-once: a job may run more than once and should be idempotent.
//!
//! # Core Concepts
//!
//! - **UnitOfWork**: one fetched message plus its lifecycle state. A unit is
//!   settled exactly once, by [`UnitOfWork::complete`],
//!   [`UnitOfWork::reject`], [`UnitOfWork::dead_letter`] or
//!   [`UnitOfWork::abandon`].
//!
//! - **Consumer**: the [`Consumer`] trait abstracts a queue backend's fetch,
//!   acknowledge and reject calls. Backends are provided by the application;
//!   `drover-testkit` ships an in-memory one.
//!
//! - **Fetcher**: [`Fetcher`] issues batched fetches and runs the
//!   `before_fetch` / `after_fetch` hooks.
//!
//! - **Hooks**: before / after / around callbacks at every lifecycle point,
//!   registered globally on the [`Context`] or per job with [`InstanceHooks`].
//!
//! - **Strategies**: a [`ConsumerStrategy`] decides when to fetch, a
//!   [`WorkerStrategy`] decides how units execute (blocking threads in this
//!   process, or a child process per batch). A bounded hand-off queue between
//!   them provides backpressure.
//!
//! - **Manager**: [`Manager`] wires one pipeline per job queue and handles
//!   signals and graceful shutdown.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use drover::*;
//!
//! struct SendEmail;
//!
//! impl Job for SendEmail {
//!     fn name(&self) -> &str {
//!         "SendEmail"
//!     }
//!
//!     fn options(&self) -> JobOptions {
//!         JobOptions::new("mailer")
//!     }
//!
//!     fn perform(&self, args: &[serde_json::Value]) -> anyhow::Result<()> {
//!         // ...
//!         Ok(())
//!     }
//! }
//!
//! let manager = ManagerBuilder::new()
//!     .register(SendEmail)?
//!     .with_consumer_factory("sqs", sqs_consumers)
//!     .build()?;
//! let report = manager.run().await?;
//! std::process::exit(report.exit_code());
//! ```

/// Configuration keys, defaults and merging.
///
/// [`Configuration`] holds every tunable with its default; overrides are
/// merged from a JSON object with last-write-wins semantics.
pub mod config;

/// Queue backend capabilities.
///
/// The `consumer` module defines the [`Consumer`] trait for fetching and
/// settling messages, [`ConsumerFactory`] for building consumers per queue,
/// and [`QueueAdmin`] for provisioning.
pub mod consumer;

/// Fetch scheduling.
///
/// [`ThreadedConsumerStrategy`] runs several polling loops per queue;
/// [`SingleConsumerStrategy`] fetches only once workers have drained the
/// hand-off queue.
pub mod consumer_strategy;

/// Process-wide configuration and global hooks.
pub mod context;

/// Job payload envelope.
pub mod encoding;

/// Error types.
pub mod error;

/// Batched fetching with hooks.
pub mod fetcher;

/// Bounded hand-off queue between fetching and execution.
pub mod handoff;

/// Before / after / around hooks.
pub mod hooks;

/// Job definitions and the job registry.
pub mod job;

/// Pipelines, signals and shutdown.
pub mod manager;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
///
/// The `metrics` module registers drover's counters, gauges and histograms
/// in the default Prometheus registry when the `metrics` feature is enabled.
pub mod metrics;

/// Publishing jobs to their queues.
pub mod publisher;

/// Exponential backoff for transport retries.
pub mod retry;

/// Unit execution and worker strategies.
///
/// The `runtime` module provides:
/// - [`Worker`] - runs one unit through hooks and its job, then settles it
/// - [`ThreadedWorkerStrategy`] - blocking threads inside this process
/// - [`ForkedWorkerStrategy`] - a child process per batch
/// - [`ForkedChild`] - the child-process entry point
/// - [`SlotPool`] - slot supervision and respawn
/// - [`ShutdownToken`] and [`ShutdownReport`] - shutdown signalling and outcome
pub mod runtime;

/// Tracing spans, subscriber setup and metric recording helpers.
pub mod telemetry;

/// Fetched messages and their settlement.
pub mod unit_of_work;

pub use config::*;
pub use consumer::*;
pub use consumer_strategy::{ConsumerStrategy, SingleConsumerStrategy, ThreadedConsumerStrategy};
pub use context::Context;
pub use encoding::JobPayload;
pub use error::*;
pub use fetcher::Fetcher;
pub use handoff::{HandoffClosed, HandoffQueue, Reservation};
pub use hooks::*;
pub use job::*;
pub use manager::{Manager, ManagerBuilder, ShutdownSignal};
pub use publisher::{JobPublisher, Publisher};
pub use retry::Backoff;
pub use runtime::{
    ForkedChild, ForkedWorkerStrategy, ShutdownReport, ShutdownToken, SlotExit, SlotInfo, SlotPool,
    ThreadedWorkerStrategy, Verdict, Worker, WorkerStrategy,
};
pub use unit_of_work::*;
