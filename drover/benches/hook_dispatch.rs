//! Benchmarks for hook dispatch using criterion.
//!
//! These benchmarks measure:
//! - Simple hook fan-out for 1, 8 and 64 registered hooks
//! - Around-hook chain composition at the same depths
//! - Payload decoding, which runs once per unit before any hook

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use drover::{HookArgs, HookRegistry, JobPayload, Next, events};
use serde_json::json;

const DEPTHS: [usize; 3] = [1, 8, 64];

/// Benchmark: run N simple hooks for one event.
fn bench_simple_hooks(c: &mut Criterion) {
    let mut group = c.benchmark_group("simple_hooks");

    for depth in DEPTHS {
        let hooks = HookRegistry::new();
        for _ in 0..depth {
            hooks.add_hook(events::BEFORE_FETCH, |args: &HookArgs<'_>| args.queue_name().is_some());
        }
        let args = HookArgs::Fetch {
            queue_name: "bench",
            batch_size: 10,
        };

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                hooks
                    .run_hooks_for(black_box(events::BEFORE_FETCH), black_box(&args))
                    .expect("hooks should not fail")
            });
        });
    }

    group.finish();
}

/// Benchmark: compose and run an around chain N hooks deep.
fn bench_around_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("around_chain");

    for depth in DEPTHS {
        let hooks = HookRegistry::new();
        for _ in 0..depth {
            hooks.add_around_hook(events::AROUND_PERFORM, |_: &HookArgs<'_>, next: Next<'_>| {
                next.proceed()
            });
        }
        let args = HookArgs::Shutdown { forced: false };

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                hooks
                    .run_around_hooks_for(events::AROUND_PERFORM, &args, || black_box(42))
                    .expect("chain should not fail")
            });
        });
    }

    group.finish();
}

/// Benchmark: decode a typical job envelope.
fn bench_payload_decode(c: &mut Criterion) {
    let body = json!({
        "class": "SendEmail",
        "args": [{ "to": "someone@example.com", "template": "welcome" }, 3, true],
    })
    .to_string();

    c.bench_function("payload_decode", |b| {
        b.iter(|| JobPayload::decode(black_box(&body)).expect("payload should decode"));
    });
}

criterion_group!(benches, bench_simple_hooks, bench_around_chain, bench_payload_decode);
criterion_main!(benches);
