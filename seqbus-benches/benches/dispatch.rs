//! Dispatch strategy benchmarks.
//!
//! Compares the keyed pool, processor cache and actor pool on a single hot key, on
//! a wide spread of keys, and on round-trip latency for one message.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;
use seqbus_benches::{
    bench_config, counting_handler, generate_keys, generate_payload, quiet_logging, runtime, STRATEGIES,
};
use seqbus_core::AggregateMessage;
use seqbus_dispatch::{build_dispatcher, Dispatcher};
use std::sync::{atomic::AtomicU64, Arc};
use tokio_util::sync::CancellationToken;

/// Messages per measured iteration for the burst groups.
const BURST: usize = 1_000;

/// Distinct keys for the fan-out group.
const KEY_COUNTS: &[usize] = &[1, 64, 1024];

fn started(rt: &tokio::runtime::Runtime, strategy: seqbus_core::DispatchStrategy) -> (Arc<dyn Dispatcher>, CancellationToken) {
    let counter = Arc::new(AtomicU64::new(0));
    let dispatcher = build_dispatcher(&bench_config(strategy), Some(counting_handler(counter)), None).unwrap();
    let ctx = CancellationToken::new();
    rt.block_on(dispatcher.start(&ctx)).unwrap();
    (dispatcher, ctx)
}

/// Dispatch a burst of messages and wait for every completion.
fn bench_burst(c: &mut Criterion) {
    quiet_logging();
    let rt = runtime();
    let payload = generate_payload(256);

    let mut group = c.benchmark_group("burst");
    group.throughput(Throughput::Elements(BURST as u64));

    for strategy in STRATEGIES {
        for &key_count in KEY_COUNTS {
            let (dispatcher, ctx) = started(&rt, strategy);
            let keys = generate_keys(key_count, 42);

            group.bench_with_input(BenchmarkId::new(strategy.to_string(), key_count), &keys, |b, keys| {
                b.to_async(&rt).iter(|| async {
                    let mut completions = Vec::with_capacity(BURST);
                    for i in 0..BURST {
                        let mut message = AggregateMessage::new(keys[i % keys.len()].clone(), payload.clone());
                        completions.push(message.completion());
                        dispatcher.dispatch(&ctx, message).await.unwrap();
                    }
                    black_box(join_all(completions.into_iter().map(|c| c.wait())).await)
                });
            });

            rt.block_on(dispatcher.stop());
        }
    }

    group.finish();
}

/// Time from dispatch to completion for a single message.
fn bench_round_trip(c: &mut Criterion) {
    quiet_logging();
    let rt = runtime();
    let payload = generate_payload(64);

    let mut group = c.benchmark_group("round_trip");
    for strategy in STRATEGIES {
        let (dispatcher, ctx) = started(&rt, strategy);

        group.bench_function(strategy.to_string(), |b| {
            b.to_async(&rt).iter(|| async {
                let mut message = AggregateMessage::new("order-1", payload.clone());
                let completion = message.completion();
                dispatcher.dispatch(&ctx, message).await.unwrap();
                black_box(completion.wait().await)
            });
        });

        rt.block_on(dispatcher.stop());
    }
    group.finish();
}

criterion_group!(benches, bench_burst, bench_round_trip);
criterion_main!(benches);
