//! # Seqbus Benchmarks
//!
//! Criterion benchmarks for the three dispatch strategies.
//!
//! ## Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench -p seqbus-benches
//!
//! # Only the keyed pool
//! cargo bench -p seqbus-benches -- keyed_pool
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use bytes::Bytes;
use rand::{distributions::Alphanumeric, rngs::StdRng, Rng, SeedableRng};
use seqbus_core::{
    config::{ActorPoolConfig, KeyedPoolConfig, ProcessorCacheConfig},
    handler_fn, DispatchConfig, DispatchStrategy, SharedHandler,
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Once,
    },
    time::Duration,
};

/// Strategies every benchmark group compares.
pub const STRATEGIES: [DispatchStrategy; 3] =
    [DispatchStrategy::KeyedPool, DispatchStrategy::ProcessorCache, DispatchStrategy::ActorPool];

/// Dispatch configuration sized for benchmarking `strategy`.
///
/// Mailboxes are large enough that a burst never hits the enqueue timeout.
#[must_use]
pub fn bench_config(strategy: DispatchStrategy) -> DispatchConfig {
    DispatchConfig {
        strategy,
        keyed_pool: KeyedPoolConfig {
            lanes: 256,
            queue_capacity: 4096,
            enqueue_timeout: Duration::from_secs(5),
        },
        processor_cache: ProcessorCacheConfig {
            capacity: 4096,
            mailbox_capacity: 4096,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: None,
        },
        actor_pool: ActorPoolConfig {
            pool_size: 256,
            inbox_capacity: 4096,
            max_restarts: 3,
            enqueue_timeout: Duration::from_secs(5),
            metrics_namespace: "seqbus_bench".to_string(),
        },
        ..DispatchConfig::default()
    }
}

/// Handler that only counts invocations.
#[must_use]
pub fn counting_handler(counter: Arc<AtomicU64>) -> SharedHandler {
    handler_fn(move |_ctx, _payload| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    })
}

/// `count` random aggregate keys drawn from a fixed seed.
#[must_use]
pub fn generate_keys(count: usize, seed: u64) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let suffix: String = (&mut rng).sample_iter(&Alphanumeric).take(12).map(char::from).collect();
            format!("aggregate-{suffix}")
        })
        .collect()
}

/// Payload of `size` random bytes.
#[must_use]
pub fn generate_payload(size: usize) -> Bytes {
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; size];
    rng.fill(buf.as_mut_slice());
    Bytes::from(buf)
}

/// Multi-threaded runtime for async benchmarks.
///
/// # Panics
///
/// Panics if the runtime cannot be built.
#[must_use]
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build benchmark runtime")
}

/// Route engine logs to stderr at `warn` so they do not skew timings.
pub fn quiet_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
            .with_writer(std::io::stderr)
            .try_init();
    });
}
