//! Dispatch engine integration tests
//!
//! Exercises the behaviour every strategy promises through the shared
//! [`Dispatcher`] interface: per-key ordering, cross-key independence,
//! backpressure, key validation and lifecycle.

use bytes::Bytes;
use parking_lot::Mutex;
use seqbus_core::{
    config::{ActorPoolConfig, KeyedPoolConfig, ProcessorCacheConfig},
    handler_fn, AggregateMessage, Completion, DispatchConfig, DispatchStrategy, HandlerResult,
    SharedHandler,
};
use seqbus_dispatch::{build_dispatcher, fnv1a_32, DispatchError, Dispatcher};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

const ALL_STRATEGIES: [DispatchStrategy; 3] =
    [DispatchStrategy::KeyedPool, DispatchStrategy::ProcessorCache, DispatchStrategy::ActorPool];

fn small_config(strategy: DispatchStrategy) -> DispatchConfig {
    DispatchConfig {
        strategy,
        keyed_pool: KeyedPoolConfig {
            lanes: 8,
            queue_capacity: 64,
            enqueue_timeout: Duration::from_millis(200),
        },
        processor_cache: ProcessorCacheConfig {
            capacity: 64,
            mailbox_capacity: 64,
            idle_timeout: Duration::from_secs(30),
            sweep_interval: None,
        },
        actor_pool: ActorPoolConfig {
            pool_size: 8,
            inbox_capacity: 64,
            max_restarts: 3,
            enqueue_timeout: Duration::from_millis(200),
            metrics_namespace: "seqbus_it".to_string(),
        },
        ..DispatchConfig::default()
    }
}

/// Handler that records `(key, sequence)` from payloads of the form
/// `key:sequence[:delay_ms]`, sleeping first when a delay is given.
fn recording_handler(log: Arc<Mutex<Vec<(String, u32)>>>) -> SharedHandler {
    handler_fn(move |_ctx, payload: Bytes| record(log.clone(), payload))
}

async fn record(log: Arc<Mutex<Vec<(String, u32)>>>, payload: Bytes) -> HandlerResult {
    let text = String::from_utf8(payload.to_vec())?;
    let mut parts = text.split(':');
    let key = parts.next().unwrap_or_default().to_string();
    let seq: u32 = parts.next().unwrap_or("0").parse()?;
    if let Some(delay) = parts.next() {
        tokio::time::sleep(Duration::from_millis(delay.parse()?)).await;
    }
    log.lock().push((key, seq));
    Ok(())
}

async fn dispatch(
    dispatcher: &dyn Dispatcher,
    key: &str,
    payload: String,
) -> Result<Completion, DispatchError> {
    let mut msg = AggregateMessage::new(key, payload);
    let completion = msg.completion();
    dispatcher.dispatch(&CancellationToken::new(), msg).await?;
    Ok(completion)
}

mod ordering_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_key_order_is_preserved() {
        for strategy in ALL_STRATEGIES {
            let log = Arc::new(Mutex::new(Vec::new()));
            let dispatcher =
                build_dispatcher(&small_config(strategy), Some(recording_handler(log.clone())), None)
                    .unwrap();
            dispatcher.start(&CancellationToken::new()).await.unwrap();

            let mut completions = Vec::new();
            for seq in 0..200 {
                completions.push(dispatch(dispatcher.as_ref(), "A", format!("A:{seq}")).await.unwrap());
            }
            for completion in completions {
                assert!(matches!(completion.wait().await, Some(Ok(()))));
            }

            let seen: Vec<u32> = log.lock().iter().map(|(_, seq)| *seq).collect();
            assert_eq!(seen, (0..200).collect::<Vec<_>>(), "strategy {strategy}");
            dispatcher.stop().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_keys_keep_per_key_order() {
        for strategy in ALL_STRATEGIES {
            let log = Arc::new(Mutex::new(Vec::new()));
            let dispatcher =
                build_dispatcher(&small_config(strategy), Some(recording_handler(log.clone())), None)
                    .unwrap();
            dispatcher.start(&CancellationToken::new()).await.unwrap();

            let keys: Vec<String> = (0..20).map(|i| format!("order-{i}")).collect();
            let mut completions = Vec::new();
            for seq in 0..25 {
                for key in &keys {
                    completions
                        .push(dispatch(dispatcher.as_ref(), key, format!("{key}:{seq}")).await.unwrap());
                }
            }
            for completion in completions {
                completion.wait().await;
            }

            let log = log.lock();
            assert_eq!(log.len(), 500);
            for key in &keys {
                let seen: Vec<u32> =
                    log.iter().filter(|(k, _)| k == key).map(|(_, seq)| *seq).collect();
                assert_eq!(seen, (0..25).collect::<Vec<_>>(), "strategy {strategy}, key {key}");
            }
            drop(log);
            dispatcher.stop().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_on_distinct_keys() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = build_dispatcher(
            &small_config(DispatchStrategy::ActorPool),
            Some(recording_handler(log.clone())),
            None,
        )
        .unwrap();
        dispatcher.start(&CancellationToken::new()).await.unwrap();

        let mut producers = Vec::new();
        for p in 0..4 {
            let dispatcher = dispatcher.clone();
            producers.push(tokio::spawn(async move {
                let key = format!("producer-{p}");
                let mut completions = Vec::new();
                for seq in 0..100 {
                    completions
                        .push(dispatch(dispatcher.as_ref(), &key, format!("{key}:{seq}")).await.unwrap());
                }
                for completion in completions {
                    completion.wait().await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let log = log.lock();
        for p in 0..4 {
            let key = format!("producer-{p}");
            let seen: Vec<u32> = log.iter().filter(|(k, _)| *k == key).map(|(_, s)| *s).collect();
            assert_eq!(seen, (0..100).collect::<Vec<_>>());
        }
        drop(log);
        dispatcher.stop().await;
    }
}

mod independence_tests {
    use super::*;

    /// Two keys that the 8-lane pools route to different lanes.
    fn split_keys() -> (String, String) {
        let lane = |k: &str| fnv1a_32(k.as_bytes()) as usize % 8;
        let first = "alpha".to_string();
        let second = (0..)
            .map(|i| format!("beta-{i}"))
            .find(|k| lane(k) != lane(&first))
            .unwrap_or_default();
        (first, second)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_keys_complete_in_either_order() {
        let (a, b) = split_keys();
        for strategy in ALL_STRATEGIES {
            let log = Arc::new(Mutex::new(Vec::new()));
            let dispatcher =
                build_dispatcher(&small_config(strategy), Some(recording_handler(log.clone())), None)
                    .unwrap();
            dispatcher.start(&CancellationToken::new()).await.unwrap();

            let mut first_finishers = Vec::new();
            for (delay_a, delay_b) in [(60, 0), (0, 60)] {
                log.lock().clear();
                let done_a = dispatch(dispatcher.as_ref(), &a, format!("{a}:0:{delay_a}")).await.unwrap();
                let done_b = dispatch(dispatcher.as_ref(), &b, format!("{b}:0:{delay_b}")).await.unwrap();
                done_a.wait().await;
                done_b.wait().await;
                first_finishers.push(log.lock()[0].0.clone());
            }

            assert_eq!(first_finishers, vec![b.clone(), a.clone()], "strategy {strategy}");
            dispatcher.stop().await;
        }
    }
}

mod backpressure_tests {
    use super::*;

    fn slow_handler() -> SharedHandler {
        handler_fn(|_, _| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        })
    }

    async fn assert_fourth_dispatch_times_out(dispatcher: Arc<dyn Dispatcher>) {
        let ctx = CancellationToken::new();
        dispatcher.start(&ctx).await.unwrap();

        dispatcher.dispatch(&ctx, AggregateMessage::new("K", Bytes::new())).await.unwrap();
        // Let the lane take the first message so the next two fill the mailbox.
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.dispatch(&ctx, AggregateMessage::new("K", Bytes::new())).await.unwrap();
        dispatcher.dispatch(&ctx, AggregateMessage::new("K", Bytes::new())).await.unwrap();

        let started = Instant::now();
        let err = dispatcher.dispatch(&ctx, AggregateMessage::new("K", Bytes::new())).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_backpressure(), "unexpected error: {err:?}");
        assert!(err.is_retryable());
        assert!(elapsed >= Duration::from_millis(45), "returned too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(100), "returned too late: {elapsed:?}");
        dispatcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_keyed_pool_reports_queue_full() {
        let mut config = small_config(DispatchStrategy::KeyedPool);
        config.keyed_pool =
            KeyedPoolConfig { lanes: 1, queue_capacity: 2, enqueue_timeout: Duration::from_millis(50) };
        assert_fourth_dispatch_times_out(build_dispatcher(&config, Some(slow_handler()), None).unwrap())
            .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_actor_pool_reports_queue_full() {
        let mut config = small_config(DispatchStrategy::ActorPool);
        config.actor_pool.pool_size = 1;
        config.actor_pool.inbox_capacity = 2;
        config.actor_pool.enqueue_timeout = Duration::from_millis(50);
        assert_fourth_dispatch_times_out(build_dispatcher(&config, Some(slow_handler()), None).unwrap())
            .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_processor_cache_blocks_until_cancelled() {
        let mut config = small_config(DispatchStrategy::ProcessorCache);
        config.processor_cache.mailbox_capacity = 1;
        let dispatcher = build_dispatcher(&config, Some(slow_handler()), None).unwrap();
        let ctx = CancellationToken::new();
        dispatcher.start(&ctx).await.unwrap();

        dispatcher.dispatch(&ctx, AggregateMessage::new("K", Bytes::new())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.dispatch(&ctx, AggregateMessage::new("K", Bytes::new())).await.unwrap();

        let caller = CancellationToken::new();
        let canceller = caller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });
        let err = dispatcher.dispatch(&caller, AggregateMessage::new("K", Bytes::new())).await;
        assert_eq!(err, Err(DispatchError::Cancelled));
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_cancelled_enqueue_leaves_lane_untouched() {
        let mut config = small_config(DispatchStrategy::KeyedPool);
        config.keyed_pool =
            KeyedPoolConfig { lanes: 1, queue_capacity: 1, enqueue_timeout: Duration::from_secs(5) };
        let dispatcher = build_dispatcher(&config, Some(slow_handler()), None).unwrap();
        let ctx = CancellationToken::new();
        dispatcher.start(&ctx).await.unwrap();

        dispatcher.dispatch(&ctx, AggregateMessage::new("K", Bytes::new())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.dispatch(&ctx, AggregateMessage::new("K", Bytes::new())).await.unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert_eq!(
            dispatcher.dispatch(&cancelled, AggregateMessage::new("K", Bytes::new())).await,
            Err(DispatchError::Cancelled)
        );

        let mut last = AggregateMessage::new("K", Bytes::new());
        let done = last.completion();
        dispatcher.dispatch(&ctx, last).await.unwrap();
        assert!(matches!(done.wait().await, Some(Ok(()))));
        dispatcher.stop().await;
    }
}

mod validation_tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_key_is_rejected_by_every_strategy() {
        for strategy in ALL_STRATEGIES {
            let log = Arc::new(Mutex::new(Vec::new()));
            let dispatcher =
                build_dispatcher(&small_config(strategy), Some(recording_handler(log.clone())), None)
                    .unwrap();
            dispatcher.start(&CancellationToken::new()).await.unwrap();

            let mut msg = AggregateMessage::new("", Bytes::from_static(b"x:1"));
            let completion = msg.completion();
            assert_eq!(
                dispatcher.dispatch(&CancellationToken::new(), msg).await,
                Err(DispatchError::MissingAggregateId)
            );
            assert!(completion.wait().await.is_none());

            dispatcher.stop().await;
            assert!(log.lock().is_empty());
        }
    }

    #[tokio::test]
    async fn test_message_handler_overrides_missing_default() {
        for strategy in ALL_STRATEGIES {
            let dispatcher = build_dispatcher(&small_config(strategy), None, None).unwrap();
            dispatcher.start(&CancellationToken::new()).await.unwrap();

            let err = dispatcher
                .dispatch(&CancellationToken::new(), AggregateMessage::new("a", Bytes::new()))
                .await
                .unwrap_err();
            assert!(matches!(err, DispatchError::MissingHandler { .. }));

            let mut msg = AggregateMessage::new("a", Bytes::new())
                .with_handler(handler_fn(|_, _| async { Err("carried handler ran".into()) }));
            let completion = msg.completion();
            dispatcher.dispatch(&CancellationToken::new(), msg).await.unwrap();
            match completion.wait().await {
                Some(Err(err)) => assert_eq!(err.to_string(), "handler failed: carried handler ran"),
                other => panic!("unexpected outcome: {other:?}"),
            }
            dispatcher.stop().await;
        }
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        for strategy in ALL_STRATEGIES {
            let dispatcher =
                build_dispatcher(&small_config(strategy), Some(handler_fn(|_, _| async { Ok(()) })), None)
                    .unwrap();
            let ctx = CancellationToken::new();

            dispatcher.start(&ctx).await.unwrap();
            dispatcher.start(&ctx).await.unwrap();
            dispatch(dispatcher.as_ref(), "k", "k:1".into()).await.unwrap().wait().await;

            dispatcher.stop().await;
            dispatcher.stop().await;
            assert_eq!(dispatcher.start(&ctx).await, Err(DispatchError::Stopped));
            assert_eq!(
                dispatch(dispatcher.as_ref(), "k", "k:2".into()).await.err(),
                Some(DispatchError::Stopped)
            );
        }
    }

    #[tokio::test]
    async fn test_stats_serialize_with_strategy_tag() {
        for strategy in ALL_STRATEGIES {
            let dispatcher =
                build_dispatcher(&small_config(strategy), Some(handler_fn(|_, _| async { Ok(()) })), None)
                    .unwrap();
            dispatcher.start(&CancellationToken::new()).await.unwrap();
            dispatch(dispatcher.as_ref(), "k", "k:1".into()).await.unwrap().wait().await;

            let json = serde_json::to_value(dispatcher.stats()).unwrap();
            assert_eq!(json["strategy"], strategy.to_string());
            dispatcher.stop().await;
        }
    }
}
