//! The capability shared by all three dispatch strategies.
//!
//! Callers pick a strategy once, at construction, from the expected key cardinality:
//! a bounded key set fits the [`KeyedWorkerPool`], an unbounded one the
//! [`AggregateProcessorManager`], and the [`ActorPool`] adds crash isolation.

use crate::{
    actor::{ActorPool, ActorPoolMetricsCollector, ActorPoolStats, NoopActorPoolMetrics},
    error::Result,
    keyed_pool::{KeyedPoolStats, KeyedWorkerPool},
    manager::{AggregateProcessorManager, ManagerStats},
    rate_limit::RateLimiterHandle,
};
use async_trait::async_trait;
use seqbus_core::{
    config::{ConfigValidator, DispatchConfig},
    AggregateMessage, DispatchStrategy, SharedHandler,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Ordered concurrent dispatch.
///
/// `dispatch` returns once the message is queued; the outcome arrives later on the
/// message's completion slot. Messages with the same aggregate key are handled in
/// the order their `dispatch` calls completed.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Spawn the lanes. Idempotent while running; fails with
    /// [`DispatchError::Stopped`](crate::DispatchError::Stopped) once stopped.
    /// Cancelling `ctx` shuts the lanes down as if `stop` had been called.
    async fn start(&self, ctx: &CancellationToken) -> Result<()>;

    /// Route `message` to its lane and queue it.
    async fn dispatch(&self, ctx: &CancellationToken, message: AggregateMessage) -> Result<()>;

    /// Stop accepting messages and wait for every lane to finish. Idempotent.
    async fn stop(&self);

    /// Which strategy this is.
    fn strategy(&self) -> DispatchStrategy;

    /// Point-in-time statistics.
    fn stats(&self) -> DispatcherStats;
}

/// Statistics of whichever strategy is running.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DispatcherStats {
    /// Fixed lane pool
    KeyedPool(KeyedPoolStats),
    /// Per-aggregate processor cache
    ProcessorCache(ManagerStats),
    /// Supervised actor pool
    ActorPool(ActorPoolStats),
}

/// Build the dispatcher selected by `config.strategy`.
///
/// `metrics` is only used by the actor pool; `None` installs the no-op collector.
/// The rate limit applies to the processor cache, where each lane is one aggregate.
pub fn build_dispatcher(
    config: &DispatchConfig,
    default_handler: Option<SharedHandler>,
    metrics: Option<Arc<dyn ActorPoolMetricsCollector>>,
) -> Result<Arc<dyn Dispatcher>> {
    ConfigValidator::validate_dispatch(config)?;

    let dispatcher: Arc<dyn Dispatcher> = match config.strategy {
        DispatchStrategy::KeyedPool => {
            Arc::new(KeyedWorkerPool::new(config.keyed_pool.clone(), default_handler)?)
        },
        DispatchStrategy::ProcessorCache => {
            let limiter = RateLimiterHandle::from_config(&config.rate_limit);
            Arc::new(AggregateProcessorManager::new(
                config.processor_cache.clone(),
                default_handler,
                limiter.limiter(),
            )?)
        },
        DispatchStrategy::ActorPool => {
            let metrics = metrics.unwrap_or_else(|| Arc::new(NoopActorPoolMetrics));
            Arc::new(ActorPool::new(config.actor_pool.clone(), default_handler, metrics)?)
        },
    };

    info!(strategy = %config.strategy, "Dispatcher built");
    Ok(dispatcher)
}
