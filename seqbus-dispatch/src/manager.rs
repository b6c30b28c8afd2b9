//! Bounded cache of per-aggregate processors.
//!
//! The manager keeps at most `capacity` processors resident in an LRU cache.
//! Inserting past capacity evicts and stops the least recently used processor, and
//! a periodic sweep stops processors idle longer than `idle_timeout`. One mutex
//! guards every cache mutation (create, evict, sweep, stop-all), so a lookup never
//! returns a processor that eviction has already stopped.
//!
//! A processor leaving the cache keeps running until its in-flight handler returns
//! and its mailbox is drained. Until then it sits on a retiring list: `stop` waits
//! for it, and `dispatch` waits for it before starting a successor for the same key.

use crate::{
    dispatcher::{Dispatcher, DispatcherStats},
    error::{DispatchError, Result},
    job::Job,
    lane::{AtomicLaneState, LaneState},
    processor::{AggregateProcessor, ProcessorStats},
    rate_limit::RateLimiter,
};
use async_trait::async_trait;
use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use seqbus_core::{config::ProcessorCacheConfig, AggregateMessage, DispatchStrategy, SharedHandler};
use serde::Serialize;
use std::{
    mem,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Attempts to find a live processor when the one found was stopped concurrently.
const MAX_DISPATCH_ATTEMPTS: usize = 3;

/// Manager snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Lifecycle state of the manager
    pub state: LaneState,
    /// Resident processors
    pub total_processors: usize,
    /// Resident processors handling a message
    pub active_processors: usize,
    /// Processors out of the cache that are still draining
    pub retiring_processors: usize,
    /// Resident processors waiting for work
    pub idle_processors: usize,
    /// Cache capacity
    pub capacity: usize,
    /// Idle eviction threshold
    pub idle_timeout_ms: u64,
    /// Processors created since start
    pub created: u64,
    /// Processors evicted by LRU pressure
    pub evicted: u64,
    /// Processors removed by the idle sweep
    pub swept: u64,
    /// Per-processor detail
    pub processors: Vec<ProcessorStats>,
}

struct ManagerInner {
    config: ProcessorCacheConfig,
    default_handler: Option<SharedHandler>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    cache: Mutex<LruCache<String, Arc<AggregateProcessor>>>,
    // Locked after `cache`, never before.
    retiring: Mutex<Vec<Arc<AggregateProcessor>>>,
    state: AtomicLaneState,
    shutdown: Mutex<Option<CancellationToken>>,
    created: AtomicU64,
    evicted: AtomicU64,
    swept: AtomicU64,
}

/// LRU cache of [`AggregateProcessor`]s keyed by aggregate ID.
pub struct AggregateProcessorManager {
    inner: Arc<ManagerInner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AggregateProcessorManager {
    /// Create a manager. The sweep task starts with [`Dispatcher::start`].
    pub fn new(
        config: ProcessorCacheConfig,
        default_handler: Option<SharedHandler>,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
    ) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.capacity)
            .ok_or_else(|| DispatchError::config("processor cache capacity must be greater than 0"))?;
        if config.mailbox_capacity == 0 {
            return Err(DispatchError::config("processor mailbox capacity must be greater than 0"));
        }
        if config.effective_sweep_interval().is_zero() {
            return Err(DispatchError::config("processor sweep interval must be greater than 0"));
        }

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                default_handler,
                rate_limiter,
                cache: Mutex::new(LruCache::new(capacity)),
                retiring: Mutex::new(Vec::new()),
                state: AtomicLaneState::new(),
                shutdown: Mutex::new(None),
                created: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
                swept: AtomicU64::new(0),
            }),
            sweeper: Mutex::new(None),
        })
    }

    /// Return the live processor for `aggregate_id`, creating and starting one on a
    /// miss. Inserting may evict and stop the least recently used processor.
    ///
    /// This does not wait for a retiring processor of the same key; a handler it is
    /// still running may overlap with the new processor. `dispatch` waits.
    pub fn get_or_create(&self, aggregate_id: &str) -> Result<Arc<AggregateProcessor>> {
        match self.inner.resolve(aggregate_id, false)? {
            Resolved::Live(processor) | Resolved::Draining(processor) => Ok(processor),
        }
    }

    /// Whether a processor for `aggregate_id` is resident. Does not touch recency.
    #[must_use]
    pub fn contains(&self, aggregate_id: &str) -> bool {
        self.inner.cache.lock().contains(aggregate_id)
    }

    /// Resident processors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.cache.lock().len()
    }

    /// Whether no processor is resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop and remove every processor idle longer than the idle timeout.
    /// Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle()
    }

    /// Manager snapshot.
    #[must_use]
    pub fn manager_stats(&self) -> ManagerStats {
        let processors: Vec<ProcessorStats> =
            self.inner.cache.lock().iter().map(|(_, p)| p.stats()).collect();
        let count = |state: LaneState| processors.iter().filter(|p| p.state == state).count();

        ManagerStats {
            state: self.inner.state.load(),
            total_processors: processors.len(),
            active_processors: count(LaneState::Running),
            retiring_processors: self.inner.retiring.lock().iter().filter(|p| !p.is_finished()).count(),
            idle_processors: count(LaneState::Idle),
            capacity: self.inner.config.capacity,
            idle_timeout_ms: self.inner.config.idle_timeout.as_millis() as u64,
            created: self.inner.created.load(Ordering::Relaxed),
            evicted: self.inner.evicted.load(Ordering::Relaxed),
            swept: self.inner.swept.load(Ordering::Relaxed),
            processors,
        }
    }

    async fn sweep_loop(inner: Arc<ManagerInner>, shutdown: CancellationToken) {
        let period = inner.config.effective_sweep_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = inner.sweep_idle();
                    if removed > 0 {
                        debug!(removed, "Idle processors swept");
                    }
                },
            }
        }
    }
}

enum Resolved {
    Live(Arc<AggregateProcessor>),
    /// Evicted or swept processor for the key that has not finished draining.
    Draining(Arc<AggregateProcessor>),
}

impl ManagerInner {
    fn ensure_running(&self) -> Result<()> {
        match self.state.load() {
            LaneState::Created => Err(DispatchError::NotRunning),
            LaneState::Stopped => Err(DispatchError::Stopped),
            LaneState::Running | LaneState::Idle => Ok(()),
        }
    }

    fn resolve(&self, aggregate_id: &str, await_draining: bool) -> Result<Resolved> {
        if aggregate_id.is_empty() {
            return Err(DispatchError::MissingAggregateId);
        }

        let mut cache = self.cache.lock();
        self.ensure_running()?;

        if let Some(existing) = cache.get(aggregate_id) {
            if !existing.is_stopped() {
                return Ok(Resolved::Live(existing.clone()));
            }
        }
        if let Some(stale) = cache.pop(aggregate_id) {
            debug!(aggregate_id, "Discarding stopped processor");
            self.retire(stale);
        }
        if await_draining {
            let draining = self
                .retiring
                .lock()
                .iter()
                .find(|p| p.aggregate_id() == aggregate_id && !p.is_finished())
                .cloned();
            if let Some(previous) = draining {
                return Ok(Resolved::Draining(previous));
            }
        }

        let parent = self.shutdown.lock().clone().ok_or(DispatchError::NotRunning)?;
        let processor = Arc::new(AggregateProcessor::new(
            aggregate_id,
            self.config.mailbox_capacity,
            self.default_handler.clone(),
            self.rate_limiter.clone(),
        )?);
        processor.start(&parent)?;
        self.created.fetch_add(1, Ordering::Relaxed);

        if let Some((evicted_key, evicted)) = cache.push(aggregate_id.to_string(), processor.clone()) {
            evicted.stop();
            self.retire(evicted);
            self.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(aggregate_id = %evicted_key, "Evicted least recently used processor");
        }

        debug!(aggregate_id, resident = cache.len(), "Aggregate processor created");
        Ok(Resolved::Live(processor))
    }

    /// Track a processor that left the cache until it finishes draining.
    /// Callers hold the cache lock.
    fn retire(&self, processor: Arc<AggregateProcessor>) {
        let mut retiring = self.retiring.lock();
        retiring.retain(|p| !p.is_finished());
        if !processor.is_finished() {
            retiring.push(processor);
        }
    }

    fn sweep_idle(&self) -> usize {
        let timeout = self.config.idle_timeout;
        let mut cache = self.cache.lock();

        let idle: Vec<String> = cache
            .iter()
            .filter(|(_, p)| p.is_stopped() || p.is_idle(timeout))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &idle {
            if let Some(processor) = cache.pop(key) {
                processor.stop();
                self.retire(processor);
                debug!(aggregate_id = %key, "Removed idle processor");
            }
        }

        self.swept.fetch_add(idle.len() as u64, Ordering::Relaxed);
        idle.len()
    }
}

#[async_trait]
impl Dispatcher for AggregateProcessorManager {
    async fn start(&self, ctx: &CancellationToken) -> Result<()> {
        match self.inner.state.start() {
            Ok(()) => {},
            Err(LaneState::Stopped) => return Err(DispatchError::Stopped),
            Err(_) => return Ok(()),
        }

        let shutdown = ctx.child_token();
        *self.inner.shutdown.lock() = Some(shutdown.clone());
        let handle = tokio::spawn(Self::sweep_loop(self.inner.clone(), shutdown));
        *self.sweeper.lock() = Some(handle);

        info!(
            capacity = self.inner.config.capacity,
            idle_timeout_ms = self.inner.config.idle_timeout.as_millis() as u64,
            sweep_interval_ms = self.inner.config.effective_sweep_interval().as_millis() as u64,
            "Aggregate processor manager started"
        );
        Ok(())
    }

    async fn dispatch(&self, ctx: &CancellationToken, message: AggregateMessage) -> Result<()> {
        let job = Job::resolve(message, self.inner.default_handler.as_ref())?;
        let aggregate_id = job.message.aggregate_id().to_string();

        let mut attempt = 1;
        loop {
            let processor = match self.inner.resolve(&aggregate_id, true)? {
                Resolved::Live(processor) => processor,
                Resolved::Draining(previous) => {
                    debug!(aggregate_id = %aggregate_id, "Waiting for retiring processor to drain");
                    previous.finished(ctx).await?;
                    continue;
                },
            };

            let reserved = processor.reserve(ctx).await;
            match reserved {
                Ok(permit) => {
                    permit.send(job);
                    return Ok(());
                },
                Err(DispatchError::LaneClosed { .. }) if attempt < MAX_DISPATCH_ATTEMPTS => {
                    debug!(aggregate_id = %aggregate_id, attempt, "Processor stopped before enqueue; retrying");
                    attempt += 1;
                },
                Err(err) => return Err(err),
            }
        }
    }

    async fn stop(&self) {
        if !self.inner.state.stop() {
            return;
        }

        if let Some(shutdown) = self.inner.shutdown.lock().take() {
            shutdown.cancel();
        }
        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }

        let (resident, retiring) = {
            let mut cache = self.inner.cache.lock();
            let mut drained = Vec::with_capacity(cache.len());
            while let Some((_, processor)) = cache.pop_lru() {
                drained.push(processor);
            }
            (drained, mem::take(&mut *self.inner.retiring.lock()))
        };

        for processor in &resident {
            processor.stop();
        }
        join_all(resident.iter().chain(&retiring).map(|p| p.join())).await;

        info!(
            stopped = resident.len(),
            retired = retiring.len(),
            "Aggregate processor manager stopped"
        );
    }

    fn strategy(&self) -> DispatchStrategy {
        DispatchStrategy::ProcessorCache
    }

    fn stats(&self) -> DispatcherStats {
        DispatcherStats::ProcessorCache(self.manager_stats())
    }
}
