//! Supervised actor pool.
//!
//! Routing matches the [`KeyedWorkerPool`](crate::KeyedWorkerPool): a key always
//! lands on actor `hash(key) % pool_size`, which handles its inbox sequentially.
//! What the actor pool adds is isolation. Handler panics are turned into
//! [`ProcessingError::Panicked`](seqbus_core::ProcessingError::Panicked) on the
//! message's completion slot, and an actor that crashes outside message handling is
//! restarted by its supervisor.
//!
//! Inbox depth is tracked with an atomic counter for observability only. It is
//! incremented before the enqueue and decremented on receive, so it can briefly
//! disagree with the real queue length.

pub mod metrics;
mod middleware;
mod supervisor;

pub use metrics::{ActorPoolMetricsCollector, NoopActorPoolMetrics, PrometheusActorPoolMetrics};

use crate::{
    dispatcher::{Dispatcher, DispatcherStats},
    error::{DispatchError, Result},
    job::Job,
    lane::{enqueue_bounded, LaneState},
    routing::LaneRouter,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use seqbus_core::{config::ActorPoolConfig, AggregateMessage, DispatchStrategy, SharedHandler};
use serde::Serialize;
use std::{
    mem,
    sync::{atomic::Ordering, Arc},
};
use supervisor::{ActorSlot, Supervisor};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

enum ActorPoolState {
    Created,
    Running {
        inboxes: Arc<Vec<mpsc::Sender<Job>>>,
        supervisors: Vec<JoinHandle<()>>,
        shutdown: CancellationToken,
    },
    Stopped,
}

/// Per-actor snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ActorStats {
    /// Actor index
    pub actor: usize,
    /// Lifecycle state
    pub state: LaneState,
    /// Approximate inbox depth, clamped at zero
    pub inbox_depth: i64,
    /// Restarts performed by the supervisor
    pub restarts: u32,
    /// Messages handled
    pub processed: u64,
    /// Messages that failed or panicked
    pub failed: u64,
    /// Handler panics contained
    pub panics: u64,
    /// Messages discarded when the actor was retired
    pub dead_letters: u64,
}

/// Pool snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ActorPoolStats {
    /// Whether the pool accepts messages
    pub running: bool,
    /// Number of actors
    pub pool_size: usize,
    /// Inbox capacity per actor
    pub inbox_capacity: usize,
    /// Restart budget per actor
    pub max_restarts: u32,
    /// Sum of approximate inbox depths
    pub inbox_depth: i64,
    /// Restarts across all actors
    pub total_restarts: u64,
    /// Per-actor detail
    pub actors: Vec<ActorStats>,
}

/// Fixed pool of supervised actors selected by `hash(aggregate_id) % pool_size`.
pub struct ActorPool {
    config: ActorPoolConfig,
    router: LaneRouter,
    default_handler: Option<SharedHandler>,
    metrics: Arc<dyn ActorPoolMetricsCollector>,
    slots: Vec<Arc<ActorSlot>>,
    state: RwLock<ActorPoolState>,
}

impl ActorPool {
    /// Create a pool. Actors are spawned by [`Dispatcher::start`].
    pub fn new(
        config: ActorPoolConfig,
        default_handler: Option<SharedHandler>,
        metrics: Arc<dyn ActorPoolMetricsCollector>,
    ) -> Result<Self> {
        if config.inbox_capacity == 0 {
            return Err(DispatchError::config("actor inbox capacity must be greater than 0"));
        }
        let router = LaneRouter::new(config.pool_size)?;
        let slots = (0..config.pool_size).map(|_| Arc::new(ActorSlot::default())).collect();

        Ok(Self {
            config,
            router,
            default_handler,
            metrics,
            slots,
            state: RwLock::new(ActorPoolState::Created),
        })
    }

    /// Actor a key routes to.
    #[must_use]
    pub fn actor_for(&self, aggregate_id: &str) -> usize {
        self.router.route(aggregate_id)
    }

    /// Whether `start` has run and `stop` has not.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.state.read(), ActorPoolState::Running { .. })
    }

    /// Pool snapshot.
    #[must_use]
    pub fn pool_stats(&self) -> ActorPoolStats {
        let actors: Vec<ActorStats> = self
            .slots
            .iter()
            .enumerate()
            .map(|(actor, slot)| ActorStats {
                actor,
                state: slot.state.load(),
                inbox_depth: slot.inbox_depth(),
                restarts: slot.restarts.load(Ordering::Relaxed),
                processed: slot.processed.load(Ordering::Relaxed),
                failed: slot.failed.load(Ordering::Relaxed),
                panics: slot.panics.load(Ordering::Relaxed),
                dead_letters: slot.dead_letters.load(Ordering::Relaxed),
            })
            .collect();

        ActorPoolStats {
            running: self.is_running(),
            pool_size: self.config.pool_size,
            inbox_capacity: self.config.inbox_capacity,
            max_restarts: self.config.max_restarts,
            inbox_depth: actors.iter().map(|a| a.inbox_depth).sum(),
            total_restarts: actors.iter().map(|a| u64::from(a.restarts)).sum(),
            actors,
        }
    }
}

#[async_trait]
impl Dispatcher for ActorPool {
    async fn start(&self, ctx: &CancellationToken) -> Result<()> {
        let mut state = self.state.write();
        match &*state {
            ActorPoolState::Running { .. } => return Ok(()),
            ActorPoolState::Stopped => return Err(DispatchError::Stopped),
            ActorPoolState::Created => {},
        }

        let shutdown = ctx.child_token();
        let mut inboxes = Vec::with_capacity(self.config.pool_size);
        let mut supervisors = Vec::with_capacity(self.config.pool_size);
        for (actor, slot) in self.slots.iter().enumerate() {
            let (tx, rx) = mpsc::channel(self.config.inbox_capacity);
            let supervisor = Supervisor {
                actor,
                inbox: Arc::new(Mutex::new(rx)),
                slot: slot.clone(),
                metrics: self.metrics.clone(),
                capacity: self.config.inbox_capacity,
                max_restarts: self.config.max_restarts,
                shutdown: shutdown.clone(),
            };
            supervisors.push(tokio::spawn(supervisor.run()));
            inboxes.push(tx);
        }

        *state = ActorPoolState::Running { inboxes: Arc::new(inboxes), supervisors, shutdown };
        info!(
            pool_size = self.config.pool_size,
            inbox_capacity = self.config.inbox_capacity,
            max_restarts = self.config.max_restarts,
            "Actor pool started"
        );
        Ok(())
    }

    async fn dispatch(&self, ctx: &CancellationToken, message: AggregateMessage) -> Result<()> {
        let job = Job::resolve(message, self.default_handler.as_ref())?;

        let inboxes = match &*self.state.read() {
            ActorPoolState::Running { inboxes, .. } => inboxes.clone(),
            ActorPoolState::Created => return Err(DispatchError::NotRunning),
            ActorPoolState::Stopped => return Err(DispatchError::Stopped),
        };

        let actor = self.router.route(job.message.aggregate_id());
        let slot = &self.slots[actor];
        slot.depth.fetch_add(1, Ordering::Relaxed);

        match enqueue_bounded(&inboxes[actor], actor, job, ctx, self.config.enqueue_timeout).await {
            Ok(()) => {
                self.metrics.record_message_sent(actor);
                Ok(())
            },
            Err(err) => {
                slot.depth.fetch_sub(1, Ordering::Relaxed);
                Err(err)
            },
        }
    }

    async fn stop(&self) {
        let previous = mem::replace(&mut *self.state.write(), ActorPoolState::Stopped);
        let ActorPoolState::Running { inboxes, supervisors, shutdown } = previous else {
            return;
        };

        // Closing the inboxes lets each actor finish what is already queued.
        drop(inboxes);
        for (actor, supervisor) in supervisors.into_iter().enumerate() {
            if let Err(err) = supervisor.await {
                error!(actor, error = %err, "Supervisor terminated abnormally");
            }
        }
        shutdown.cancel();

        if let Err(err) = self.metrics.unregister() {
            warn!(error = %err, "Failed to unregister actor pool metrics");
        }
        info!(pool_size = self.config.pool_size, "Actor pool stopped");
    }

    fn strategy(&self) -> DispatchStrategy {
        DispatchStrategy::ActorPool
    }

    fn stats(&self) -> DispatcherStats {
        DispatcherStats::ActorPool(self.pool_stats())
    }
}
