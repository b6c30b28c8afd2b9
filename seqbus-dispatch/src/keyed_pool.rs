//! Fixed pool of hash-routed lanes.
//!
//! The simplest strategy: `lanes` sequential loops, each draining its own bounded
//! mailbox. Keys are assigned to lanes by [`LaneRouter`], so the pool holds no
//! per-key state and its memory use is constant.
//!
//! Handler panics are not contained here. A panicking handler takes its lane down;
//! later messages for that lane are refused with
//! [`DispatchError::LaneClosed`], and `stop` logs the panic. Use the
//! [`ActorPool`](crate::ActorPool) when crash containment is required.

use crate::{
    dispatcher::{Dispatcher, DispatcherStats},
    error::{DispatchError, Result},
    job::Job,
    lane::{enqueue_bounded, AtomicLaneState, LaneState},
    routing::LaneRouter,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use seqbus_core::{
    config::KeyedPoolConfig, AggregateMessage, DispatchStrategy, ProcessingError, SharedHandler,
};
use serde::Serialize;
use std::{
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Marks a lane stopped when its loop exits, including by unwinding.
struct StopOnExit<'a>(&'a AtomicLaneState);

impl Drop for StopOnExit<'_> {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Counters shared between a lane loop and the pool.
#[derive(Debug, Default)]
struct LaneCounters {
    state: AtomicLaneState,
    processed: AtomicU64,
    failed: AtomicU64,
}

enum PoolState {
    Created,
    Running(RunningPool),
    Stopped,
}

struct RunningPool {
    senders: Arc<Vec<mpsc::Sender<Job>>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Per-lane snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct LaneStats {
    /// Lane index
    pub lane: usize,
    /// Lifecycle state
    pub state: LaneState,
    /// Messages waiting in the mailbox
    pub queued: usize,
    /// Mailbox capacity
    pub capacity: usize,
    /// Messages whose handler returned
    pub processed: u64,
    /// Of those, how many returned an error
    pub failed: u64,
}

/// Pool snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct KeyedPoolStats {
    /// Whether the pool accepts messages
    pub running: bool,
    /// Number of lanes
    pub lanes: usize,
    /// Sum of queued messages across lanes
    pub queued: usize,
    /// Sum of processed messages across lanes
    pub processed: u64,
    /// Per-lane detail
    pub lane_stats: Vec<LaneStats>,
}

/// Fixed pool of sequential lanes selected by `hash(aggregate_id) % lanes`.
pub struct KeyedWorkerPool {
    config: KeyedPoolConfig,
    router: LaneRouter,
    default_handler: Option<SharedHandler>,
    counters: Arc<Vec<LaneCounters>>,
    state: RwLock<PoolState>,
}

impl KeyedWorkerPool {
    /// Create a pool. Lanes are spawned by [`Dispatcher::start`].
    pub fn new(config: KeyedPoolConfig, default_handler: Option<SharedHandler>) -> Result<Self> {
        if config.queue_capacity == 0 {
            return Err(DispatchError::config("queue capacity must be greater than 0"));
        }
        let router = LaneRouter::new(config.lanes)?;
        let counters = Arc::new((0..config.lanes).map(|_| LaneCounters::default()).collect());

        Ok(Self { config, router, default_handler, counters, state: RwLock::new(PoolState::Created) })
    }

    /// Lane a key routes to.
    #[must_use]
    pub fn lane_for(&self, aggregate_id: &str) -> usize {
        self.router.route(aggregate_id)
    }

    /// Whether `start` has run and `stop` has not.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.state.read(), PoolState::Running(_))
    }

    /// Pool snapshot.
    #[must_use]
    pub fn pool_stats(&self) -> KeyedPoolStats {
        let state = self.state.read();
        let senders = match &*state {
            PoolState::Running(running) => Some(running.senders.clone()),
            _ => None,
        };
        drop(state);

        let capacity = self.config.queue_capacity;
        let lane_stats: Vec<LaneStats> = self
            .counters
            .iter()
            .enumerate()
            .map(|(lane, counters)| LaneStats {
                lane,
                state: counters.state.load(),
                queued: senders
                    .as_ref()
                    .map_or(0, |s| capacity.saturating_sub(s[lane].capacity())),
                capacity,
                processed: counters.processed.load(Ordering::Relaxed),
                failed: counters.failed.load(Ordering::Relaxed),
            })
            .collect();

        KeyedPoolStats {
            running: senders.is_some(),
            lanes: self.router.lanes(),
            queued: lane_stats.iter().map(|l| l.queued).sum(),
            processed: lane_stats.iter().map(|l| l.processed).sum(),
            lane_stats,
        }
    }

    async fn run_lane(
        lane: usize,
        mut mailbox: mpsc::Receiver<Job>,
        shutdown: CancellationToken,
        counters: Arc<Vec<LaneCounters>>,
    ) {
        let own = &counters[lane];
        let _stopped = StopOnExit(&own.state);
        own.state.mark_idle();

        loop {
            let mut job = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                job = mailbox.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            own.state.mark_busy();
            let result = job.invoke().await.map_err(ProcessingError::Handler);
            if let Err(err) = &result {
                own.failed.fetch_add(1, Ordering::Relaxed);
                debug!(lane, aggregate_id = job.message.aggregate_id(), error = %err, "Handler returned an error");
            }
            own.processed.fetch_add(1, Ordering::Relaxed);
            job.message.complete(result);
            own.state.mark_idle();
        }

        debug!(lane, dropped = mailbox.len(), "Lane exited");
    }
}

#[async_trait]
impl Dispatcher for KeyedWorkerPool {
    async fn start(&self, ctx: &CancellationToken) -> Result<()> {
        let mut state = self.state.write();
        match &*state {
            PoolState::Running(_) => return Ok(()),
            PoolState::Stopped => return Err(DispatchError::Stopped),
            PoolState::Created => {},
        }

        let shutdown = ctx.child_token();
        let mut senders = Vec::with_capacity(self.config.lanes);
        let mut tasks = Vec::with_capacity(self.config.lanes);
        for lane in 0..self.config.lanes {
            let (tx, rx) = mpsc::channel(self.config.queue_capacity);
            self.counters[lane].state.start().ok();
            tasks.push(tokio::spawn(Self::run_lane(
                lane,
                rx,
                shutdown.clone(),
                self.counters.clone(),
            )));
            senders.push(tx);
        }

        *state = PoolState::Running(RunningPool { senders: Arc::new(senders), shutdown, tasks });
        info!(
            lanes = self.config.lanes,
            queue_capacity = self.config.queue_capacity,
            enqueue_timeout_ms = self.config.enqueue_timeout.as_millis() as u64,
            "Keyed worker pool started"
        );
        Ok(())
    }

    async fn dispatch(&self, ctx: &CancellationToken, message: AggregateMessage) -> Result<()> {
        let job = Job::resolve(message, self.default_handler.as_ref())?;

        let senders = match &*self.state.read() {
            PoolState::Running(running) => running.senders.clone(),
            PoolState::Created => return Err(DispatchError::NotRunning),
            PoolState::Stopped => return Err(DispatchError::Stopped),
        };

        let lane = self.router.route(job.message.aggregate_id());
        enqueue_bounded(&senders[lane], lane, job, ctx, self.config.enqueue_timeout).await
    }

    async fn stop(&self) {
        let previous = mem::replace(&mut *self.state.write(), PoolState::Stopped);
        let PoolState::Running(RunningPool { senders, shutdown, tasks }) = previous else {
            return;
        };

        shutdown.cancel();
        drop(senders);

        for (lane, task) in tasks.into_iter().enumerate() {
            if let Err(err) = task.await {
                if err.is_panic() {
                    error!(lane, "Lane terminated by a handler panic");
                }
            }
        }
        for counters in self.counters.iter() {
            counters.state.stop();
        }
        info!(lanes = self.config.lanes, "Keyed worker pool stopped");
    }

    fn strategy(&self) -> DispatchStrategy {
        DispatchStrategy::KeyedPool
    }

    fn stats(&self) -> DispatcherStats {
        DispatcherStats::KeyedPool(self.pool_stats())
    }
}
