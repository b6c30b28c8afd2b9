//! Actor supervision.
//!
//! Each actor runs as a child task owned by a supervisor. The inbox outlives the
//! child: it sits behind an async mutex shared by every incarnation, so a restarted
//! actor resumes with the messages its predecessor had not yet received.
//!
//! Handler panics are contained by the middleware and never reach the supervisor.
//! What does reach it is a crash outside message handling. Such crashes are
//! restarted up to `max_restarts` times; after that the actor is retired, its
//! queued messages fail with [`ProcessingError::LaneFailed`] and its inbox is closed.

use super::{
    metrics::ActorPoolMetricsCollector,
    middleware::{self, Delivery},
};
use crate::{job::Job, lane::AtomicLaneState};
use seqbus_core::ProcessingError;
use std::sync::{
    atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub(crate) type SharedInbox = Arc<Mutex<mpsc::Receiver<Job>>>;

/// Per-actor bookkeeping shared by the pool, the supervisor and the actor task.
#[derive(Debug, Default)]
pub(crate) struct ActorSlot {
    pub(crate) state: AtomicLaneState,
    /// Approximate inbox depth. Incremented on dispatch, decremented on receive.
    pub(crate) depth: AtomicI64,
    pub(crate) restarts: AtomicU32,
    pub(crate) processed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) panics: AtomicU64,
    pub(crate) dead_letters: AtomicU64,
}

impl ActorSlot {
    /// Inbox depth clamped for display.
    pub(crate) fn inbox_depth(&self) -> i64 {
        self.depth.load(Ordering::Relaxed).max(0)
    }
}

pub(crate) struct Supervisor {
    pub(crate) actor: usize,
    pub(crate) inbox: SharedInbox,
    pub(crate) slot: Arc<ActorSlot>,
    pub(crate) metrics: Arc<dyn ActorPoolMetricsCollector>,
    pub(crate) capacity: usize,
    pub(crate) max_restarts: u32,
    pub(crate) shutdown: CancellationToken,
}

impl Supervisor {
    pub(crate) async fn run(self) {
        self.slot.state.start().ok();

        loop {
            let child = tokio::spawn(run_actor(
                self.actor,
                self.inbox.clone(),
                self.slot.clone(),
                self.metrics.clone(),
                self.capacity,
                self.shutdown.clone(),
            ));

            match child.await {
                Ok(()) => break,
                Err(err) if err.is_panic() => {
                    let restarts = self.slot.restarts.fetch_add(1, Ordering::Relaxed) + 1;
                    self.metrics.record_actor_restarted(self.actor);
                    if restarts > self.max_restarts {
                        error!(actor = self.actor, restarts, "Actor exceeded its restart budget; retiring");
                        self.retire().await;
                        break;
                    }
                    warn!(actor = self.actor, restarts, max_restarts = self.max_restarts, "Actor crashed; restarting");
                },
                Err(_) => break,
            }
        }

        self.slot.state.stop();
        debug!(actor = self.actor, "Supervisor exited");
    }

    async fn retire(&self) {
        self.slot.state.stop();
        let mut inbox = self.inbox.lock().await;
        inbox.close();

        let mut drained = 0_u64;
        while let Some(mut job) = inbox.recv().await {
            self.slot.depth.fetch_sub(1, Ordering::Relaxed);
            self.slot.dead_letters.fetch_add(1, Ordering::Relaxed);
            job.message.fail(ProcessingError::LaneFailed { lane: self.actor });
            self.metrics.record_dead_letter(self.actor);
            drained += 1;
        }

        if drained > 0 {
            warn!(actor = self.actor, drained, "Queued messages of retired actor dead-lettered");
        }
    }
}

async fn run_actor(
    actor: usize,
    inbox: SharedInbox,
    slot: Arc<ActorSlot>,
    metrics: Arc<dyn ActorPoolMetricsCollector>,
    capacity: usize,
    shutdown: CancellationToken,
) {
    let mut inbox = inbox.lock().await;
    slot.state.mark_idle();

    loop {
        let job = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            job = inbox.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        slot.state.mark_busy();
        let depth = slot.depth.fetch_sub(1, Ordering::Relaxed) - 1;

        match middleware::deliver(actor, job, metrics.as_ref()).await {
            Delivery::Succeeded => {},
            Delivery::Failed => {
                slot.failed.fetch_add(1, Ordering::Relaxed);
            },
            Delivery::Panicked => {
                slot.failed.fetch_add(1, Ordering::Relaxed);
                slot.panics.fetch_add(1, Ordering::Relaxed);
            },
        }
        slot.processed.fetch_add(1, Ordering::Relaxed);

        metrics.record_inbox_depth(actor, depth.max(0), capacity);
        slot.state.mark_idle();
    }
}
