//! One sequential lane bound to one aggregate key.
//!
//! Processors are created on demand by the
//! [`AggregateProcessorManager`](crate::AggregateProcessorManager). Each owns a
//! bounded mailbox and records when it last accepted or finished a message, which
//! is what the manager's idle sweep looks at.

use crate::{
    error::{DispatchError, Result},
    job::{panic_message, Job},
    lane::{AtomicLaneState, LaneId, LaneState},
    rate_limit::RateLimiter,
};
use crossbeam::atomic::AtomicCell;
use futures::FutureExt;
use parking_lot::Mutex;
use seqbus_core::{AggregateMessage, ProcessingError, SharedHandler};
use serde::Serialize;
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::mpsc::{self, Permit},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Processor snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStats {
    /// Aggregate this lane serves
    pub aggregate_id: String,
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
    /// Handler panics contained
    pub panics: u64,
    /// Time since the last accepted or finished message
    pub idle_for_ms: u64,
}

/// Reserved mailbox slot. Sending cannot fail or block.
pub struct ProcessorPermit<'a> {
    permit: Permit<'a, Job>,
    last_activity: &'a AtomicCell<Instant>,
}

impl ProcessorPermit<'_> {
    pub(crate) fn send(self, job: Job) {
        self.permit.send(job);
        self.last_activity.store(Instant::now());
    }
}

/// Sequential lane for a single aggregate.
pub struct AggregateProcessor {
    aggregate_id: String,
    capacity: usize,
    default_handler: Option<SharedHandler>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    sender: mpsc::Sender<Job>,
    receiver: Mutex<Option<mpsc::Receiver<Job>>>,
    state: AtomicLaneState,
    last_activity: AtomicCell<Instant>,
    shutdown: CancellationToken,
    finished: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    processed: AtomicU64,
    failed: AtomicU64,
    panics: AtomicU64,
}

impl AggregateProcessor {
    /// Create a processor with a mailbox of `capacity` messages.
    pub fn new(
        aggregate_id: impl Into<String>,
        capacity: usize,
        default_handler: Option<SharedHandler>,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(DispatchError::config("processor mailbox capacity must be greater than 0"));
        }
        let (sender, receiver) = mpsc::channel(capacity);
        Ok(Self {
            aggregate_id: aggregate_id.into(),
            capacity,
            default_handler,
            rate_limiter,
            sender,
            receiver: Mutex::new(Some(receiver)),
            state: AtomicLaneState::new(),
            last_activity: AtomicCell::new(Instant::now()),
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
            task: Mutex::new(None),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            panics: AtomicU64::new(0),
        })
    }

    /// Spawn the processing loop. A second call is a no-op; starting a stopped
    /// processor fails. Cancelling `ctx` stops the processor.
    pub fn start(self: &Arc<Self>, ctx: &CancellationToken) -> Result<()> {
        match self.state.start() {
            Ok(()) => {},
            Err(LaneState::Stopped) => return Err(DispatchError::Stopped),
            Err(_) => return Ok(()),
        }

        let Some(receiver) = self.receiver.lock().take() else {
            return Ok(());
        };
        let handle = tokio::spawn(Arc::clone(self).run(receiver, ctx.clone()));
        *self.task.lock() = Some(handle);
        debug!(aggregate_id = %self.aggregate_id, "Aggregate processor started");
        Ok(())
    }

    /// Stop accepting messages. Queued messages are answered with
    /// [`ProcessingError::ShuttingDown`] by the loop. Returns without waiting;
    /// see [`join`](Self::join). Idempotent.
    pub fn stop(&self) {
        if self.state.stop() {
            self.shutdown.cancel();
            debug!(aggregate_id = %self.aggregate_id, "Aggregate processor stopping");
        }
        // Never spawned: there is no loop left to signal completion.
        if self.receiver.lock().take().is_some() {
            self.finished.cancel();
        }
    }

    /// Whether the loop has exited and the mailbox is drained.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Wait until the loop has exited and the mailbox is drained, or `ctx` is
    /// cancelled. Unlike [`join`](Self::join) this can be awaited by any number of
    /// callers.
    pub async fn finished(&self, ctx: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            () = self.finished.cancelled() => Ok(()),
            () = ctx.cancelled() => Err(DispatchError::Cancelled),
        }
    }

    /// Wait for the loop to finish draining.
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(aggregate_id = %self.aggregate_id, error = %err, "Aggregate processor task failed");
            }
        }
    }

    /// Reserve a mailbox slot, waiting until there is room, the processor stops,
    /// or `ctx` is cancelled.
    pub async fn reserve(&self, ctx: &CancellationToken) -> Result<ProcessorPermit<'_>> {
        if self.state.load() == LaneState::Created {
            return Err(DispatchError::NotRunning);
        }

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(self.closed()),
            () = ctx.cancelled() => Err(DispatchError::Cancelled),
            permit = self.sender.reserve() => match permit {
                Ok(permit) => Ok(ProcessorPermit { permit, last_activity: &self.last_activity }),
                Err(_) => Err(self.closed()),
            },
        }
    }

    /// Queue `message`, blocking until there is room. There is no enqueue timeout:
    /// this strategy relies on cache pressure rather than per-lane backpressure.
    pub async fn submit(&self, ctx: &CancellationToken, message: AggregateMessage) -> Result<()> {
        if message.aggregate_id() != self.aggregate_id {
            return Err(DispatchError::config(format!(
                "message for '{}' submitted to processor for '{}'",
                message.aggregate_id(),
                self.aggregate_id
            )));
        }
        let job = Job::resolve(message, self.default_handler.as_ref())?;
        self.reserve(ctx).await?.send(job);
        Ok(())
    }

    /// Aggregate this processor serves.
    #[must_use]
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> LaneState {
        self.state.load()
    }

    /// Whether the processor reached its terminal state.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.is_stopped()
    }

    /// Last time a message was accepted or finished.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity.load()
    }

    /// Messages waiting in the mailbox.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.capacity.saturating_sub(self.sender.capacity())
    }

    /// Idle means: waiting for work, nothing queued, and no activity for longer
    /// than `idle_timeout`.
    #[must_use]
    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.state.load() == LaneState::Idle
            && self.queued() == 0
            && self.last_activity.load().elapsed() > idle_timeout
    }

    /// Current snapshot.
    #[must_use]
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            aggregate_id: self.aggregate_id.clone(),
            state: self.state.load(),
            queued: self.queued(),
            capacity: self.capacity,
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            idle_for_ms: self.last_activity.load().elapsed().as_millis() as u64,
        }
    }

    fn closed(&self) -> DispatchError {
        DispatchError::LaneClosed { lane: LaneId::Aggregate(self.aggregate_id.clone()) }
    }

    async fn run(self: Arc<Self>, mut mailbox: mpsc::Receiver<Job>, parent: CancellationToken) {
        let _finished = self.finished.clone().drop_guard();
        loop {
            self.state.mark_idle();
            let job = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                () = parent.cancelled() => break,
                job = mailbox.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            self.state.mark_busy();
            self.process(job).await;
            self.last_activity.store(Instant::now());
        }

        self.stop();
        self.drain(mailbox).await;
    }

    async fn process(&self, mut job: Job) {
        if let Some(limiter) = &self.rate_limiter {
            if let Err(err) = limiter.wait(job.message.context()).await {
                debug!(aggregate_id = %self.aggregate_id, error = %err, "Rate limiter refused message");
                job.message.fail(ProcessingError::RateLimited { reason: err.to_string() });
                return;
            }
        }

        match AssertUnwindSafe(job.invoke()).catch_unwind().await {
            Ok(Ok(())) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                job.message.complete(Ok(()));
            },
            Ok(Err(err)) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(aggregate_id = %self.aggregate_id, error = %err, "Message handler failed");
                job.message.complete(Err(ProcessingError::Handler(err)));
            },
            Err(panic) => {
                self.panics.fetch_add(1, Ordering::Relaxed);
                error!(
                    aggregate_id = %self.aggregate_id,
                    message_id = %job.message.id(),
                    panic = %panic_message(panic.as_ref()),
                    "Recovered from handler panic"
                );
            },
        }
    }

    async fn drain(&self, mut mailbox: mpsc::Receiver<Job>) {
        mailbox.close();
        let mut drained = 0_usize;
        while let Some(mut job) = mailbox.recv().await {
            job.message.fail(ProcessingError::ShuttingDown);
            drained += 1;
        }
        debug!(aggregate_id = %self.aggregate_id, drained, "Aggregate processor stopped");
    }
}

impl std::fmt::Debug for AggregateProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateProcessor")
            .field("aggregate_id", &self.aggregate_id)
            .field("state", &self.state.load())
            .field("queued", &self.queued())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
