//! Consumer backlog detection.
//!
//! A [`BacklogDetector`] polls a [`LagSource`] for per-partition lag and decides
//! whether the consumer group is behind. A group is behind when any partition lags
//! by more than `lag_threshold` records, or when its oldest pending record is older
//! than `time_threshold`. While started, the detector re-checks every
//! `check_interval` and hands each snapshot to the registered observers.

use crate::{
    config::ConsumerConfig,
    error::{ConsumerError, Result},
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use seqbus_core::{config::BacklogConfig, PartitionId, Timestamp};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long an observer may take to handle one notification.
pub const OBSERVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Error returned by observers. Logged, never propagated.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Lag of one partition for a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionLag {
    /// Topic of the partition
    pub topic: String,
    /// Partition number
    pub partition: PartitionId,
    /// Records between the committed offset and the head; negative values count as 0
    pub lag: i64,
    /// Broker timestamp of the oldest uncommitted record, when known
    pub oldest_pending: Option<Timestamp>,
}

impl PartitionLag {
    /// Lag of `partition` on `topic` with no age information.
    pub fn new(topic: impl Into<String>, partition: impl Into<PartitionId>, lag: i64) -> Self {
        Self { topic: topic.into(), partition: partition.into(), lag, oldest_pending: None }
    }

    /// Attach the timestamp of the oldest pending record.
    #[must_use]
    pub fn with_oldest_pending(mut self, at: Timestamp) -> Self {
        self.oldest_pending = Some(at);
        self
    }
}

/// One backlog snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacklogState {
    /// Whether the group is behind
    pub has_backlog: bool,
    /// Total lag over all partitions
    pub lag_count: i64,
    /// Age of the oldest pending record
    pub lag_time: Duration,
    /// Group the snapshot is for
    pub consumer_group: String,
    /// When the snapshot was taken
    pub timestamp: Timestamp,
}

/// Per-topic breakdown of a lag poll.
#[derive(Debug, Clone, Serialize)]
pub struct BacklogInfo {
    /// Group the breakdown is for
    pub consumer_group: String,
    /// When the lag source was polled
    pub check_time: Timestamp,
    /// Total lag over all topics
    pub total_lag: i64,
    /// Topics by name
    pub topics: BTreeMap<String, TopicBacklog>,
}

/// Lag of one topic.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TopicBacklog {
    /// Sum of partition lags
    pub total_lag: i64,
    /// Partition detail
    pub partitions: Vec<PartitionLag>,
}

/// Supplies partition lag for a consumer group. Implemented by broker adapters.
#[async_trait]
pub trait LagSource: Send + Sync + 'static {
    /// Current lag of every partition the group is assigned.
    async fn partition_lags(&self, consumer_group: &str) -> Result<Vec<PartitionLag>>;
}

/// Receives every snapshot the detector's loop produces.
#[async_trait]
pub trait BacklogObserver: Send + Sync + 'static {
    /// Handle one snapshot. `ctx` is cancelled when the detector stops or the
    /// notification times out.
    async fn on_backlog_state(
        &self,
        ctx: CancellationToken,
        state: &BacklogState,
    ) -> std::result::Result<(), ObserverError>;
}

struct MonitorTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic lag monitor for one consumer group.
pub struct BacklogDetector {
    consumer_group: String,
    config: BacklogConfig,
    source: Arc<dyn LagSource>,
    last_check: tokio::sync::Mutex<Option<(Instant, BacklogState)>>,
    observers: RwLock<Vec<Arc<dyn BacklogObserver>>>,
    monitor: Mutex<Option<MonitorTask>>,
}

impl BacklogDetector {
    /// Create a detector. Nothing runs until [`start`](Self::start).
    pub fn new(
        consumer_group: impl Into<String>,
        config: BacklogConfig,
        source: Arc<dyn LagSource>,
    ) -> Result<Self> {
        if config.check_interval.is_zero() {
            return Err(ConsumerError::Configuration {
                message: "backlog check interval must be greater than 0".into(),
            });
        }

        Ok(Self {
            consumer_group: consumer_group.into(),
            config,
            source,
            last_check: tokio::sync::Mutex::new(None),
            observers: RwLock::new(Vec::new()),
            monitor: Mutex::new(None),
        })
    }

    /// Detector for the group and thresholds in `config`.
    pub fn from_config(config: &ConsumerConfig, source: Arc<dyn LagSource>) -> Result<Self> {
        Self::new(config.consumer_group.clone(), config.backlog.clone(), source)
    }

    /// Group this detector watches.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Thresholds in use.
    #[must_use]
    pub const fn config(&self) -> &BacklogConfig {
        &self.config
    }

    /// Add an observer for the loop's snapshots.
    pub fn register_observer(&self, observer: Arc<dyn BacklogObserver>) {
        self.observers.write().push(observer);
    }

    /// Whether the check loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Current snapshot. A result younger than `check_interval` is reused instead of
    /// polling the lag source again.
    pub async fn check(&self) -> Result<BacklogState> {
        let mut last = self.last_check.lock().await;
        if let Some((at, state)) = last.as_ref() {
            if at.elapsed() < self.config.check_interval {
                return Ok(state.clone());
            }
        }
        self.poll(&mut last).await
    }

    /// Whether the group is caught up. Shares the cache of [`check`](Self::check).
    pub async fn is_no_backlog(&self) -> Result<bool> {
        Ok(!self.check().await?.has_backlog)
    }

    /// Per-topic lag breakdown, always polled fresh.
    pub async fn backlog_info(&self) -> Result<BacklogInfo> {
        let lags = self.source.partition_lags(&self.consumer_group).await?;
        let mut topics: BTreeMap<String, TopicBacklog> = BTreeMap::new();
        for lag in lags {
            let topic = topics.entry(lag.topic.clone()).or_default();
            topic.total_lag += lag.lag.max(0);
            topic.partitions.push(lag);
        }

        Ok(BacklogInfo {
            consumer_group: self.consumer_group.clone(),
            check_time: Utc::now(),
            total_lag: topics.values().map(|t| t.total_lag).sum(),
            topics,
        })
    }

    /// Spawn the check loop under a child of `ctx`. Idempotent.
    pub fn start(self: &Arc<Self>, ctx: &CancellationToken) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let shutdown = ctx.child_token();
        let handle = tokio::spawn(Arc::clone(self).run(shutdown.clone()));
        *monitor = Some(MonitorTask { shutdown, handle });

        info!(
            consumer_group = %self.consumer_group,
            check_interval_ms = self.config.check_interval.as_millis() as u64,
            "Backlog detector started"
        );
    }

    /// Cancel the check loop and wait for it. Idempotent.
    pub async fn stop(&self) {
        let task = self.monitor.lock().take();
        let Some(task) = task else {
            return;
        };

        task.shutdown.cancel();
        if let Err(err) = task.handle.await {
            error!(consumer_group = %self.consumer_group, error = %err, "Backlog detector task failed");
        }
        info!(consumer_group = %self.consumer_group, "Backlog detector stopped");
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let polled = {
                        let mut last = self.last_check.lock().await;
                        self.poll(&mut last).await
                    };
                    match polled {
                        Ok(state) => self.notify(&shutdown, state),
                        Err(err) => error!(consumer_group = %self.consumer_group, error = %err, "Backlog check failed"),
                    }
                },
            }
        }
    }

    async fn poll(&self, last: &mut Option<(Instant, BacklogState)>) -> Result<BacklogState> {
        let lags = match self.source.partition_lags(&self.consumer_group).await {
            Ok(lags) => lags,
            Err(err) => {
                error!(consumer_group = %self.consumer_group, error = %err, "Failed to read partition lag");
                return Err(err);
            },
        };

        let state = self.evaluate(&lags, Utc::now());
        if state.has_backlog {
            warn!(
                consumer_group = %self.consumer_group,
                lag_count = state.lag_count,
                lag_time_ms = state.lag_time.as_millis() as u64,
                "Message backlog detected"
            );
        } else {
            debug!(consumer_group = %self.consumer_group, lag_count = state.lag_count, "No message backlog");
        }

        *last = Some((Instant::now(), state.clone()));
        Ok(state)
    }

    fn evaluate(&self, lags: &[PartitionLag], now: Timestamp) -> BacklogState {
        let lag_count = lags.iter().map(|l| l.lag.max(0)).sum();
        let over_count = lags.iter().any(|l| l.lag > self.config.lag_threshold);
        let lag_time = lags
            .iter()
            .filter(|l| l.lag > 0)
            .filter_map(|l| l.oldest_pending)
            .min()
            .and_then(|oldest| (now - oldest).to_std().ok())
            .unwrap_or_default();

        BacklogState {
            has_backlog: over_count || lag_time > self.config.time_threshold,
            lag_count,
            lag_time,
            consumer_group: self.consumer_group.clone(),
            timestamp: now,
        }
    }

    fn notify(&self, shutdown: &CancellationToken, state: BacklogState) {
        let observers = self.observers.read().clone();
        for observer in observers {
            let ctx = shutdown.child_token();
            let state = state.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(OBSERVER_TIMEOUT, observer.on_backlog_state(ctx.clone(), &state)).await
                {
                    Ok(Ok(())) => {},
                    Ok(Err(err)) => {
                        error!(has_backlog = state.has_backlog, error = %err, "Backlog callback failed");
                    },
                    Err(_) => {
                        ctx.cancel();
                        error!(has_backlog = state.has_backlog, "Backlog callback timed out");
                    },
                }
            });
        }
    }
}
