//! Recovery mode management.
//!
//! A service catching up on a backlog can switch into [`RecoveryMode::Active`]
//! and back. The [`RecoveryManager`] owns that flag, counts transitions, and tells
//! registered observers about every change. Fed by a [`BacklogDetector`], it flips
//! the mode on its own.

use crate::backlog::{BacklogDetector, BacklogObserver, BacklogState, ObserverError, OBSERVER_TIMEOUT};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use seqbus_core::{config::RecoveryConfig, Timestamp};
use serde::Serialize;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Transition threshold used when the configured one is 0.
pub const DEFAULT_TRANSITION_THRESHOLD: u32 = 3;

/// Processing mode of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RecoveryMode {
    /// Caught up
    Normal = 0,
    /// Working through a backlog
    Active = 1,
}

impl RecoveryMode {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Active,
            _ => Self::Normal,
        }
    }
}

impl fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// Notified after every mode transition.
#[async_trait]
pub trait RecoveryObserver: Send + Sync + 'static {
    /// Handle a transition into `mode`. `ctx` is cancelled when the manager stops or
    /// the notification times out.
    async fn on_mode_change(
        &self,
        ctx: CancellationToken,
        mode: RecoveryMode,
        reason: &str,
    ) -> std::result::Result<(), ObserverError>;
}

/// Manager snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStats {
    /// Whether recovery mode is managed
    pub enabled: bool,
    /// Whether backlog snapshots switch the mode
    pub auto_detection: bool,
    /// Current mode
    pub mode: RecoveryMode,
    /// Lag count that must be exceeded to enter active mode
    pub transition_threshold: u32,
    /// Transitions since creation
    pub transition_count: u64,
    /// Time of the last transition, or of creation
    pub last_transition: Timestamp,
}

/// Owner of the recovery mode flag.
pub struct RecoveryManager {
    config: RecoveryConfig,
    mode: AtomicU8,
    transitions: AtomicU64,
    last_transition: Mutex<Timestamp>,
    observers: RwLock<Vec<Arc<dyn RecoveryObserver>>>,
    shutdown: CancellationToken,
}

impl RecoveryManager {
    /// Create a manager in [`RecoveryMode::Normal`].
    #[must_use]
    pub fn new(mut config: RecoveryConfig) -> Self {
        if config.transition_threshold == 0 {
            config.transition_threshold = DEFAULT_TRANSITION_THRESHOLD;
        }

        Self {
            config,
            mode: AtomicU8::new(RecoveryMode::Normal as u8),
            transitions: AtomicU64::new(0),
            last_transition: Mutex::new(Utc::now()),
            observers: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Subscribe to `detector` when automatic detection is on. Returns whether it did.
    pub fn attach(self: &Arc<Self>, detector: &BacklogDetector) -> bool {
        if !self.config.enabled {
            info!("Recovery mode is disabled");
            return false;
        }
        if !self.config.auto_detection {
            return false;
        }

        detector.register_observer(Arc::clone(self) as Arc<dyn BacklogObserver>);
        info!(
            consumer_group = detector.consumer_group(),
            transition_threshold = self.config.transition_threshold,
            "Recovery manager attached to backlog detector"
        );
        true
    }

    /// Cancel in-flight observer notifications.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            info!("Recovery manager stopped");
        }
    }

    /// Add an observer for transitions.
    pub fn register_observer(&self, observer: Arc<dyn RecoveryObserver>) {
        self.observers.write().push(observer);
    }

    /// Switch to `mode`. Returns `false` without side effects when already in it.
    pub fn set_mode(&self, mode: RecoveryMode, reason: &str) -> bool {
        let old = RecoveryMode::from_u8(self.mode.swap(mode as u8, Ordering::AcqRel));
        if old == mode {
            return false;
        }

        *self.last_transition.lock() = Utc::now();
        let count = self.transitions.fetch_add(1, Ordering::Relaxed) + 1;
        info!(old_mode = %old, new_mode = %mode, reason, transition_count = count, "Recovery mode changed");

        self.notify(mode, reason);
        true
    }

    /// Switch to `mode` outside automatic detection. The reason is recorded as
    /// `forced: <reason>`.
    pub fn force_mode(&self, mode: RecoveryMode, reason: &str) -> bool {
        warn!(mode = %mode, reason, "Forcing recovery mode change");
        self.set_mode(mode, &format!("forced: {reason}"))
    }

    /// Apply one backlog snapshot. A backlog whose lag count exceeds the transition
    /// threshold enters active mode; a cleared backlog returns to normal.
    pub fn handle_backlog_state(&self, state: &BacklogState) -> bool {
        if !self.config.enabled || !self.config.auto_detection {
            return false;
        }

        match (state.has_backlog, self.mode()) {
            (true, RecoveryMode::Normal)
                if state.lag_count > i64::from(self.config.transition_threshold) =>
            {
                self.set_mode(
                    RecoveryMode::Active,
                    &format!(
                        "backlog detected: lag={}, lagTime={:?}",
                        state.lag_count, state.lag_time
                    ),
                )
            },
            (false, RecoveryMode::Active) => self.set_mode(RecoveryMode::Normal, "backlog cleared"),
            _ => false,
        }
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> RecoveryMode {
        RecoveryMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Whether the mode is [`RecoveryMode::Active`].
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.mode() == RecoveryMode::Active
    }

    /// Transitions since creation.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Time of the last transition, or of creation.
    #[must_use]
    pub fn last_transition(&self) -> Timestamp {
        *self.last_transition.lock()
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Manager snapshot.
    #[must_use]
    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            enabled: self.config.enabled,
            auto_detection: self.config.auto_detection,
            mode: self.mode(),
            transition_threshold: self.config.transition_threshold,
            transition_count: self.transition_count(),
            last_transition: self.last_transition(),
        }
    }

    fn notify(&self, mode: RecoveryMode, reason: &str) {
        let observers = self.observers.read().clone();
        if observers.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(mode = %mode, "No runtime available, recovery observers not notified");
            return;
        };

        for observer in observers {
            let ctx = self.shutdown.child_token();
            let reason = reason.to_string();
            runtime.spawn(async move {
                match tokio::time::timeout(OBSERVER_TIMEOUT, observer.on_mode_change(ctx.clone(), mode, &reason))
                    .await
                {
                    Ok(Ok(())) => {},
                    Ok(Err(err)) => {
                        error!(mode = %mode, reason = %reason, error = %err, "Recovery mode callback failed");
                    },
                    Err(_) => {
                        ctx.cancel();
                        error!(mode = %mode, reason = %reason, "Recovery mode callback timed out");
                    },
                }
            });
        }
    }
}

#[async_trait]
impl BacklogObserver for RecoveryManager {
    async fn on_backlog_state(
        &self,
        _ctx: CancellationToken,
        state: &BacklogState,
    ) -> std::result::Result<(), ObserverError> {
        self.handle_backlog_state(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<(RecoveryMode, String)>);

    #[async_trait]
    impl RecoveryObserver for Forward {
        async fn on_mode_change(
            &self,
            _ctx: CancellationToken,
            mode: RecoveryMode,
            reason: &str,
        ) -> std::result::Result<(), ObserverError> {
            self.0.send((mode, reason.to_string()))?;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl RecoveryObserver for Failing {
        async fn on_mode_change(
            &self,
            _ctx: CancellationToken,
            _mode: RecoveryMode,
            _reason: &str,
        ) -> std::result::Result<(), ObserverError> {
            Err("observer rejected".into())
        }
    }

    fn snapshot(has_backlog: bool, lag_count: i64) -> BacklogState {
        BacklogState {
            has_backlog,
            lag_count,
            lag_time: Duration::from_secs(2),
            consumer_group: "g".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_set_mode_counts_real_transitions_only() {
        let manager = RecoveryManager::new(RecoveryConfig::default());
        let created = manager.last_transition();

        assert!(!manager.set_mode(RecoveryMode::Normal, "noop"));
        assert_eq!(manager.transition_count(), 0);

        assert!(manager.set_mode(RecoveryMode::Active, "manual"));
        assert!(manager.is_active());
        assert!(!manager.set_mode(RecoveryMode::Active, "again"));
        assert_eq!(manager.transition_count(), 1);
        assert!(manager.last_transition() >= created);
    }

    #[test]
    fn test_zero_threshold_defaults() {
        let manager = RecoveryManager::new(RecoveryConfig { transition_threshold: 0, ..RecoveryConfig::default() });
        assert_eq!(manager.config().transition_threshold, DEFAULT_TRANSITION_THRESHOLD);
    }

    #[test]
    fn test_backlog_snapshots_drive_the_mode() {
        let manager = RecoveryManager::new(RecoveryConfig::default());

        assert!(!manager.handle_backlog_state(&snapshot(true, 3)));
        assert_eq!(manager.mode(), RecoveryMode::Normal);

        assert!(manager.handle_backlog_state(&snapshot(true, 4)));
        assert!(manager.is_active());
        assert!(!manager.handle_backlog_state(&snapshot(true, 4000)));

        assert!(manager.handle_backlog_state(&snapshot(false, 0)));
        assert_eq!(manager.mode(), RecoveryMode::Normal);
        assert!(!manager.handle_backlog_state(&snapshot(false, 0)));
        assert_eq!(manager.transition_count(), 2);
    }

    #[test]
    fn test_auto_detection_off_ignores_snapshots() {
        let manager =
            RecoveryManager::new(RecoveryConfig { auto_detection: false, ..RecoveryConfig::default() });
        assert!(!manager.handle_backlog_state(&snapshot(true, 1_000)));
        assert!(manager.force_mode(RecoveryMode::Active, "operator"));
        assert!(manager.is_active());
    }

    #[tokio::test]
    async fn test_observers_receive_transitions() {
        let manager = RecoveryManager::new(RecoveryConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register_observer(Arc::new(Failing));
        manager.register_observer(Arc::new(Forward(tx)));

        manager.handle_backlog_state(&snapshot(true, 10));
        let (mode, reason) = rx.recv().await.unwrap();
        assert_eq!(mode, RecoveryMode::Active);
        assert!(reason.starts_with("backlog detected: lag=10"), "{reason}");

        manager.force_mode(RecoveryMode::Normal, "drill");
        assert_eq!(rx.recv().await.unwrap(), (RecoveryMode::Normal, "forced: drill".to_string()));

        let stats = manager.stats();
        assert_eq!(stats.transition_count, 2);
        assert_eq!(serde_json::to_value(&stats).unwrap()["mode"], "normal");
        manager.stop();
        manager.stop();
    }
}
