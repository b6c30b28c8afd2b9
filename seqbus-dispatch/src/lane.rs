//! Lane identity, lifecycle and bounded mailbox handoff.
//!
//! Every strategy runs its work on lanes: single-consumer loops that handle the
//! messages of their mailbox one at a time, in arrival order. A lane moves through
//!
//! ```text
//! Created → Running ⇄ Idle → Stopped
//! ```
//!
//! and `Stopped` is terminal.

use crate::error::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
    time::{Duration, Instant},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Identity of a lane, by index in a pool or by aggregate key in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneId {
    /// Fixed pool slot
    Index(usize),
    /// Per-aggregate processor
    Aggregate(String),
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Aggregate(key) => write!(f, "aggregate:{key}"),
        }
    }
}

/// Lane lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LaneState {
    /// Constructed, loop not yet spawned
    Created = 0,
    /// Handling a message
    Running = 1,
    /// Waiting for the next message
    Idle = 2,
    /// Terminal
    Stopped = 3,
}

impl LaneState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Idle,
            _ => Self::Stopped,
        }
    }

    /// Whether the state machine permits `self → next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running)
                | (Self::Running, Self::Idle)
                | (Self::Idle, Self::Running)
                | (Self::Created | Self::Running | Self::Idle, Self::Stopped)
        )
    }
}

/// Lock-free lane state cell that only performs legal transitions.
#[derive(Debug)]
pub struct AtomicLaneState(AtomicU8);

impl AtomicLaneState {
    /// New cell in `Created`.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU8::new(LaneState::Created as u8))
    }

    /// Current state.
    #[must_use]
    pub fn load(&self) -> LaneState {
        LaneState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Atomically move `from → to`. Fails if the transition is illegal or the
    /// current state is not `from`.
    pub fn transition(&self, from: LaneState, to: LaneState) -> bool {
        from.can_transition_to(to)
            && self
                .0
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// `Created → Running`. On failure returns the state that blocked it.
    pub fn start(&self) -> std::result::Result<(), LaneState> {
        if self.transition(LaneState::Created, LaneState::Running) {
            Ok(())
        } else {
            Err(self.load())
        }
    }

    /// `Running → Idle`.
    pub fn mark_idle(&self) -> bool {
        self.transition(LaneState::Running, LaneState::Idle)
    }

    /// `Idle → Running`.
    pub fn mark_busy(&self) -> bool {
        self.transition(LaneState::Idle, LaneState::Running)
    }

    /// Move to `Stopped`. Returns `true` only for the call that performed the move.
    pub fn stop(&self) -> bool {
        self.0.swap(LaneState::Stopped as u8, Ordering::AcqRel) != LaneState::Stopped as u8
    }

    /// Whether the lane reached its terminal state.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.load() == LaneState::Stopped
    }
}

impl Default for AtomicLaneState {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue `item` on `sender`, waiting at most `timeout` for room.
///
/// A free slot is taken immediately. Otherwise the wait races the caller's token;
/// cancellation wins ties. Timing out yields [`DispatchError::QueueFull`].
pub(crate) async fn enqueue_bounded<T>(
    sender: &mpsc::Sender<T>,
    lane: usize,
    item: T,
    ctx: &CancellationToken,
    timeout: Duration,
) -> Result<()> {
    match sender.try_reserve() {
        Ok(permit) => {
            permit.send(item);
            return Ok(());
        },
        Err(TrySendError::Closed(())) => {
            return Err(DispatchError::LaneClosed { lane: LaneId::Index(lane) });
        },
        Err(TrySendError::Full(())) => {},
    }

    let started = Instant::now();
    tokio::select! {
        biased;
        () = ctx.cancelled() => Err(DispatchError::Cancelled),
        reserved = tokio::time::timeout(timeout, sender.reserve()) => match reserved {
            Ok(Ok(permit)) => {
                permit.send(item);
                Ok(())
            },
            Ok(Err(_)) => Err(DispatchError::LaneClosed { lane: LaneId::Index(lane) }),
            Err(_) => Err(DispatchError::QueueFull { lane, waited: started.elapsed() }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        let state = AtomicLaneState::new();
        assert_eq!(state.load(), LaneState::Created);
        assert!(!state.mark_idle());
        assert!(state.start().is_ok());
        assert_eq!(state.start(), Err(LaneState::Running));
        assert!(state.mark_idle());
        assert!(state.mark_busy());
        assert!(state.stop());
        assert!(!state.stop());
    }

    #[test]
    fn test_stopped_is_terminal() {
        let state = AtomicLaneState::new();
        assert!(state.stop());
        assert!(!state.transition(LaneState::Stopped, LaneState::Running));
        assert!(!state.mark_busy());
        assert_eq!(state.start(), Err(LaneState::Stopped));
        assert!(state.is_stopped());
    }

    #[test]
    fn test_transition_table() {
        use LaneState::*;
        assert!(Created.can_transition_to(Running));
        assert!(!Created.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Created));
        assert!(!Running.can_transition_to(Created));
    }

    #[tokio::test]
    async fn test_enqueue_times_out_on_full_mailbox() {
        let (tx, _rx) = mpsc::channel::<u32>(1);
        let ctx = CancellationToken::new();
        enqueue_bounded(&tx, 0, 1, &ctx, Duration::from_millis(10)).await.unwrap();

        let err = enqueue_bounded(&tx, 0, 2, &ctx, Duration::from_millis(20)).await.unwrap_err();
        match err {
            DispatchError::QueueFull { lane, waited } => {
                assert_eq!(lane, 0);
                assert!(waited >= Duration::from_millis(20));
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_enqueue_honours_cancellation() {
        let (tx, _rx) = mpsc::channel::<u32>(1);
        let ctx = CancellationToken::new();
        enqueue_bounded(&tx, 0, 1, &ctx, Duration::from_secs(1)).await.unwrap();

        ctx.cancel();
        let err = enqueue_bounded(&tx, 0, 2, &ctx, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, DispatchError::Cancelled);
    }

    #[tokio::test]
    async fn test_enqueue_to_closed_lane() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);
        let err = enqueue_bounded(&tx, 4, 1, &CancellationToken::new(), Duration::from_millis(5))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::LaneClosed { lane: LaneId::Index(4) });
    }
}
