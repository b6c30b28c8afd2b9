//! Dispatch error types
//!
//! Everything `dispatch` can report synchronously. Outcomes of processing travel on
//! the message's completion slot as [`seqbus_core::ProcessingError`] instead.

use crate::lane::LaneId;
use std::time::Duration;
use thiserror::Error;

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Synchronous dispatch and lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The message carried an empty aggregate key; routing is undefined
    #[error("aggregate ID is required for ordered dispatch")]
    MissingAggregateId,

    /// Neither the message nor the dispatcher supplied a handler
    #[error("no handler available for aggregate '{aggregate_id}'")]
    MissingHandler {
        /// Key of the rejected message
        aggregate_id: String,
    },

    /// The target mailbox stayed full for the whole enqueue window
    #[error("queue for lane {lane} is full (waited {waited:?})")]
    QueueFull {
        /// Lane index the key routed to
        lane: usize,
        /// Time spent waiting for room
        waited: Duration,
    },

    /// The caller's token was cancelled before the message was queued
    #[error("dispatch cancelled before the message was queued")]
    Cancelled,

    /// `dispatch` was called before `start`
    #[error("dispatcher is not running")]
    NotRunning,

    /// The dispatcher has been stopped and cannot be restarted
    #[error("dispatcher is stopped")]
    Stopped,

    /// The target lane is no longer accepting messages
    #[error("lane {lane} is closed")]
    LaneClosed {
        /// Lane that refused the message
        lane: LaneId,
    },

    /// Invalid dispatcher configuration
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem
        message: String,
    },

    /// Metrics registration or export failed
    #[error("metrics error: {message}")]
    Metrics {
        /// Underlying registry message
        message: String,
    },
}

impl DispatchError {
    /// Whether the caller may retry the same message later.
    ///
    /// Backpressure and closed lanes are transient; routing, handler and lifecycle
    /// errors are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::LaneClosed { .. })
    }

    /// Whether this is the backpressure signal callers should answer with flow control.
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}

impl From<prometheus::Error> for DispatchError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics { message: err.to_string() }
    }
}

impl From<seqbus_core::Error> for DispatchError {
    fn from(err: seqbus_core::Error) -> Self {
        Self::Configuration { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(DispatchError::QueueFull { lane: 0, waited: Duration::from_millis(5) }.is_retryable());
        assert!(DispatchError::LaneClosed { lane: LaneId::Index(2) }.is_retryable());
        assert!(!DispatchError::MissingAggregateId.is_retryable());
        assert!(!DispatchError::Cancelled.is_retryable());
        assert!(!DispatchError::Stopped.is_retryable());
        assert!(!DispatchError::MissingHandler { aggregate_id: "a".into() }.is_retryable());
    }

    #[test]
    fn test_display_includes_lane() {
        let err = DispatchError::LaneClosed { lane: LaneId::Aggregate("order-9".into()) };
        assert_eq!(err.to_string(), "lane aggregate:order-9 is closed");
    }
}
