//! Consumer error types

use seqbus_dispatch::DispatchError;
use thiserror::Error;

/// Result type for consumer operations
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Errors raised on the consuming side before or while handing a record to the engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// A record arrived on a topic nobody subscribed to
    #[error("no subscription for topic '{topic}'")]
    UnknownTopic {
        /// Topic of the record
        topic: String,
    },

    /// No header, key or subject segment yielded a usable aggregate ID
    #[error("aggregate_id not found in any source")]
    AggregateIdNotFound,

    /// A candidate aggregate ID failed validation
    #[error("invalid aggregate_id: {reason}")]
    InvalidAggregateId {
        /// What was wrong with it
        reason: String,
    },

    /// The dispatcher refused the message
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A lag source could not report partition lag
    #[error("lag source error: {message}")]
    LagSource {
        /// Underlying error text
        message: String,
    },

    /// Invalid consumer configuration
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem
        message: String,
    },
}

impl ConsumerError {
    /// Lag source failure with the given text.
    pub fn lag_source(message: impl Into<String>) -> Self {
        Self::LagSource { message: message.into() }
    }

    /// Whether the record can be offered again later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Dispatch(err) => err.is_retryable(),
            Self::LagSource { .. } => true,
            _ => false,
        }
    }
}

impl From<seqbus_core::Error> for ConsumerError {
    fn from(err: seqbus_core::Error) -> Self {
        Self::Configuration { message: err.to_string() }
    }
}
