//! Error types for the seqbus core library.

use crate::handler::HandlerError;
use thiserror::Error;

/// Main error type for seqbus core operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid message format or content
    #[error("Invalid message: {message}")]
    InvalidMessage {
        /// Description of what made the message invalid
        message: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        /// Underlying serializer message
        message: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem
        message: String,
    },

    /// Internal system errors
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure
        message: String,
    },
}

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}

/// Result type alias for seqbus core operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization { message: err.to_string() }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Configuration { message: format!("Failed to parse TOML: {err}") }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Error::Configuration { message: format!("Validation failed: {err}") }
    }
}

/// Terminal outcome of one message, delivered through its completion slot.
///
/// Handler errors are carried verbatim; every other variant is produced by the
/// dispatch engine itself.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// The handler returned an error
    #[error("handler failed: {0}")]
    Handler(HandlerError),

    /// The lane was stopping when the message was dequeued
    #[error("lane is shutting down")]
    ShuttingDown,

    /// The lane's rate limiter refused to admit the message
    #[error("rate limiter rejected message: {reason}")]
    RateLimited {
        /// Why the limiter gave up
        reason: String,
    },

    /// The handler panicked and the panic was contained
    #[error("handler panicked: {message}")]
    Panicked {
        /// Panic payload rendered as text
        message: String,
    },

    /// The lane was retired after exhausting its restart budget
    #[error("lane {lane} failed permanently")]
    LaneFailed {
        /// Index of the retired lane
        lane: usize,
    },
}

impl ProcessingError {
    /// Returns the handler error if this outcome came from the handler.
    pub fn as_handler_error(&self) -> Option<&HandlerError> {
        match self {
            Self::Handler(err) => Some(err),
            _ => None,
        }
    }

    /// Whether the engine (not the handler) produced this outcome.
    pub fn is_engine_error(&self) -> bool {
        !matches!(self, Self::Handler(_))
    }
}

/// Value offered on a message's completion slot.
pub type ProcessingResult = std::result::Result<(), ProcessingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_is_carried_verbatim() {
        let err = ProcessingError::Handler("boom".into());
        assert_eq!(err.as_handler_error().map(ToString::to_string).as_deref(), Some("boom"));
        assert!(!err.is_engine_error());
        assert_eq!(err.to_string(), "handler failed: boom");
    }

    #[test]
    fn test_engine_errors() {
        assert!(ProcessingError::ShuttingDown.is_engine_error());
        assert!(ProcessingError::LaneFailed { lane: 3 }.to_string().contains("lane 3"));
        assert!(ProcessingError::Panicked { message: "oops".into() }.as_handler_error().is_none());
    }

    #[test]
    fn test_config_error_from_toml() {
        let err: Error = toml::from_str::<toml::Value>("not = [valid").unwrap_err().into();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
