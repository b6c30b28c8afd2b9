//! # Prelude
//!
//! Commonly used types and traits from seqbus core.

pub use crate::{
    config::{ConfigLoader, DispatchConfig, DispatchStrategy, SeqbusConfig},
    error::{Error, ProcessingError, ProcessingResult, Result},
    handler::{handler_fn, HandlerError, HandlerResult, MessageHandler, SharedHandler},
    message::{AggregateMessage, BrokerMetadata, Completion, DeliveryMode, MessageId},
    types::{Offset, PartitionId, Timestamp},
};

pub use bytes::Bytes;
pub use tokio_util::sync::CancellationToken;
