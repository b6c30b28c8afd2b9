//! # Seqbus Core
//!
//! Shared vocabulary for the seqbus ordered dispatch engine.
//!
//! Seqbus routes every message tagged with an aggregate key to exactly one sequential
//! execution lane, so events for the same entity are handled strictly in the order they
//! were produced while unrelated entities are processed in parallel. This crate holds the
//! types every other seqbus crate agrees on:
//!
//! - [`message`]: [`AggregateMessage`], its broker metadata and the per-message completion slot
//! - [`handler`]: the [`MessageHandler`] trait and closure adapters
//! - [`config`]: configuration schema, layered loading and validation
//! - [`error`]: error types and result aliases
//! - [`telemetry`]: structured logging bootstrap
//! - [`types`]: partition, offset and timestamp primitives
//!
//! ## Quick Start
//!
//! ```rust
//! use bytes::Bytes;
//! use seqbus_core::prelude::*;
//!
//! # async fn example() {
//! let handler = handler_fn(|_ctx, payload: Bytes| async move {
//!     println!("handling {} bytes", payload.len());
//!     Ok(())
//! });
//!
//! let mut message = AggregateMessage::new("order-42", Bytes::from_static(b"created"))
//!     .with_handler(handler);
//! let completion = message.completion();
//! # drop(completion);
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod prelude;
pub mod telemetry;
pub mod types;

pub use crate::{
    config::{ConfigLoader, DispatchConfig, DispatchStrategy, SeqbusConfig},
    error::{Error, ProcessingError, ProcessingResult, Result},
    handler::{handler_fn, HandlerError, HandlerResult, MessageHandler, SharedHandler},
    message::{AggregateMessage, BrokerMetadata, Completion, DeliveryMode, MessageId},
    types::{Offset, PartitionId, Timestamp},
};

/// Crate version, exposed for diagnostics and stats payloads.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
