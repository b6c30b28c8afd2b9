//! # Seqbus Dispatch
//!
//! The ordered concurrent dispatch engine. Every message tagged with an aggregate key
//! is routed to exactly one sequential lane, and many lanes run in parallel. Three
//! strategies share the [`Dispatcher`] contract:
//!
//! - [`KeyedWorkerPool`]: a fixed number of hash-routed lanes. Constant memory,
//!   unrelated keys may share a lane.
//! - [`AggregateProcessorManager`]: one lane per active key, held in an LRU cache with
//!   idle eviction. Memory tracks the working set.
//! - [`ActorPool`]: hash-routed like the keyed pool, with supervised actors that turn
//!   handler panics into errors and restart after crashes.
//!
//! All three apply backpressure with bounded mailboxes and report it as
//! [`DispatchError::QueueFull`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use seqbus_core::{handler_fn, AggregateMessage, DispatchConfig};
//! use seqbus_dispatch::{build_dispatcher, Dispatcher};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), seqbus_dispatch::DispatchError> {
//! let handler = handler_fn(|_ctx, _payload| async { Ok(()) });
//! let dispatcher = build_dispatcher(&DispatchConfig::default(), Some(handler), None)?;
//!
//! let ctx = CancellationToken::new();
//! dispatcher.start(&ctx).await?;
//!
//! let mut message = AggregateMessage::new("order-42", Bytes::from_static(b"created"));
//! let completion = message.completion();
//! dispatcher.dispatch(&ctx, message).await?;
//! let _outcome = completion.wait().await;
//!
//! dispatcher.stop().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actor;
pub mod dispatcher;
pub mod error;
mod job;
pub mod keyed_pool;
pub mod lane;
pub mod manager;
pub mod processor;
pub mod rate_limit;
pub mod routing;

pub use crate::{
    actor::{
        ActorPool, ActorPoolMetricsCollector, ActorPoolStats, ActorStats, NoopActorPoolMetrics,
        PrometheusActorPoolMetrics,
    },
    dispatcher::{build_dispatcher, Dispatcher, DispatcherStats},
    error::{DispatchError, Result},
    keyed_pool::{KeyedPoolStats, KeyedWorkerPool, LaneStats},
    lane::{AtomicLaneState, LaneId, LaneState},
    manager::{AggregateProcessorManager, ManagerStats},
    processor::{AggregateProcessor, ProcessorStats},
    rate_limit::{RateLimitError, RateLimiter, RateLimiterHandle, RateLimiterStats, TokenBucketLimiter},
    routing::{fnv1a_32, LaneRouter},
};

/// Convenient glob import for dispatcher users.
pub mod prelude {
    pub use crate::{
        build_dispatcher, ActorPool, AggregateProcessorManager, DispatchError, Dispatcher,
        DispatcherStats, KeyedWorkerPool,
    };
    pub use seqbus_core::prelude::*;
}
