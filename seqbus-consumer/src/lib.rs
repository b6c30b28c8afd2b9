//! # Seqbus Consumer
//!
//! The consuming side around the dispatch engine. Broker adapters hand inbound
//! records to a [`Consumer`], which looks up the topic's handler, extracts the
//! aggregate ID and dispatches the record in order with everything else for that
//! aggregate.
//!
//! Alongside the intake path sit two monitors a service may run:
//!
//! - [`BacklogDetector`] polls a [`LagSource`] and reports whether the group is behind
//! - [`RecoveryManager`] flips between normal and active recovery mode from those reports
//!
//! ## Example
//!
//! ```rust,no_run
//! use seqbus_consumer::{Consumer, InboundRecord};
//! use seqbus_core::{handler_fn, DispatchConfig};
//! use seqbus_dispatch::build_dispatcher;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> seqbus_consumer::Result<()> {
//! let dispatcher = build_dispatcher(&DispatchConfig::default(), None, None)?;
//! let consumer = Consumer::new(dispatcher);
//! consumer.subscribe("orders", handler_fn(|_ctx, _payload| async { Ok(()) }));
//!
//! let ctx = CancellationToken::new();
//! consumer.start(&ctx).await?;
//!
//! let record = InboundRecord::new("orders", "created").with_header("X-Aggregate-ID", "order-42");
//! let completion = consumer.deliver(&ctx, record).await?;
//! let _outcome = completion.wait().await;
//!
//! consumer.stop().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backlog;
pub mod config;
pub mod consumer;
pub mod error;
pub mod extract;
pub mod recovery;
pub mod subscription;

pub use crate::{
    backlog::{
        BacklogDetector, BacklogInfo, BacklogObserver, BacklogState, LagSource, ObserverError,
        PartitionLag, TopicBacklog,
    },
    config::ConsumerConfig,
    consumer::{Consumer, InboundRecord},
    error::{ConsumerError, Result},
    extract::{extract_aggregate_id, validate_aggregate_id},
    recovery::{RecoveryManager, RecoveryMode, RecoveryObserver, RecoveryStats},
    subscription::SubscriptionManager,
};

/// Convenient glob import for consumer users.
pub mod prelude {
    pub use crate::{
        BacklogDetector, Consumer, ConsumerConfig, ConsumerError, InboundRecord, LagSource,
        RecoveryManager, RecoveryMode,
    };
    pub use seqbus_dispatch::prelude::*;
}
