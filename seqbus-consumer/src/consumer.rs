//! Record intake.
//!
//! [`Consumer`] turns inbound broker records into [`AggregateMessage`]s and hands
//! them to a [`Dispatcher`]. Broker adapters feed it records and await the returned
//! [`Completion`] before acknowledging.

use crate::{
    backlog::BacklogDetector,
    error::{ConsumerError, Result},
    extract::extract_aggregate_id,
    recovery::{RecoveryManager, RecoveryMode},
    subscription::SubscriptionManager,
};
use bytes::Bytes;
use seqbus_core::{
    AggregateMessage, BrokerMetadata, Completion, DeliveryMode, Offset, PartitionId, SharedHandler,
    Timestamp,
};
use seqbus_dispatch::{Dispatcher, DispatcherStats};
use std::{collections::HashMap, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A record as a broker adapter delivers it.
#[derive(Debug, Clone, Default)]
pub struct InboundRecord {
    /// Topic the record arrived on
    pub topic: String,
    /// Partition the record was read from
    pub partition: Option<PartitionId>,
    /// Offset within the partition
    pub offset: Option<Offset>,
    /// Record key
    pub key: Option<Bytes>,
    /// Record headers
    pub headers: HashMap<String, String>,
    /// Subject, for brokers that route on dotted subjects
    pub subject: Option<String>,
    /// Record body
    pub payload: Bytes,
    /// Broker timestamp
    pub timestamp: Option<Timestamp>,
    /// Delivery contract of the source
    pub delivery: DeliveryMode,
}

impl InboundRecord {
    /// Record on `topic` with `payload` and nothing else set.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self { topic: topic.into(), payload: payload.into(), ..Self::default() }
    }

    /// Set the record key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the subject.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set partition and offset.
    #[must_use]
    pub fn with_position(mut self, partition: impl Into<PartitionId>, offset: impl Into<Offset>) -> Self {
        self.partition = Some(partition.into());
        self.offset = Some(offset.into());
        self
    }

    /// Set the broker timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set the delivery contract.
    #[must_use]
    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }
}

/// Subscription-aware front of a dispatcher.
pub struct Consumer {
    dispatcher: Arc<dyn Dispatcher>,
    subscriptions: SubscriptionManager,
    recovery: Option<Arc<RecoveryManager>>,
    detector: Option<Arc<BacklogDetector>>,
}

impl Consumer {
    /// Consumer over `dispatcher` with no subscriptions.
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher, subscriptions: SubscriptionManager::new(), recovery: None, detector: None }
    }

    /// Track recovery mode with `recovery`.
    #[must_use]
    pub fn with_recovery(mut self, recovery: Arc<RecoveryManager>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Run `detector` alongside the dispatcher. With a recovery manager set, the
    /// detector's snapshots drive the mode.
    #[must_use]
    pub fn with_backlog_detector(mut self, detector: Arc<BacklogDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Start the dispatcher, then the backlog detector if any.
    pub async fn start(&self, ctx: &CancellationToken) -> Result<()> {
        self.dispatcher.start(ctx).await?;

        if let Some(detector) = &self.detector {
            if let Some(recovery) = &self.recovery {
                recovery.attach(detector);
            }
            detector.start(ctx);
        }

        info!(
            strategy = %self.dispatcher.strategy(),
            topics = self.subscriptions.len(),
            "Consumer started"
        );
        Ok(())
    }

    /// Stop the detector, the recovery manager and then the dispatcher.
    pub async fn stop(&self) {
        if let Some(detector) = &self.detector {
            detector.stop().await;
        }
        if let Some(recovery) = &self.recovery {
            recovery.stop();
        }
        self.dispatcher.stop().await;
        info!("Consumer stopped");
    }

    /// Route records on `topic` to `handler`.
    pub fn subscribe(&self, topic: impl Into<String>, handler: SharedHandler) {
        self.subscriptions.subscribe(topic, handler);
    }

    /// Stop routing `topic`. Returns whether it was subscribed.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.subscriptions.unsubscribe(topic).is_some()
    }

    /// Subscription registry.
    #[must_use]
    pub const fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Current recovery mode; [`RecoveryMode::Normal`] without a manager.
    #[must_use]
    pub fn recovery_mode(&self) -> RecoveryMode {
        self.recovery.as_ref().map_or(RecoveryMode::Normal, |r| r.mode())
    }

    /// Dispatcher statistics.
    #[must_use]
    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// Hand one record to the dispatcher.
    ///
    /// Resolves the topic handler, extracts the aggregate ID and dispatches a message
    /// carrying the record's metadata. The returned [`Completion`] resolves once the
    /// handler has run.
    pub async fn deliver(&self, ctx: &CancellationToken, record: InboundRecord) -> Result<Completion> {
        let handler = self
            .subscriptions
            .handler_for(&record.topic)
            .ok_or_else(|| ConsumerError::UnknownTopic { topic: record.topic.clone() })?;

        let aggregate_id =
            match extract_aggregate_id(&record.headers, record.key.as_deref(), record.subject.as_deref()) {
                Ok(id) => id,
                Err(err) => {
                    warn!(topic = %record.topic, offset = ?record.offset, error = %err, "Record has no aggregate ID");
                    return Err(err);
                },
            };

        let InboundRecord { topic, partition, offset, key, headers, payload, timestamp, delivery, .. } = record;
        let metadata = BrokerMetadata { topic: Some(topic), partition, offset, key, headers, timestamp };

        let mut message = AggregateMessage::new(aggregate_id, payload)
            .with_context(ctx.child_token())
            .with_handler(handler)
            .with_delivery(delivery)
            .with_metadata(metadata);
        let completion = message.completion();

        debug!(
            aggregate_id = message.aggregate_id(),
            message_id = %message.id(),
            recovery_mode = %self.recovery_mode(),
            "Delivering record"
        );
        self.dispatcher.dispatch(ctx, message).await?;
        Ok(completion)
    }
}
