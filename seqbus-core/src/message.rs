//! Aggregate message types.
//!
//! [`AggregateMessage`] is the unit of dispatch: an opaque payload tagged with the
//! aggregate key that decides which lane handles it. Each message may carry a
//! completion slot through which the lane reports exactly one terminal outcome.

use crate::{
    error::{ProcessingError, ProcessingResult},
    handler::SharedHandler,
    types::{Offset, PartitionId, Timestamp},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier assigned to every message at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Borrow the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery contract of the upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Failure consumes the message; nothing upstream will redeliver it.
    #[default]
    AtMostOnce,
    /// Failure leaves the record unacknowledged so the broker redelivers it.
    AtLeastOnce,
}

/// Broker-side coordinates of a record. Carried through, never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerMetadata {
    /// Topic or subject the record arrived on
    pub topic: Option<String>,
    /// Partition the record was read from
    pub partition: Option<PartitionId>,
    /// Offset of the record within its partition
    pub offset: Option<Offset>,
    /// Raw record key
    pub key: Option<Bytes>,
    /// Record headers
    pub headers: HashMap<String, String>,
    /// Broker timestamp of the record
    pub timestamp: Option<Timestamp>,
}

/// Receiving half of a message's completion slot.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<ProcessingResult>,
}

impl Completion {
    /// Wait for the terminal outcome.
    ///
    /// Returns `None` when the message was dropped without an outcome, which happens
    /// when a keyed pool is stopped with the message still queued, or when a
    /// processor contains a handler panic.
    pub async fn wait(self) -> Option<ProcessingResult> {
        self.rx.await.ok()
    }

    /// Take the outcome if it has already been delivered.
    pub fn try_take(&mut self) -> Option<ProcessingResult> {
        self.rx.try_recv().ok()
    }
}

/// The unit of dispatch.
pub struct AggregateMessage {
    id: MessageId,
    aggregate_id: String,
    payload: Bytes,
    context: CancellationToken,
    handler: Option<SharedHandler>,
    delivery: DeliveryMode,
    metadata: BrokerMetadata,
    done: Option<oneshot::Sender<ProcessingResult>>,
}

impl AggregateMessage {
    /// Create a message for `aggregate_id` with a fresh, uncancelled context.
    pub fn new(aggregate_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::new(),
            aggregate_id: aggregate_id.into(),
            payload: payload.into(),
            context: CancellationToken::new(),
            handler: None,
            delivery: DeliveryMode::default(),
            metadata: BrokerMetadata::default(),
            done: None,
        }
    }

    /// Use `context` as the token handed to the handler.
    #[must_use]
    pub fn with_context(mut self, context: CancellationToken) -> Self {
        self.context = context;
        self
    }

    /// Carry a handler that overrides the dispatcher's default.
    #[must_use]
    pub fn with_handler(mut self, handler: SharedHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the delivery contract.
    #[must_use]
    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    /// Attach broker metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: BrokerMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach a completion slot and return its receiving half.
    ///
    /// Calling this again replaces the previous slot; the earlier receiver then
    /// resolves to `None`.
    pub fn completion(&mut self) -> Completion {
        let (tx, rx) = oneshot::channel();
        self.done = Some(tx);
        Completion { rx }
    }

    /// Deliver the terminal outcome.
    ///
    /// Never blocks. Returns `true` if a listener received the value; `false` when
    /// there was no slot, the slot was already used, or the listener went away.
    pub fn complete(&mut self, result: ProcessingResult) -> bool {
        match self.done.take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Deliver an engine-side failure.
    pub fn fail(&mut self, err: ProcessingError) -> bool {
        self.complete(Err(err))
    }

    /// Whether the completion slot is still unused.
    #[must_use]
    pub fn has_completion(&self) -> bool {
        self.done.is_some()
    }

    /// Message ID.
    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    /// Routing key.
    #[must_use]
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// Opaque payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Cancellation token handed to the handler.
    #[must_use]
    pub const fn context(&self) -> &CancellationToken {
        &self.context
    }

    /// Message-carried handler, if any.
    #[must_use]
    pub fn handler(&self) -> Option<&SharedHandler> {
        self.handler.as_ref()
    }

    /// Delivery contract.
    #[must_use]
    pub const fn delivery(&self) -> DeliveryMode {
        self.delivery
    }

    /// Broker metadata.
    #[must_use]
    pub const fn metadata(&self) -> &BrokerMetadata {
        &self.metadata
    }
}

impl fmt::Debug for AggregateMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateMessage")
            .field("id", &self.id)
            .field("aggregate_id", &self.aggregate_id)
            .field("payload_len", &self.payload.len())
            .field("has_handler", &self.handler.is_some())
            .field("delivery", &self.delivery)
            .field("metadata", &self.metadata)
            .field("has_completion", &self.done.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completion_delivers_once() {
        let mut msg = AggregateMessage::new("order-1", Bytes::from_static(b"x"));
        let completion = msg.completion();

        assert!(msg.complete(Ok(())));
        assert!(!msg.complete(Err(ProcessingError::ShuttingDown)));
        assert!(!msg.has_completion());

        assert!(matches!(completion.wait().await, Some(Ok(()))));
    }

    #[tokio::test]
    async fn test_dropped_message_resolves_none() {
        let mut msg = AggregateMessage::new("order-1", Bytes::new());
        let completion = msg.completion();
        drop(msg);
        assert!(completion.wait().await.is_none());
    }

    #[test]
    fn test_complete_without_listener_does_not_block() {
        let mut msg = AggregateMessage::new("order-1", Bytes::new());
        assert!(!msg.complete(Ok(())));

        let completion = msg.completion();
        drop(completion);
        assert!(!msg.fail(ProcessingError::ShuttingDown));
    }

    #[test]
    fn test_replacing_completion_orphans_previous_receiver() {
        let mut msg = AggregateMessage::new("order-1", Bytes::new());
        let mut first = msg.completion();
        let mut second = msg.completion();
        assert!(msg.complete(Ok(())));
        assert!(first.try_take().is_none());
        assert!(matches!(second.try_take(), Some(Ok(()))));
    }

    #[test]
    fn test_builder_sets_fields() {
        let metadata = BrokerMetadata {
            topic: Some("orders".into()),
            partition: Some(PartitionId::new(3)),
            offset: Some(Offset::new(99)),
            ..BrokerMetadata::default()
        };
        let msg = AggregateMessage::new("order-7", Bytes::from_static(b"payload"))
            .with_delivery(DeliveryMode::AtLeastOnce)
            .with_metadata(metadata.clone());

        assert_eq!(msg.aggregate_id(), "order-7");
        assert_eq!(msg.payload().as_ref(), b"payload");
        assert_eq!(msg.delivery(), DeliveryMode::AtLeastOnce);
        assert_eq!(msg.metadata(), &metadata);
        assert!(msg.handler().is_none());
        assert!(!msg.context().is_cancelled());
    }
}
