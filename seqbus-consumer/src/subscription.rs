//! Subscription management for consumers.

use dashmap::DashMap;
use seqbus_core::SharedHandler;
use tracing::{debug, info};

/// Topic → handler registry.
///
/// Safe to share between the fetch loop and the code that changes subscriptions.
#[derive(Default)]
pub struct SubscriptionManager {
    handlers: DashMap<String, SharedHandler>,
}

impl SubscriptionManager {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route records on `topic` to `handler`. Returns the handler it replaced.
    pub fn subscribe(&self, topic: impl Into<String>, handler: SharedHandler) -> Option<SharedHandler> {
        let topic = topic.into();
        let previous = self.handlers.insert(topic.clone(), handler);
        if previous.is_some() {
            debug!(topic = %topic, "Subscription handler replaced");
        } else {
            info!(topic = %topic, "Subscribed");
        }
        previous
    }

    /// Stop routing `topic`. Returns the removed handler.
    pub fn unsubscribe(&self, topic: &str) -> Option<SharedHandler> {
        let removed = self.handlers.remove(topic).map(|(_, handler)| handler);
        if removed.is_some() {
            info!(topic, "Unsubscribed");
        }
        removed
    }

    /// Handler for `topic`.
    #[must_use]
    pub fn handler_for(&self, topic: &str) -> Option<SharedHandler> {
        self.handlers.get(topic).map(|entry| entry.value().clone())
    }

    /// Whether `topic` has a handler.
    #[must_use]
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    /// Subscribed topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.iter().map(|entry| entry.key().clone()).collect();
        topics.sort();
        topics
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether there are no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
