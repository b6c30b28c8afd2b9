//! Queued unit of work: a message paired with the handler that will run it.

use crate::error::{DispatchError, Result};
use seqbus_core::{AggregateMessage, SharedHandler};
use std::any::Any;

/// A message whose handler was resolved at dispatch time.
pub(crate) struct Job {
    pub(crate) handler: SharedHandler,
    pub(crate) message: AggregateMessage,
}

impl Job {
    /// Validate `message` and pick its handler.
    ///
    /// A message-carried handler wins over `default`. Empty keys and missing
    /// handlers are rejected before anything is queued.
    pub(crate) fn resolve(message: AggregateMessage, default: Option<&SharedHandler>) -> Result<Self> {
        if message.aggregate_id().is_empty() {
            return Err(DispatchError::MissingAggregateId);
        }

        let handler = match message.handler().or(default) {
            Some(handler) => handler.clone(),
            None => {
                return Err(DispatchError::MissingHandler {
                    aggregate_id: message.aggregate_id().to_string(),
                })
            },
        };

        Ok(Self { handler, message })
    }

    /// Run the handler against the message's own context and payload.
    pub(crate) async fn invoke(&self) -> seqbus_core::HandlerResult {
        self.handler
            .handle(self.message.context().clone(), self.message.payload().clone())
            .await
    }
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use seqbus_core::handler_fn;

    fn noop() -> SharedHandler {
        handler_fn(|_ctx, _payload| async { Ok(()) })
    }

    #[test]
    fn test_empty_key_rejected() {
        let msg = AggregateMessage::new("", Bytes::new());
        assert_eq!(Job::resolve(msg, Some(&noop())).err(), Some(DispatchError::MissingAggregateId));
    }

    #[test]
    fn test_missing_handler_rejected() {
        let msg = AggregateMessage::new("order-1", Bytes::new());
        assert!(matches!(
            Job::resolve(msg, None),
            Err(DispatchError::MissingHandler { aggregate_id }) if aggregate_id == "order-1"
        ));
    }

    #[test]
    fn test_message_handler_wins_over_default() {
        let carried = noop();
        let msg = AggregateMessage::new("order-1", Bytes::new()).with_handler(carried.clone());
        let job = Job::resolve(msg, Some(&noop())).unwrap();
        assert!(std::sync::Arc::ptr_eq(&job.handler, &carried));
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic");
    }
}
