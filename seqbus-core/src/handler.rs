//! Message handler abstraction.
//!
//! A handler is the user code a lane invokes for every message it dequeues. Handlers
//! can be registered per dispatcher (the default handler) or carried on each message,
//! which lets a single pool serve many topics.

use async_trait::async_trait;
use bytes::Bytes;
use std::{fmt, future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Error returned by a handler. Delivered to the caller unchanged.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result returned by a handler.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Reference-counted handler shared between dispatchers and messages.
pub type SharedHandler = Arc<dyn MessageHandler>;

/// User code invoked once per message, sequentially per lane.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one payload.
    ///
    /// `ctx` is the message's own cancellation token; it is independent of the
    /// token passed to `dispatch`.
    async fn handle(&self, ctx: CancellationToken, payload: Bytes) -> HandlerResult;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(CancellationToken, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: CancellationToken, payload: Bytes) -> HandlerResult {
        (self.f)(ctx, payload).await
    }
}

/// Wrap an async closure as a shared handler.
///
/// ```rust
/// use seqbus_core::handler::handler_fn;
///
/// let handler = handler_fn(|_ctx, payload| async move {
///     if payload.is_empty() {
///         return Err("empty payload".into());
///     }
///     Ok(())
/// });
/// # drop(handler);
/// ```
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(CancellationToken, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_fn_forwards_payload_and_errors() {
        let handler = handler_fn(|_ctx, payload: Bytes| async move {
            if payload.as_ref() == b"bad" {
                Err("rejected".into())
            } else {
                Ok(())
            }
        });

        let token = CancellationToken::new();
        assert!(handler.handle(token.clone(), Bytes::from_static(b"ok")).await.is_ok());

        let err = handler.handle(token, Bytes::from_static(b"bad")).await.unwrap_err();
        assert_eq!(err.to_string(), "rejected");
    }
}
