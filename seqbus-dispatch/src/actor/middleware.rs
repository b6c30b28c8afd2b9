//! Per-message receive wrapper.
//!
//! Every message an actor receives goes through [`deliver`]: the handler runs under
//! panic capture, the outcome is written to the message's completion slot, and only
//! then are the processing metrics recorded. A handler panic never escapes this
//! function, so the actor keeps its loop and no caller is left waiting on an
//! unsignalled completion.

use super::metrics::ActorPoolMetricsCollector;
use crate::job::{panic_message, Job};
use futures::FutureExt;
use seqbus_core::{DeliveryMode, ProcessingError};
use std::{panic::AssertUnwindSafe, time::Instant};
use tracing::{debug, error, warn};

/// What happened to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Handler returned `Ok`
    Succeeded,
    /// Handler returned an error
    Failed,
    /// Handler panicked; the panic was converted into an error
    Panicked,
}

/// Run one job on `actor` and report its outcome.
pub(crate) async fn deliver(
    actor: usize,
    mut job: Job,
    metrics: &dyn ActorPoolMetricsCollector,
) -> Delivery {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(job.invoke()).catch_unwind().await;

    let (result, delivery) = match outcome {
        Ok(Ok(())) => (Ok(()), Delivery::Succeeded),
        Ok(Err(err)) => {
            debug!(actor, aggregate_id = job.message.aggregate_id(), error = %err, "Handler returned an error");
            (Err(ProcessingError::Handler(err)), Delivery::Failed)
        },
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            match job.message.delivery() {
                DeliveryMode::AtMostOnce => warn!(
                    actor,
                    aggregate_id = job.message.aggregate_id(),
                    panic = %message,
                    "Handler panicked; message consumed"
                ),
                DeliveryMode::AtLeastOnce => error!(
                    actor,
                    aggregate_id = job.message.aggregate_id(),
                    panic = %message,
                    "Handler panicked; message left for redelivery"
                ),
            }
            (Err(ProcessingError::Panicked { message }), Delivery::Panicked)
        },
    };

    job.message.complete(result);
    if delivery == Delivery::Panicked {
        metrics.record_actor_restarted(actor);
    }
    metrics.record_message_processed(actor, delivery == Delivery::Succeeded, started.elapsed());
    delivery
}
