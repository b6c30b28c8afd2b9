//! Actor pool instrumentation.
//!
//! The pool reports through [`ActorPoolMetricsCollector`]. The Prometheus collector
//! registers its families into a caller-supplied [`Registry`] and removes them again
//! on [`unregister`](ActorPoolMetricsCollector::unregister), so a pool can be torn
//! down and rebuilt against the same registry.

use crate::error::Result;
use parking_lot::Mutex;
use prometheus::{
    core::Collector, exponential_buckets, Encoder, GaugeVec, HistogramOpts, HistogramVec,
    IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tracing::debug;

/// Sink for actor pool events. Every method is called on the hot path.
pub trait ActorPoolMetricsCollector: Send + Sync + 'static {
    /// A message was accepted for `actor`.
    fn record_message_sent(&self, actor: usize);

    /// `actor` finished a message.
    fn record_message_processed(&self, actor: usize, success: bool, duration: Duration);

    /// Inbox occupancy of `actor` after a receive.
    fn record_inbox_depth(&self, actor: usize, depth: i64, capacity: usize);

    /// `actor` recovered from a panic.
    fn record_actor_restarted(&self, actor: usize);

    /// A message for `actor` was discarded without running.
    fn record_dead_letter(&self, actor: usize);

    /// Release whatever the collector registered.
    fn unregister(&self) -> Result<()> {
        Ok(())
    }
}

/// Collector that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopActorPoolMetrics;

impl ActorPoolMetricsCollector for NoopActorPoolMetrics {
    fn record_message_sent(&self, _actor: usize) {}

    fn record_message_processed(&self, _actor: usize, _success: bool, _duration: Duration) {}

    fn record_inbox_depth(&self, _actor: usize, _depth: i64, _capacity: usize) {}

    fn record_actor_restarted(&self, _actor: usize) {}

    fn record_dead_letter(&self, _actor: usize) {}
}

/// Prometheus-backed collector.
pub struct PrometheusActorPoolMetrics {
    registry: Registry,
    messages_sent: IntCounterVec,
    messages_processed: IntCounterVec,
    processing_seconds: HistogramVec,
    inbox_depth: IntGaugeVec,
    inbox_utilization: GaugeVec,
    restarts: IntCounterVec,
    dead_letters: IntCounterVec,
    registered: Mutex<bool>,
}

impl PrometheusActorPoolMetrics {
    /// Create the metric families under `namespace` and register them in `registry`.
    pub fn new(namespace: &str, registry: Registry) -> Result<Self> {
        let messages_sent = IntCounterVec::new(
            Opts::new("messages_sent_total", "Messages accepted by an actor inbox").namespace(namespace),
            &["actor"],
        )?;
        let messages_processed = IntCounterVec::new(
            Opts::new("messages_processed_total", "Messages handled by an actor")
                .namespace(namespace),
            &["actor", "outcome"],
        )?;
        let processing_seconds = HistogramVec::new(
            HistogramOpts::new("processing_duration_seconds", "Handler execution time")
                .namespace(namespace)
                .buckets(exponential_buckets(0.0005, 2.0, 16)?),
            &["actor"],
        )?;
        let inbox_depth = IntGaugeVec::new(
            Opts::new("inbox_depth", "Approximate messages waiting in an actor inbox")
                .namespace(namespace),
            &["actor"],
        )?;
        let inbox_utilization = GaugeVec::new(
            Opts::new("inbox_utilization_ratio", "Inbox depth divided by capacity")
                .namespace(namespace),
            &["actor"],
        )?;
        let restarts = IntCounterVec::new(
            Opts::new("actor_restarts_total", "Actor recoveries after a panic").namespace(namespace),
            &["actor"],
        )?;
        let dead_letters = IntCounterVec::new(
            Opts::new("dead_letters_total", "Messages discarded by a retired actor")
                .namespace(namespace),
            &["actor"],
        )?;

        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(messages_processed.clone()))?;
        registry.register(Box::new(processing_seconds.clone()))?;
        registry.register(Box::new(inbox_depth.clone()))?;
        registry.register(Box::new(inbox_utilization.clone()))?;
        registry.register(Box::new(restarts.clone()))?;
        registry.register(Box::new(dead_letters.clone()))?;

        debug!(namespace, "Actor pool metrics registered");
        Ok(Self {
            registry,
            messages_sent,
            messages_processed,
            processing_seconds,
            inbox_depth,
            inbox_utilization,
            restarts,
            dead_letters,
            registered: Mutex::new(true),
        })
    }

    /// Registry the families live in.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    fn collectors(&self) -> [Box<dyn Collector>; 7] {
        [
            Box::new(self.messages_sent.clone()),
            Box::new(self.messages_processed.clone()),
            Box::new(self.processing_seconds.clone()),
            Box::new(self.inbox_depth.clone()),
            Box::new(self.inbox_utilization.clone()),
            Box::new(self.restarts.clone()),
            Box::new(self.dead_letters.clone()),
        ]
    }
}

impl ActorPoolMetricsCollector for PrometheusActorPoolMetrics {
    fn record_message_sent(&self, actor: usize) {
        self.messages_sent.with_label_values(&[&actor.to_string()]).inc();
    }

    fn record_message_processed(&self, actor: usize, success: bool, duration: Duration) {
        let actor = actor.to_string();
        let outcome = if success { "success" } else { "failure" };
        self.messages_processed.with_label_values(&[&actor, outcome]).inc();
        self.processing_seconds.with_label_values(&[&actor]).observe(duration.as_secs_f64());
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_inbox_depth(&self, actor: usize, depth: i64, capacity: usize) {
        let actor = actor.to_string();
        let depth = depth.max(0);
        self.inbox_depth.with_label_values(&[&actor]).set(depth);
        if capacity > 0 {
            self.inbox_utilization
                .with_label_values(&[&actor])
                .set(depth as f64 / capacity as f64);
        }
    }

    fn record_actor_restarted(&self, actor: usize) {
        self.restarts.with_label_values(&[&actor.to_string()]).inc();
    }

    fn record_dead_letter(&self, actor: usize) {
        self.dead_letters.with_label_values(&[&actor.to_string()]).inc();
    }

    fn unregister(&self) -> Result<()> {
        let mut registered = self.registered.lock();
        if !*registered {
            return Ok(());
        }
        for collector in self.collectors() {
            self.registry.unregister(collector)?;
        }
        *registered = false;
        debug!("Actor pool metrics unregistered");
        Ok(())
    }
}
