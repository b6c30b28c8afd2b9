//! Consumer configuration.

use seqbus_core::{
    config::{BacklogConfig, ConsumerSettings, RecoveryConfig},
    SeqbusConfig,
};
use std::time::Duration;

/// Settings the consuming side needs, resolved from [`SeqbusConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Consumer group reported in backlog snapshots
    pub consumer_group: String,
    /// Backlog detection thresholds
    pub backlog: BacklogConfig,
    /// Recovery-mode switching
    pub recovery: RecoveryConfig,
}

impl ConsumerConfig {
    /// Config for `consumer_group` with default thresholds.
    pub fn new(consumer_group: impl Into<String>) -> Self {
        Self { consumer_group: consumer_group.into(), ..Self::default() }
    }

    /// Override the backlog check interval.
    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.backlog.check_interval = interval;
        self
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerSettings::default().into()
    }
}

impl From<ConsumerSettings> for ConsumerConfig {
    fn from(settings: ConsumerSettings) -> Self {
        Self {
            consumer_group: settings.consumer_group,
            backlog: settings.backlog,
            recovery: settings.recovery,
        }
    }
}

impl From<&SeqbusConfig> for ConsumerConfig {
    fn from(config: &SeqbusConfig) -> Self {
        config.consumer.clone().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_from_root_config() {
        let mut root = SeqbusConfig::default();
        root.consumer.consumer_group = "billing".into();
        root.consumer.recovery.transition_threshold = 7;

        let config = ConsumerConfig::from(&root);
        assert_eq!(config.consumer_group, "billing");
        assert_eq!(config.recovery.transition_threshold, 7);
        assert_eq!(config.backlog.lag_threshold, 1000);
    }

    #[test]
    fn test_builder_overrides() {
        let config = ConsumerConfig::new("orders").with_check_interval(Duration::from_millis(5));
        assert_eq!(config.consumer_group, "orders");
        assert_eq!(config.backlog.check_interval, Duration::from_millis(5));
    }
}
