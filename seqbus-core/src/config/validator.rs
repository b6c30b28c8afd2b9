//! # Configuration Validation
//!
//! Field ranges come from the `validator` derive on the schema; this module adds
//! the cross-field rules and the warnings for values that are legal but unusual.

use crate::{
    config::schema::{
        ActorPoolConfig, BacklogConfig, DispatchConfig, KeyedPoolConfig, ProcessorCacheConfig,
        RateLimitConfig, SeqbusConfig,
    },
    Error, Result,
};
use std::time::Duration;
use tracing::{debug, warn};
use validator::Validate;

const LARGE_LANE_COUNT: usize = 65_536;
const LONG_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate a full configuration
    pub fn validate(config: &SeqbusConfig) -> Result<()> {
        debug!("Starting configuration validation");

        config.validate().map_err(Error::from)?;
        Self::validate_dispatch(&config.dispatch)?;
        Self::validate_backlog(&config.consumer.backlog)?;

        debug!("Configuration validation completed");
        Ok(())
    }

    /// Validate only the dispatch section
    pub fn validate_dispatch(config: &DispatchConfig) -> Result<()> {
        config.validate().map_err(Error::from)?;
        Self::validate_keyed_pool(&config.keyed_pool)?;
        Self::validate_processor_cache(&config.processor_cache)?;
        Self::validate_actor_pool(&config.actor_pool)?;
        Self::validate_rate_limit(&config.rate_limit)?;
        Ok(())
    }

    fn validate_keyed_pool(config: &KeyedPoolConfig) -> Result<()> {
        Self::require_nonzero("keyed_pool.enqueue_timeout", config.enqueue_timeout)?;

        if config.lanes > LARGE_LANE_COUNT {
            warn!(lanes = config.lanes, "Very high lane count; each lane owns a task and a mailbox");
        }
        if config.enqueue_timeout > LONG_ENQUEUE_TIMEOUT {
            warn!(
                timeout_ms = config.enqueue_timeout.as_millis() as u64,
                "Long enqueue timeout delays backpressure signals"
            );
        }
        Ok(())
    }

    fn validate_processor_cache(config: &ProcessorCacheConfig) -> Result<()> {
        Self::require_nonzero("processor_cache.idle_timeout", config.idle_timeout)?;

        if let Some(interval) = config.sweep_interval {
            Self::require_nonzero("processor_cache.sweep_interval", interval)?;
            if interval > config.idle_timeout {
                warn!(
                    sweep_ms = interval.as_millis() as u64,
                    idle_ms = config.idle_timeout.as_millis() as u64,
                    "Sweep interval exceeds idle timeout; idle processors will linger"
                );
            }
        } else if config.idle_timeout < Duration::from_millis(2) {
            return Err(Error::config(
                "processor_cache.idle_timeout must be at least 2ms when sweep_interval is unset",
            ));
        }
        Ok(())
    }

    fn validate_actor_pool(config: &ActorPoolConfig) -> Result<()> {
        Self::require_nonzero("actor_pool.enqueue_timeout", config.enqueue_timeout)?;

        if !config
            .metrics_namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::config(format!(
                "actor_pool.metrics_namespace '{}' may only contain [A-Za-z0-9_]",
                config.metrics_namespace
            )));
        }
        if config.max_restarts == 0 {
            debug!("Actor restarts disabled; the first crash retires a lane");
        }
        Ok(())
    }

    fn validate_rate_limit(config: &RateLimitConfig) -> Result<()> {
        if config.enabled && !config.rate_per_second.is_finite() {
            return Err(Error::config("rate_limit.rate_per_second must be finite"));
        }
        Ok(())
    }

    fn validate_backlog(config: &BacklogConfig) -> Result<()> {
        Self::require_nonzero("backlog.check_interval", config.check_interval)?;
        Self::require_nonzero("backlog.time_threshold", config.time_threshold)?;
        Ok(())
    }

    fn require_nonzero(field: &str, value: Duration) -> Result<()> {
        if value.is_zero() {
            return Err(Error::config(format!("{field} must be greater than 0")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration_is_valid() {
        assert!(ConfigValidator::validate(&SeqbusConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_timeouts_are_rejected() {
        let mut config = SeqbusConfig::default();
        config.dispatch.keyed_pool.enqueue_timeout = Duration::ZERO;
        assert!(ConfigValidator::validate(&config).is_err());

        let mut config = SeqbusConfig::default();
        config.dispatch.processor_cache.sweep_interval = Some(Duration::ZERO);
        assert!(ConfigValidator::validate(&config).is_err());

        let mut config = SeqbusConfig::default();
        config.consumer.backlog.check_interval = Duration::ZERO;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_namespace_characters() {
        let mut config = SeqbusConfig::default();
        config.dispatch.actor_pool.metrics_namespace = "orders-pool".into();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_rate_limit_bounds() {
        let mut config = SeqbusConfig::default();
        config.dispatch.rate_limit.enabled = true;
        config.dispatch.rate_limit.burst = 0;
        assert!(ConfigValidator::validate(&config).is_err());

        config.dispatch.rate_limit.burst = 10;
        config.dispatch.rate_limit.rate_per_second = 0.0;
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
