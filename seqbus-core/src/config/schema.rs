//! Configuration schema definitions for seqbus.
//!
//! Every structure derives serde for loading and `validator` for field ranges.
//! Durations are written as integer milliseconds. All fields have defaults, so an
//! empty file yields a working configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Root configuration object.
///
/// Loaded in layers: defaults → file → environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SeqbusConfig {
    /// Dispatch engine configuration
    #[validate(nested)]
    pub dispatch: DispatchConfig,

    /// Consuming side: backlog detection and recovery mode
    #[validate(nested)]
    pub consumer: ConsumerSettings,

    /// Logging output
    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// Which dispatch strategy a service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// Fixed hash-routed lanes. Constant memory, sized upfront.
    #[default]
    KeyedPool,
    /// One processor per aggregate in a bounded LRU cache.
    ProcessorCache,
    /// Fixed supervised actors with panic containment.
    ActorPool,
}

impl std::fmt::Display for DispatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::KeyedPool => "keyed_pool",
            Self::ProcessorCache => "processor_cache",
            Self::ActorPool => "actor_pool",
        };
        f.write_str(name)
    }
}

/// Dispatch engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DispatchConfig {
    /// Strategy selected at construction time
    pub strategy: DispatchStrategy,

    /// Fixed lane pool settings
    #[validate(nested)]
    pub keyed_pool: KeyedPoolConfig,

    /// Per-aggregate processor cache settings
    #[validate(nested)]
    pub processor_cache: ProcessorCacheConfig,

    /// Supervised actor pool settings
    #[validate(nested)]
    pub actor_pool: ActorPoolConfig,

    /// Optional per-lane rate limit (processor cache only)
    #[validate(nested)]
    pub rate_limit: RateLimitConfig,
}

/// Fixed hash-routed lane pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct KeyedPoolConfig {
    /// Number of lanes
    #[validate(range(min = 1, max = 1_048_576))]
    pub lanes: usize,

    /// Bounded mailbox capacity per lane
    #[validate(range(min = 1))]
    pub queue_capacity: usize,

    /// Longest time `dispatch` waits for mailbox room before reporting a full queue
    #[serde(with = "duration_ms")]
    pub enqueue_timeout: Duration,
}

impl Default for KeyedPoolConfig {
    fn default() -> Self {
        Self { lanes: 1024, queue_capacity: 1000, enqueue_timeout: Duration::from_millis(200) }
    }
}

/// LRU cache of per-aggregate processors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProcessorCacheConfig {
    /// Maximum resident processors
    #[validate(range(min = 1))]
    pub capacity: usize,

    /// Mailbox capacity of each processor
    #[validate(range(min = 1))]
    pub mailbox_capacity: usize,

    /// A processor idle longer than this is stopped and removed
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Sweep period; half the idle timeout when unset
    #[serde(default, with = "option_duration_ms", skip_serializing_if = "Option::is_none")]
    pub sweep_interval: Option<Duration>,
}

impl ProcessorCacheConfig {
    /// Sweep period actually used.
    #[must_use]
    pub fn effective_sweep_interval(&self) -> Duration {
        self.sweep_interval.unwrap_or(self.idle_timeout / 2)
    }
}

impl Default for ProcessorCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            mailbox_capacity: 100,
            idle_timeout: Duration::from_secs(5 * 60),
            sweep_interval: None,
        }
    }
}

/// Supervised actor pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ActorPoolConfig {
    /// Number of actors
    #[validate(range(min = 1, max = 1_048_576))]
    pub pool_size: usize,

    /// Bounded inbox capacity per actor
    #[validate(range(min = 1))]
    pub inbox_capacity: usize,

    /// Restarts allowed per actor before it is retired
    pub max_restarts: u32,

    /// Longest time `dispatch` waits for inbox room
    #[serde(with = "duration_ms")]
    pub enqueue_timeout: Duration,

    /// Prefix for exported metric names
    #[validate(length(min = 1, max = 64))]
    pub metrics_namespace: String,
}

impl Default for ActorPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 256,
            inbox_capacity: 1000,
            max_restarts: 3,
            enqueue_timeout: Duration::from_millis(200),
            metrics_namespace: "seqbus_actor_pool".to_string(),
        }
    }
}

/// Token-bucket rate limit applied inside each processor lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether lanes are gated at all
    pub enabled: bool,

    /// Sustained admissions per second
    #[validate(range(min = 0.001))]
    pub rate_per_second: f64,

    /// Tokens that may accumulate for bursts
    #[validate(range(min = 1))]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { enabled: false, rate_per_second: 1000.0, burst: 1000 }
    }
}

/// Consumer-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Consumer group reported in backlog snapshots
    #[validate(length(min = 1))]
    pub consumer_group: String,

    /// Backlog detection
    #[validate(nested)]
    pub backlog: BacklogConfig,

    /// Recovery-mode management
    #[validate(nested)]
    pub recovery: RecoveryConfig,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            consumer_group: "seqbus".to_string(),
            backlog: BacklogConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

/// Backlog detection thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BacklogConfig {
    /// A partition lagging by more than this many records counts as backlog
    #[validate(range(min = 1))]
    pub lag_threshold: i64,

    /// Pending records older than this count as backlog
    #[serde(with = "duration_ms")]
    pub time_threshold: Duration,

    /// How often the detector polls its lag source
    #[serde(with = "duration_ms")]
    pub check_interval: Duration,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            lag_threshold: 1000,
            time_threshold: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(30),
        }
    }
}

/// Recovery-mode switching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Whether recovery mode is managed at all
    pub enabled: bool,

    /// Whether backlog signals switch the mode automatically
    pub auto_detection: bool,

    /// Lag count that must be exceeded to enter active mode
    pub transition_threshold: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { enabled: true, auto_detection: true, transition_threshold: 3 }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[validate(length(min = 1))]
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Include the event target in each line
    pub with_target: bool,

    /// Include thread IDs in each line
    pub with_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            with_target: true,
            with_thread_ids: false,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SeqbusConfig::default();
        assert_eq!(config.dispatch.strategy, DispatchStrategy::KeyedPool);
        assert_eq!(config.dispatch.keyed_pool.lanes, 1024);
        assert_eq!(config.dispatch.keyed_pool.queue_capacity, 1000);
        assert_eq!(config.dispatch.keyed_pool.enqueue_timeout, Duration::from_millis(200));
        assert_eq!(config.dispatch.actor_pool.pool_size, 256);
        assert_eq!(config.dispatch.actor_pool.max_restarts, 3);
        assert_eq!(config.dispatch.processor_cache.mailbox_capacity, 100);
        assert_eq!(config.consumer.backlog.lag_threshold, 1000);
        assert_eq!(config.consumer.recovery.transition_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sweep_interval_defaults_to_half_idle_timeout() {
        let mut cache = ProcessorCacheConfig {
            idle_timeout: Duration::from_secs(10),
            ..ProcessorCacheConfig::default()
        };
        assert_eq!(cache.effective_sweep_interval(), Duration::from_secs(5));

        cache.sweep_interval = Some(Duration::from_secs(1));
        assert_eq!(cache.effective_sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_toml_round_trip_uses_milliseconds() {
        let config = SeqbusConfig::default();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("enqueue_timeout = 200"));
        assert!(!text.contains("sweep_interval"));

        let parsed: SeqbusConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let parsed: SeqbusConfig = toml::from_str(
            r#"
            [dispatch]
            strategy = "processor_cache"

            [dispatch.processor_cache]
            capacity = 16
            sweep_interval = 250
            "#,
        )
        .unwrap();

        assert_eq!(parsed.dispatch.strategy, DispatchStrategy::ProcessorCache);
        assert_eq!(parsed.dispatch.processor_cache.capacity, 16);
        assert_eq!(parsed.dispatch.processor_cache.mailbox_capacity, 100);
        assert_eq!(
            parsed.dispatch.processor_cache.effective_sweep_interval(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_field_ranges_are_enforced() {
        let mut config = SeqbusConfig::default();
        config.dispatch.keyed_pool.lanes = 0;
        assert!(config.validate().is_err());
    }
}
