//! Consumer configuration
//!
//! `OrchestratorConfig` carries everything the engine needs. It is split into
//! the per-component `ReaderConfig`, `StealerConfig` and `ReaperConfig`.

use crate::error::{StreamError, StreamResult};
use core_config::{env_optional, env_parse, env_required, ConfigError};
use std::time::Duration;

/// Default entry field holding the payload
pub const DEFAULT_ENTRY_FIELD_KEY: &str = "msg";

/// Reader settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    pub entry_field_key: String,
    pub read_block_timeout: Duration,
    pub read_batch_size: usize,
}

/// Stealer settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealerConfig {
    pub entry_field_key: String,
    pub steal_interval: Duration,
    pub steal_min_idle_time: Duration,
    /// Deliveries allowed before an entry is dropped as poison
    pub max_delivery_attempt: u64,
}

/// Reaper settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Minimum idle time before a consumer without pending entries is removed
    pub idle_time_threshold: Duration,
}

/// Configuration for the [`Orchestrator`](crate::Orchestrator)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Stream key to consume
    pub stream_key: String,

    /// Consumer group name
    pub group_name: String,

    /// Number of worker tasks
    pub handle_concurrency: usize,

    /// Per-message handler deadline
    pub handle_timeout: Duration,

    /// Server-side block time of each read
    pub read_block_timeout: Duration,

    /// Entries requested per read
    pub read_batch_size: usize,

    /// Period of the stealer
    pub steal_interval: Duration,

    /// Idle time after which a pending entry may be stolen
    pub steal_min_idle_time: Duration,

    /// Deliveries allowed before an entry is dropped
    pub max_delivery_attempt: u64,

    /// Idle time after which an empty consumer is reaped
    pub reap_idle_threshold: Duration,

    /// Entry field holding the payload
    pub entry_field_key: String,
}

impl OrchestratorConfig {
    /// Create a config with explicit stream and group and default tuning.
    pub fn new(stream_key: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            stream_key: stream_key.into(),
            group_name: group_name.into(),
            handle_concurrency: 4,
            handle_timeout: Duration::from_secs(30),
            read_block_timeout: Duration::from_secs(5),
            read_batch_size: 10,
            steal_interval: Duration::from_secs(10),
            steal_min_idle_time: Duration::from_secs(60),
            max_delivery_attempt: 3,
            reap_idle_threshold: Duration::from_secs(3600),
            entry_field_key: DEFAULT_ENTRY_FIELD_KEY.to_string(),
        }
    }

    /// Load from `{PREFIX}_*` environment variables and validate.
    ///
    /// Every setting is required except `{PREFIX}_ENTRY_FIELD_KEY`.
    pub fn from_env_prefixed(prefix: &str) -> StreamResult<Self> {
        let key = |name: &str| format!("{prefix}_{name}");
        let millis = |name: &str| -> Result<Duration, ConfigError> {
            env_parse::<u64>(&key(name)).map(Duration::from_millis)
        };

        let load = || -> Result<Self, ConfigError> {
            Ok(Self {
                stream_key: env_required(&key("STREAM_KEY"))?,
                group_name: env_required(&key("GROUP_NAME"))?,
                handle_concurrency: env_parse(&key("HANDLE_CONCURRENCY"))?,
                handle_timeout: millis("HANDLE_TIMEOUT_MS")?,
                read_block_timeout: millis("READ_BLOCK_TIMEOUT_MS")?,
                read_batch_size: env_parse(&key("READ_BATCH_SIZE"))?,
                steal_interval: millis("STEAL_INTERVAL_MS")?,
                steal_min_idle_time: millis("STEAL_MIN_IDLE_MS")?,
                max_delivery_attempt: env_parse(&key("MAX_DELIVERY_ATTEMPT"))?,
                reap_idle_threshold: millis("REAP_IDLE_MS")?,
                entry_field_key: env_optional(&key("ENTRY_FIELD_KEY"))
                    .unwrap_or_else(|| DEFAULT_ENTRY_FIELD_KEY.to_string()),
            })
        };

        let config = load().map_err(|e| StreamError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject empty names and zero durations/counts.
    pub fn validate(&self) -> StreamResult<()> {
        fn non_empty(name: &str, value: &str) -> StreamResult<()> {
            if value.trim().is_empty() {
                return Err(StreamError::config(format!("{name} must not be empty")));
            }
            Ok(())
        }
        fn positive(name: &str, ok: bool) -> StreamResult<()> {
            if !ok {
                return Err(StreamError::config(format!("{name} must be greater than zero")));
            }
            Ok(())
        }

        non_empty("stream_key", &self.stream_key)?;
        non_empty("group_name", &self.group_name)?;
        non_empty("entry_field_key", &self.entry_field_key)?;
        positive("handle_concurrency", self.handle_concurrency > 0)?;
        positive("handle_timeout", !self.handle_timeout.is_zero())?;
        positive("read_block_timeout", !self.read_block_timeout.is_zero())?;
        positive("read_batch_size", self.read_batch_size > 0)?;
        positive("steal_interval", !self.steal_interval.is_zero())?;
        positive("steal_min_idle_time", !self.steal_min_idle_time.is_zero())?;
        positive("max_delivery_attempt", self.max_delivery_attempt > 0)?;
        positive("reap_idle_threshold", !self.reap_idle_threshold.is_zero())?;
        Ok(())
    }

    pub fn with_handle_concurrency(mut self, count: usize) -> Self {
        self.handle_concurrency = count;
        self
    }

    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    pub fn with_read_block_timeout(mut self, timeout: Duration) -> Self {
        self.read_block_timeout = timeout;
        self
    }

    pub fn with_read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = size;
        self
    }

    pub fn with_steal_interval(mut self, interval: Duration) -> Self {
        self.steal_interval = interval;
        self
    }

    pub fn with_steal_min_idle_time(mut self, idle: Duration) -> Self {
        self.steal_min_idle_time = idle;
        self
    }

    pub fn with_max_delivery_attempt(mut self, attempts: u64) -> Self {
        self.max_delivery_attempt = attempts;
        self
    }

    pub fn with_reap_idle_threshold(mut self, idle: Duration) -> Self {
        self.reap_idle_threshold = idle;
        self
    }

    pub fn with_entry_field_key(mut self, key: impl Into<String>) -> Self {
        self.entry_field_key = key.into();
        self
    }

    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            entry_field_key: self.entry_field_key.clone(),
            read_block_timeout: self.read_block_timeout,
            read_batch_size: self.read_batch_size,
        }
    }

    pub fn stealer_config(&self) -> StealerConfig {
        StealerConfig {
            entry_field_key: self.entry_field_key.clone(),
            steal_interval: self.steal_interval,
            steal_min_idle_time: self.steal_min_idle_time,
            max_delivery_attempt: self.max_delivery_attempt,
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            idle_time_threshold: self.reap_idle_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "IMG_RESULT";

    fn full_env() -> Vec<(String, Option<&'static str>)> {
        [
            ("STREAM_KEY", Some("image:process:result")),
            ("GROUP_NAME", Some("gateway")),
            ("HANDLE_CONCURRENCY", Some("8")),
            ("HANDLE_TIMEOUT_MS", Some("15000")),
            ("READ_BLOCK_TIMEOUT_MS", Some("2000")),
            ("READ_BATCH_SIZE", Some("20")),
            ("STEAL_INTERVAL_MS", Some("5000")),
            ("STEAL_MIN_IDLE_MS", Some("30000")),
            ("MAX_DELIVERY_ATTEMPT", Some("5")),
            ("REAP_IDLE_MS", Some("600000")),
            ("ENTRY_FIELD_KEY", None),
        ]
        .into_iter()
        .map(|(k, v)| (format!("{PREFIX}_{k}"), v))
        .collect()
    }

    fn override_var(
        mut vars: Vec<(String, Option<&'static str>)>,
        name: &str,
        value: Option<&'static str>,
    ) -> Vec<(String, Option<&'static str>)> {
        let key = format!("{PREFIX}_{name}");
        for (k, v) in vars.iter_mut() {
            if *k == key {
                *v = value;
            }
        }
        vars
    }

    #[test]
    fn test_from_env_prefixed() {
        temp_env::with_vars(full_env(), || {
            let config = OrchestratorConfig::from_env_prefixed(PREFIX).unwrap();

            assert_eq!(config.stream_key, "image:process:result");
            assert_eq!(config.group_name, "gateway");
            assert_eq!(config.handle_concurrency, 8);
            assert_eq!(config.handle_timeout, Duration::from_secs(15));
            assert_eq!(config.read_block_timeout, Duration::from_secs(2));
            assert_eq!(config.read_batch_size, 20);
            assert_eq!(config.steal_interval, Duration::from_secs(5));
            assert_eq!(config.steal_min_idle_time, Duration::from_secs(30));
            assert_eq!(config.max_delivery_attempt, 5);
            assert_eq!(config.reap_idle_threshold, Duration::from_secs(600));
            assert_eq!(config.entry_field_key, DEFAULT_ENTRY_FIELD_KEY);
        });
    }

    #[test]
    fn test_from_env_custom_entry_field() {
        let vars = override_var(full_env(), "ENTRY_FIELD_KEY", Some("payload"));
        temp_env::with_vars(vars, || {
            let config = OrchestratorConfig::from_env_prefixed(PREFIX).unwrap();
            assert_eq!(config.entry_field_key, "payload");
        });
    }

    #[test]
    fn test_from_env_missing_required() {
        let vars = override_var(full_env(), "STEAL_INTERVAL_MS", None);
        temp_env::with_vars(vars, || {
            let err = OrchestratorConfig::from_env_prefixed(PREFIX).unwrap_err();
            assert!(matches!(err, StreamError::Config(_)));
            assert!(err.to_string().contains("IMG_RESULT_STEAL_INTERVAL_MS"));
        });
    }

    #[test]
    fn test_from_env_rejects_zero() {
        let vars = override_var(full_env(), "HANDLE_CONCURRENCY", Some("0"));
        temp_env::with_vars(vars, || {
            let err = OrchestratorConfig::from_env_prefixed(PREFIX).unwrap_err();
            assert!(err.to_string().contains("handle_concurrency"));
        });
    }

    #[test]
    fn test_validate() {
        assert!(OrchestratorConfig::new("s", "g").validate().is_ok());
        assert!(OrchestratorConfig::new("", "g").validate().is_err());
        assert!(OrchestratorConfig::new("s", "g")
            .with_entry_field_key("")
            .validate()
            .is_err());
        assert!(OrchestratorConfig::new("s", "g")
            .with_max_delivery_attempt(0)
            .validate()
            .is_err());
        assert!(OrchestratorConfig::new("s", "g")
            .with_steal_min_idle_time(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_component_configs() {
        let config = OrchestratorConfig::new("img:req", "workers")
            .with_read_batch_size(5)
            .with_read_block_timeout(Duration::from_millis(100))
            .with_steal_interval(Duration::from_secs(1))
            .with_steal_min_idle_time(Duration::from_secs(2))
            .with_max_delivery_attempt(7)
            .with_reap_idle_threshold(Duration::from_secs(3))
            .with_entry_field_key("payload");

        let reader = config.reader_config();
        assert_eq!(reader.read_batch_size, 5);
        assert_eq!(reader.read_block_timeout, Duration::from_millis(100));
        assert_eq!(reader.entry_field_key, "payload");

        let stealer = config.stealer_config();
        assert_eq!(stealer.steal_interval, Duration::from_secs(1));
        assert_eq!(stealer.steal_min_idle_time, Duration::from_secs(2));
        assert_eq!(stealer.max_delivery_attempt, 7);

        assert_eq!(
            config.reaper_config().idle_time_threshold,
            Duration::from_secs(3)
        );
    }
}
