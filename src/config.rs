//! Environment configuration
//!
//! Every setting is read from a `TRACKSTORE_`-prefixed environment variable
//! (`TRACKSTORE_STREAM_NAME`, `TRACKSTORE_BATCH_SIZE`, ...) and falls back to
//! the defaults below.

use crate::client::StartingPosition;
use crate::consumer::{BackoffStrategy, ConsumerConfig};
use crate::error::IngestError;
use crate::health::HealthWindows;
use crate::monitoring::MonitoringConfig;
use crate::retry::RetryConfig;
use crate::store::StoreConfig;
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ENV_PREFIX: &str = "TRACKSTORE";

/// Largest BatchWriteItem request DynamoDB accepts
pub const MAX_BATCH_WRITE_SIZE: usize = 25;

/// Upper bound on location row retention
pub const MAX_LOCATION_TTL_DAYS: u64 = 36_500;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Endpoint override for local emulators
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// LATEST, TRIM_HORIZON (or EARLIEST), AFTER_SEQUENCE_NUMBER
    #[serde(default = "default_shard_iterator_type")]
    pub shard_iterator_type: String,

    #[serde(default)]
    pub starting_sequence_number: Option<String>,

    #[serde(default = "default_batch_size")]
    pub batch_size: i32,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,

    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: f64,

    /// fixed or exponential
    #[serde(default = "default_backoff_strategy")]
    pub backoff_strategy: String,

    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: f64,

    #[serde(default = "default_window_secs")]
    pub startup_grace_secs: u64,

    #[serde(default = "default_window_secs")]
    pub stale_after_secs: u64,

    #[serde(default = "default_idle_wait_secs")]
    pub idle_wait_secs: u64,

    #[serde(default = "default_partition_refresh_secs")]
    pub partition_refresh_secs: u64,

    #[serde(default)]
    pub restart_terminated_cursors: bool,

    #[serde(default = "default_device_table_name")]
    pub device_table_name: String,

    #[serde(default = "default_location_table_name")]
    pub location_table_name: String,

    #[serde(default = "default_batch_write_size")]
    pub batch_write_size: usize,

    #[serde(default = "default_location_ttl_days")]
    pub location_ttl_days: u64,

    #[serde(default = "default_store_max_retries")]
    pub store_max_retries: u32,

    #[serde(default)]
    pub monitoring_enabled: bool,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_stream_name() -> String {
    "transport-gps-stream-dev".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_shard_iterator_type() -> String {
    "LATEST".to_string()
}

fn default_batch_size() -> i32 {
    100
}

fn default_poll_interval_secs() -> f64 {
    1.0
}

fn default_backoff_secs() -> f64 {
    5.0
}

fn default_backoff_strategy() -> String {
    "fixed".to_string()
}

fn default_api_timeout_secs() -> f64 {
    10.0
}

fn default_window_secs() -> u64 {
    300
}

fn default_idle_wait_secs() -> u64 {
    30
}

fn default_partition_refresh_secs() -> u64 {
    60
}

fn default_device_table_name() -> String {
    "transport-devices-dev".to_string()
}

fn default_location_table_name() -> String {
    "transport-locations-dev".to_string()
}

fn default_batch_write_size() -> usize {
    MAX_BATCH_WRITE_SIZE
}

fn default_location_ttl_days() -> u64 {
    30
}

fn default_store_max_retries() -> u32 {
    3
}

fn default_http_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn seconds(name: &str, value: f64) -> Result<Duration, IngestError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| IngestError::Config(format!("{name} must be a non-negative number of seconds, got {value}")))
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, IngestError> {
        Ok(Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?)
    }

    pub fn starting_position(&self) -> Result<StartingPosition, IngestError> {
        match self.shard_iterator_type.to_ascii_uppercase().as_str() {
            "LATEST" => Ok(StartingPosition::Latest),
            "TRIM_HORIZON" | "EARLIEST" => Ok(StartingPosition::TrimHorizon),
            "AFTER_SEQUENCE_NUMBER" => match self.starting_sequence_number.as_deref() {
                Some(seq) if !seq.trim().is_empty() => {
                    Ok(StartingPosition::AfterSequenceNumber(seq.trim().to_string()))
                }
                _ => Err(IngestError::Config(
                    "starting_sequence_number is required for AFTER_SEQUENCE_NUMBER".to_string(),
                )),
            },
            other => Err(IngestError::Config(format!(
                "Unknown shard_iterator_type: {other}"
            ))),
        }
    }

    fn backoff(&self) -> Result<BackoffStrategy, IngestError> {
        match self.backoff_strategy.to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(IngestError::Config(format!("Unknown backoff_strategy: {other}"))),
        }
    }

    pub fn location_ttl(&self) -> Duration {
        Duration::from_secs(self.location_ttl_days.saturating_mul(24 * 60 * 60))
    }

    /// Validate and convert into the runtime consumer settings
    pub fn consumer_config(&self) -> Result<ConsumerConfig, IngestError> {
        if self.stream_name.trim().is_empty() {
            return Err(IngestError::Config("stream_name must not be empty".to_string()));
        }
        if self.batch_size < 1 {
            return Err(IngestError::Config(format!(
                "batch_size must be positive, got {}",
                self.batch_size
            )));
        }
        if !(1..=MAX_BATCH_WRITE_SIZE).contains(&self.batch_write_size) {
            return Err(IngestError::Config(format!(
                "batch_write_size must be between 1 and {MAX_BATCH_WRITE_SIZE}, got {}",
                self.batch_write_size
            )));
        }

        if !(1..=MAX_LOCATION_TTL_DAYS).contains(&self.location_ttl_days) {
            return Err(IngestError::Config(format!(
                "location_ttl_days must be between 1 and {MAX_LOCATION_TTL_DAYS}, got {}",
                self.location_ttl_days
            )));
        }

        let api_timeout = seconds("api_timeout_secs", self.api_timeout_secs)?;
        if api_timeout.is_zero() {
            return Err(IngestError::Config("api_timeout_secs must be positive".to_string()));
        }

        Ok(ConsumerConfig {
            stream_name: self.stream_name.clone(),
            batch_size: self.batch_size,
            poll_interval: seconds("poll_interval_secs", self.poll_interval_secs)?,
            backoff_delay: seconds("backoff_secs", self.backoff_secs)?,
            backoff_strategy: self.backoff()?,
            api_timeout,
            starting_position: self.starting_position()?,
            idle_wait: Duration::from_secs(self.idle_wait_secs),
            partition_refresh: Duration::from_secs(self.partition_refresh_secs),
            restart_terminated: self.restart_terminated_cursors,
            health: HealthWindows {
                startup_grace: Duration::from_secs(self.startup_grace_secs),
                stale_after: Duration::from_secs(self.stale_after_secs),
            },
            store: StoreConfig {
                chunk_size: self.batch_write_size,
                call_timeout: api_timeout,
                retry: RetryConfig {
                    max_attempts: self.store_max_retries.max(1),
                    ..Default::default()
                },
            },
            monitoring: MonitoringConfig {
                enabled: self.monitoring_enabled,
                ..Default::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "TRACKSTORE_STREAM_NAME",
        "TRACKSTORE_BATCH_SIZE",
        "TRACKSTORE_POLL_INTERVAL_SECS",
        "TRACKSTORE_SHARD_ITERATOR_TYPE",
        "TRACKSTORE_STARTING_SEQUENCE_NUMBER",
        "TRACKSTORE_BATCH_WRITE_SIZE",
        "TRACKSTORE_BACKOFF_STRATEGY",
        "TRACKSTORE_RESTART_TERMINATED_CURSORS",
        "TRACKSTORE_ENDPOINT_URL",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear();

        let config = IngestConfig::from_env().unwrap();
        assert_eq!(config.stream_name, "transport-gps-stream-dev");
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.endpoint_url, None);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.batch_write_size, 25);
        assert_eq!(config.location_ttl_days, 30);
        assert_eq!(config.device_table_name, "transport-devices-dev");
        assert_eq!(config.location_table_name, "transport-locations-dev");
        assert_eq!(config.http_port, 8080);

        let consumer = config.consumer_config().unwrap();
        assert_eq!(consumer.starting_position, StartingPosition::Latest);
        assert_eq!(consumer.poll_interval, Duration::from_secs(1));
        assert_eq!(consumer.backoff_delay, Duration::from_secs(5));
        assert_eq!(consumer.backoff_strategy, BackoffStrategy::Fixed);
        assert_eq!(consumer.idle_wait, Duration::from_secs(30));
        assert_eq!(consumer.health, HealthWindows::default());
        assert_eq!(consumer.store.chunk_size, 25);
        assert!(!consumer.restart_terminated);
        assert_eq!(config.location_ttl(), Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear();

        std::env::set_var("TRACKSTORE_STREAM_NAME", "gps-prod");
        std::env::set_var("TRACKSTORE_BATCH_SIZE", "500");
        std::env::set_var("TRACKSTORE_POLL_INTERVAL_SECS", "0.25");
        std::env::set_var("TRACKSTORE_SHARD_ITERATOR_TYPE", "after_sequence_number");
        std::env::set_var("TRACKSTORE_STARTING_SEQUENCE_NUMBER", "4959");
        std::env::set_var("TRACKSTORE_BACKOFF_STRATEGY", "exponential");
        std::env::set_var("TRACKSTORE_RESTART_TERMINATED_CURSORS", "true");
        std::env::set_var("TRACKSTORE_ENDPOINT_URL", "http://localhost:4566");

        let config = IngestConfig::from_env().unwrap();
        clear();

        assert_eq!(config.endpoint_url.as_deref(), Some("http://localhost:4566"));
        let consumer = config.consumer_config().unwrap();
        assert_eq!(consumer.stream_name, "gps-prod");
        assert_eq!(consumer.batch_size, 500);
        assert_eq!(consumer.poll_interval, Duration::from_millis(250));
        assert_eq!(
            consumer.starting_position,
            StartingPosition::AfterSequenceNumber("4959".to_string())
        );
        assert_eq!(consumer.backoff_strategy, BackoffStrategy::Exponential);
        assert!(consumer.restart_terminated);
    }

    #[test]
    fn test_invalid_combinations() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear();
        let base = IngestConfig::from_env().unwrap();

        let config = IngestConfig {
            batch_write_size: 26,
            ..base.clone()
        };
        assert!(matches!(config.consumer_config(), Err(IngestError::Config(_))));

        let config = IngestConfig {
            shard_iterator_type: "AFTER_SEQUENCE_NUMBER".to_string(),
            starting_sequence_number: None,
            ..base.clone()
        };
        assert!(matches!(config.consumer_config(), Err(IngestError::Config(_))));

        let config = IngestConfig {
            shard_iterator_type: "AT_TIMESTAMP".to_string(),
            ..base.clone()
        };
        assert!(config.consumer_config().is_err());

        let config = IngestConfig {
            poll_interval_secs: -1.0,
            ..base.clone()
        };
        assert!(config.consumer_config().is_err());

        let config = IngestConfig {
            location_ttl_days: u64::MAX,
            ..base.clone()
        };
        assert!(matches!(config.consumer_config(), Err(IngestError::Config(_))));
        assert_eq!(config.location_ttl(), Duration::from_secs(u64::MAX));

        let config = IngestConfig {
            location_ttl_days: 0,
            ..base.clone()
        };
        assert!(matches!(config.consumer_config(), Err(IngestError::Config(_))));

        let config = IngestConfig {
            shard_iterator_type: "earliest".to_string(),
            ..base
        };
        assert_eq!(
            config.consumer_config().unwrap().starting_position,
            StartingPosition::TrimHorizon
        );
    }
}
