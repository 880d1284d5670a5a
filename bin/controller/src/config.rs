//! Controller configuration.
//!
//! Loaded via the `config` crate from environment variables; nested fields
//! use `__` as separator, e.g. `SCAN__WORKERS=8`.

use serde::Deserialize;

/// Controller configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Interval between TTL sweeps of finished jobs, in seconds.
    #[serde(default = "default_ttl_sweep_interval_seconds")]
    pub ttl_sweep_interval_seconds: u64,

    /// Interval between CronJob schedule checks, in seconds.
    #[serde(default = "default_cron_interval_seconds")]
    pub cron_interval_seconds: u64,

    /// Delay before a reconcile asking for a retry runs again, in seconds.
    #[serde(default = "default_requeue_delay_seconds")]
    pub requeue_delay_seconds: u64,

    /// Concurrent handler notifications allowed per target object.
    #[serde(default = "default_max_in_flight_per_target")]
    pub max_in_flight_per_target: usize,

    /// Scan worker pool configuration.
    #[serde(default)]
    pub scan: ScanConfig,
}

/// Sizing of the worker pool running scans.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_scan_workers")]
    pub workers: usize,

    /// Tasks queued before submitters wait.
    #[serde(default = "default_scan_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_ttl_sweep_interval_seconds() -> u64 {
    30
}

fn default_cron_interval_seconds() -> u64 {
    10
}

fn default_requeue_delay_seconds() -> u64 {
    5
}

fn default_max_in_flight_per_target() -> usize {
    1
}

fn default_scan_workers() -> usize {
    4
}

fn default_scan_queue_capacity() -> usize {
    64
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: default_scan_workers(),
            queue_capacity: default_scan_queue_capacity(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ttl_sweep_interval_seconds: default_ttl_sweep_interval_seconds(),
            cron_interval_seconds: default_cron_interval_seconds(),
            requeue_delay_seconds: default_requeue_delay_seconds(),
            max_in_flight_per_target: default_max_in_flight_per_target(),
            scan: ScanConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed into its field.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
