//! Configuration management for the metrics engine
//!
//! This module handles loading and validating configuration from a TOML file
//! and `CATALOG_METRICS_*` environment variables.

use crate::error::{MetricsError, Result};
use crate::storage::{ArchiveSpec, ConsolidationFn, DataSourceType, SeriesSpec, DEFAULT_XFF};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "CATALOG_METRICS_CONFIG";

/// Configuration file read when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "catalog-metrics.toml";

const ENV_PREFIX: &str = "CATALOG_METRICS_";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub metrics: MetricsConfig,
    pub sampler: SamplerConfig,
    pub logging: LoggingConfig,
}

/// Store layout and registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Flat directory holding one store file per series
    pub base_dir: PathBuf,
    pub step_secs: u64,
    pub xff: f64,
    /// Concurrent metric creations during entity registration
    pub worker_pool_size: usize,
    pub counter_archives: Vec<ArchiveSpec>,
    pub gauge_archives: Vec<ArchiveSpec>,
}

/// Polling cadence of attribute samplers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub period_ms: u64,
    pub min_update_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub probe_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file_path: Option<PathBuf>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("data/metrics"),
            step_secs: 60,
            xff: DEFAULT_XFF,
            worker_pool_size: 8,
            // minutes for a day, quarter hours for a month, hours for a year
            counter_archives: vec![
                ArchiveSpec::new(ConsolidationFn::Total, 1, 1440),
                ArchiveSpec::new(ConsolidationFn::Total, 15, 2880),
                ArchiveSpec::new(ConsolidationFn::Total, 60, 8760),
            ],
            gauge_archives: vec![
                ArchiveSpec::new(ConsolidationFn::Average, 1, 1440),
                ArchiveSpec::new(ConsolidationFn::Min, 1, 1440),
                ArchiveSpec::new(ConsolidationFn::Max, 1, 1440),
                ArchiveSpec::new(ConsolidationFn::Average, 60, 8760),
                ArchiveSpec::new(ConsolidationFn::Min, 60, 8760),
                ArchiveSpec::new(ConsolidationFn::Max, 60, 8760),
            ],
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            period_ms: 60_000,
            min_update_interval_secs: 60,
            probe_timeout_ms: 300_000,
            probe_interval_ms: 1_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file_path: None,
        }
    }
}

impl MetricsConfig {
    /// Series layout for a metric of the given source type and value domain
    pub fn series_spec(&self, ds_type: DataSourceType, min: f64, max: f64) -> SeriesSpec {
        let archives = match ds_type {
            DataSourceType::Counter => self.counter_archives.clone(),
            DataSourceType::Gauge => self.gauge_archives.clone(),
        };
        SeriesSpec::new(self.step_secs, ds_type, archives)
            .with_bounds(min, max)
            .with_xff(self.xff)
    }
}

impl SamplerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

impl Config {
    /// Load configuration from the configured file (if any), apply
    /// environment overrides and validate the result
    pub fn load() -> Result<Self> {
        let mut config = match env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            Err(_) => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file; missing keys keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| MetricsError::ConfigError {
            message: format!("Failed to read config file {}: {}", path.display(), e),
            field: None,
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| MetricsError::ConfigError {
            message: format!("Failed to parse config file {}: {}", path.display(), e),
            field: None,
        })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Override individual settings from `CATALOG_METRICS_*` variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(dir) = env_value("BASE_DIR") {
            self.metrics.base_dir = PathBuf::from(dir);
        }
        if let Some(step) = env_parse("STEP_SECS")? {
            self.metrics.step_secs = step;
        }
        if let Some(xff) = env_parse("XFF")? {
            self.metrics.xff = xff;
        }
        if let Some(size) = env_parse("WORKER_POOL_SIZE")? {
            self.metrics.worker_pool_size = size;
        }
        if let Some(period) = env_parse("SAMPLE_PERIOD_MS")? {
            self.sampler.period_ms = period;
        }
        if let Some(interval) = env_parse("MIN_UPDATE_INTERVAL_SECS")? {
            self.sampler.min_update_interval_secs = interval;
        }
        if let Some(timeout) = env_parse("PROBE_TIMEOUT_MS")? {
            self.sampler.probe_timeout_ms = timeout;
        }
        if let Some(level) = env_value("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = env_value("LOG_FORMAT") {
            self.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                "compact" => LogFormat::Compact,
                other => {
                    return Err(MetricsError::config(
                        format!("Invalid log format: {other}"),
                        "logging.format",
                    ))
                }
            };
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let metrics = &self.metrics;
        if metrics.step_secs == 0 {
            return Err(MetricsError::config("step must be at least 1 second", "metrics.step_secs"));
        }
        if !(0.0..1.0).contains(&metrics.xff) {
            return Err(MetricsError::config("xff must be in [0, 1)", "metrics.xff"));
        }
        if metrics.worker_pool_size == 0 {
            return Err(MetricsError::config(
                "worker pool needs at least one worker",
                "metrics.worker_pool_size",
            ));
        }
        for (field, archives) in [
            ("metrics.counter_archives", &metrics.counter_archives),
            ("metrics.gauge_archives", &metrics.gauge_archives),
        ] {
            if archives.is_empty() {
                return Err(MetricsError::config("at least one archive is required", field));
            }
            if archives.iter().any(|a| a.resolution == 0 || a.rows == 0) {
                return Err(MetricsError::config(
                    "archive resolution and rows must be positive",
                    field,
                ));
            }
        }

        let sampler = &self.sampler;
        if sampler.period_ms == 0 {
            return Err(MetricsError::config("period must be positive", "sampler.period_ms"));
        }
        if sampler.min_update_interval_secs == 0 {
            // store timestamps have one-second resolution
            return Err(MetricsError::config(
                "minimum update interval must be at least 1 second",
                "sampler.min_update_interval_secs",
            ));
        }
        if sampler.probe_interval_ms == 0 {
            return Err(MetricsError::config(
                "probe interval must be positive",
                "sampler.probe_interval_ms",
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(MetricsError::config(
                format!("Invalid log level: {other}"),
                "logging.level",
            )),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_value(name) {
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            MetricsError::config(
                format!("Invalid value for {ENV_PREFIX}{name}: {raw}"),
                name,
            )
        }),
        None => Ok(None),
    }
}
