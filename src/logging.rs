//! Structured logging setup
//!
//! Installs a global tracing subscriber whose format and destination come
//! from [`LoggingConfig`]. `RUST_LOG` directives still apply on top of the
//! configured level.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{MetricsError, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::ChronoUtc, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Logging system manager
#[derive(Debug)]
pub struct LoggingSystem {
    config: LoggingConfig,
}

impl LoggingSystem {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    /// Install the tracing subscriber. A subscriber that is already set is
    /// left in place with a warning.
    pub async fn initialize(&self) -> Result<()> {
        let log_level = parse_log_level(&self.config.level)?;

        let env_filter = EnvFilter::builder()
            .with_default_directive(log_level.into())
            .from_env_lossy();

        let (writer, to_file) = match &self.config.file_path {
            Some(path) => (self.file_writer(path).await?, true),
            None => (BoxMakeWriter::new(std::io::stdout), false),
        };

        let registry = Registry::default().with(env_filter);
        let installed = match self.config.format {
            LogFormat::Json => registry
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_current_span(false)
                        .with_span_list(true)
                        .with_timer(ChronoUtc::rfc_3339())
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .try_init(),
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_writer(writer)
                        .with_ansi(!to_file)
                        .with_timer(ChronoUtc::rfc_3339())
                        .with_target(true)
                        .with_file(to_file)
                        .with_line_number(to_file)
                        .with_span_events(FmtSpan::CLOSE),
                )
                .try_init(),
            LogFormat::Compact => registry
                .with(
                    fmt::layer()
                        .compact()
                        .with_writer(writer)
                        .with_ansi(!to_file)
                        .with_timer(ChronoUtc::rfc_3339())
                        .with_target(to_file),
                )
                .try_init(),
        };

        if let Err(e) = installed {
            warn!(
                "Failed to initialize tracing subscriber (may already be set): {}",
                e
            );
        }

        info!(
            "Logging initialized at level {} ({:?})",
            self.config.level, self.config.format
        );
        Ok(())
    }

    async fn file_writer(&self, file_path: &Path) -> Result<BoxMakeWriter> {
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MetricsError::InternalError {
                    message: format!("Failed to create log directory: {}", e),
                    component: Some("logging".to_string()),
                    source: Some(Box::new(e)),
                })?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)
            .map_err(|e| MetricsError::InternalError {
                message: format!("Failed to open log file: {}", e),
                component: Some("logging".to_string()),
                source: Some(Box::new(e)),
            })?;

        Ok(BoxMakeWriter::new(Arc::new(file)))
    }
}

/// Parse a level name, case-insensitively
pub fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(MetricsError::config(
            format!("Invalid log level: {}", level),
            "logging.level",
        )),
    }
}
