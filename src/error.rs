//! Error types for the metrics engine
//!
//! This module defines every error raised by the store, the samplers, the
//! registry and the configuration layer, along with helpers used to decide
//! whether an error is local to one sample or must reach the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for metrics engine operations
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Invalid series specification: {message}")]
    InvalidSpec { message: String },

    #[error("Out of order sample for series '{series}': timestamp {timestamp} is not after last update {last_update}")]
    OutOfOrderSample {
        series: String,
        timestamp: u64,
        last_update: u64,
    },

    #[error("Store for series '{series}' is closed")]
    ClosedStore { series: String },

    #[error("Attribute '{attribute}' unavailable: {message}")]
    AttributeUnavailable { attribute: String, message: String },

    #[error("Attribute '{attribute}' has unsupported type {found}")]
    TypeMismatch {
        attribute: String,
        found: &'static str,
    },

    #[error("Corrupt store file {path:?}: {message}")]
    CorruptStore { path: PathBuf, message: String },

    #[error("Unknown metric '{metric}'")]
    UnknownMetric { metric: String },

    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    ConfigError {
        message: String,
        field: Option<String>,
    },

    #[error("Internal error in {}: {message}", component.as_deref().unwrap_or("unknown"))]
    InternalError {
        message: String,
        component: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, MetricsError>;

impl From<std::io::Error> for MetricsError {
    fn from(err: std::io::Error) -> Self {
        MetricsError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl MetricsError {
    /// Errors that only affect a single sample. The sampler logs and
    /// swallows these instead of stopping its timer.
    pub fn is_sample_local(&self) -> bool {
        matches!(
            self,
            MetricsError::OutOfOrderSample { .. }
                | MetricsError::AttributeUnavailable { .. }
                | MetricsError::TypeMismatch { .. }
        )
    }

    /// Check if retrying the operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            MetricsError::AttributeUnavailable { .. }
            | MetricsError::OutOfOrderSample { .. }
            | MetricsError::TypeMismatch { .. }
            | MetricsError::Io { .. } => true,
            MetricsError::InvalidSpec { .. }
            | MetricsError::ClosedStore { .. }
            | MetricsError::CorruptStore { .. }
            | MetricsError::UnknownMetric { .. }
            | MetricsError::ConfigError { .. }
            | MetricsError::InternalError { .. } => false,
        }
    }

    pub(crate) fn invalid_spec(message: impl Into<String>) -> Self {
        MetricsError::InvalidSpec {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>, field: &str) -> Self {
        MetricsError::ConfigError {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }
}
