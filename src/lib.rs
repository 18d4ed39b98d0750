//! catalog-metrics - per-source runtime metrics in fixed-size round-robin stores
//!
//! Every tracked entity (a data source) gets an exception counter, a query
//! counter and a results-per-query distribution. A background sampler polls
//! each metric and appends its value to a disk-backed round-robin store that
//! never grows, with archives at several resolutions.

// Core modules
pub mod config;
pub mod error;
pub mod logging;

// Feature modules
pub mod lifecycle;
pub mod metrics;
pub mod sampler;
pub mod storage;

// Public API exports
pub use config::Config;
pub use error::{MetricsError, Result};

// Test utilities (only available in test builds)
#[cfg(test)]
pub mod test_utils;

pub use lifecycle::{CreationReport, EntityHandle, EntityLifecycleBridge, PendingCreation, SourceOutcome};
pub use metrics::{
    AttributeSource, Counter, Distribution, LocalAttributes, MetricHandle, MetricKind,
    MetricRegistry, StandardMetric,
};
pub use sampler::{AttributeReader, AttributeRef, AttributeValue, SamplerState, SamplerStats};
pub use storage::{
    ArchiveSpec, ConsolidationFn, DataSourceType, FetchResult, RoundRobinStore, SeriesInfo,
    SeriesKey, SeriesReader, SeriesSpec,
};

use std::sync::Arc;
use tracing::info;

/// Composition root owning the registry and the lifecycle bridge
pub struct MetricsEngine {
    config: Arc<Config>,
    registry: Arc<MetricRegistry>,
    bridge: EntityLifecycleBridge,
}

impl MetricsEngine {
    /// Create an engine that samples its own metric handles
    pub fn new(config: Config) -> Result<Self> {
        Self::with_attribute_source(config, Arc::new(LocalAttributes))
    }

    /// Create an engine whose samplers read attributes through `source`
    pub fn with_attribute_source(config: Config, source: Arc<dyn AttributeSource>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(MetricRegistry::with_attribute_source(&config, source));
        let bridge = EntityLifecycleBridge::new(
            Arc::clone(&registry),
            config.metrics.worker_pool_size,
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            bridge,
        })
    }

    /// Prepare the metrics directory
    pub async fn start(&self) -> Result<()> {
        self.registry.start().await?;
        info!(
            "Metrics engine started (step {}s, sample period {}ms)",
            self.config.metrics.step_secs, self.config.sampler.period_ms
        );
        Ok(())
    }

    /// Stop every sampler and close every store
    pub async fn shutdown(&self) -> Result<()> {
        info!("Metrics engine shutdown requested");
        self.registry.shutdown().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    pub fn bridge(&self) -> &EntityLifecycleBridge {
        &self.bridge
    }
}
