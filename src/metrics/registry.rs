//! Registry of live per-entity metrics
//!
//! The registry is the only owner of samplers. Each `(entity, metric)` key
//! maps to at most one entry, and therefore at most one writer per store
//! file. Mutations are serialized by a registry-wide lock; lookups are
//! lock-free.

use crate::config::{Config, MetricsConfig, SamplerConfig};
use crate::error::{MetricsError, Result};
use crate::metrics::{MetricHandle, MetricKind, StandardMetric};
use crate::sampler::{
    AttributeRef, AttributeSampler, FailureCallback, ResourceSnapshot, ResourceTracker,
    SamplerState, SamplerStats,
};
use crate::storage::{SeriesKey, SharedStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Chooses what a new series samples
pub trait AttributeSource: Send + Sync {
    fn attribute_for(&self, key: &SeriesKey, handle: &MetricHandle) -> AttributeRef;
}

/// Samples the metric handle itself
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalAttributes;

impl AttributeSource for LocalAttributes {
    fn attribute_for(&self, _key: &SeriesKey, handle: &MetricHandle) -> AttributeRef {
        AttributeRef::new(Arc::new(handle.clone()), handle.kind().sampled_attribute())
    }
}

#[derive(Debug, Clone, Copy)]
struct MetricDefinition {
    kind: MetricKind,
    min: f64,
    max: f64,
}

/// Bookkeeping row for one live series
#[derive(Debug)]
pub struct RegistryEntry {
    pub key: SeriesKey,
    pub kind: MetricKind,
    pub handle: MetricHandle,
    pub min: f64,
    pub max: f64,
    pub created_at: DateTime<Utc>,
    sampler: AttributeSampler,
}

impl RegistryEntry {
    pub fn sampler_state(&self) -> SamplerState {
        self.sampler.state()
    }

    pub fn sampler_stats(&self) -> SamplerStats {
        self.sampler.stats()
    }

    /// The store, once sampling has started
    pub fn store(&self) -> Option<SharedStore> {
        self.sampler.store()
    }

    pub fn sampler(&self) -> &AttributeSampler {
        &self.sampler
    }
}

/// Maps `(entity, metric)` to live metric and sampler state
pub struct MetricRegistry {
    metrics: MetricsConfig,
    sampler: SamplerConfig,
    entries: DashMap<SeriesKey, Arc<RegistryEntry>>,
    files: DashMap<String, SeriesKey>,
    definitions: DashMap<String, MetricDefinition>,
    source: Arc<dyn AttributeSource>,
    tracker: Arc<ResourceTracker>,
    on_failure: Option<FailureCallback>,
    lock: Mutex<()>,
}

impl MetricRegistry {
    pub fn new(config: &Config) -> Self {
        Self::with_attribute_source(config, Arc::new(LocalAttributes))
    }

    pub fn with_attribute_source(config: &Config, source: Arc<dyn AttributeSource>) -> Self {
        let definitions = DashMap::new();
        for metric in StandardMetric::ALL {
            let (min, max) = metric.bounds();
            definitions.insert(
                metric.name().to_string(),
                MetricDefinition {
                    kind: metric.kind(),
                    min,
                    max,
                },
            );
        }

        Self {
            metrics: config.metrics.clone(),
            sampler: config.sampler.clone(),
            entries: DashMap::new(),
            files: DashMap::new(),
            definitions,
            source,
            tracker: ResourceTracker::new(),
            on_failure: None,
            lock: Mutex::new(()),
        }
    }

    /// Called by every sampler that fails to activate
    pub fn with_failure_callback(mut self, callback: FailureCallback) -> Self {
        self.on_failure = Some(callback);
        self
    }

    /// Create the metrics directory
    pub async fn start(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.metrics.base_dir).await?;
        info!(
            "Metric registry started, storing series under {:?}",
            self.metrics.base_dir
        );
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.metrics.base_dir
    }

    /// Make `metric` available to lazy creation through [`update`](Self::update)
    pub fn define_metric(&self, metric: impl Into<String>, kind: MetricKind, min: f64, max: f64) {
        self.definitions
            .insert(metric.into(), MetricDefinition { kind, min, max });
    }

    /// Return the metric for the key, creating it and its sampler if absent
    pub async fn ensure_metric(
        &self,
        entity_id: &str,
        metric: &str,
        kind: MetricKind,
        min: f64,
        max: f64,
    ) -> Result<MetricHandle> {
        let key = SeriesKey::new(entity_id, metric);
        if let Some(handle) = self.existing(&key, kind) {
            return Ok(handle);
        }

        let _guard = self.lock.lock().await;
        self.ensure_locked(key, MetricDefinition { kind, min, max })
            .await
    }

    /// Apply `delta` to a metric, creating it first if needed
    pub async fn update(&self, entity_id: &str, metric: &str, delta: i64) -> Result<()> {
        let key = SeriesKey::new(entity_id, metric);
        let handle = match self.entries.get(&key).map(|entry| entry.handle.clone()) {
            Some(handle) => handle,
            None => {
                let definition = self.definition(metric)?;
                debug!("Lazily creating {} on first update", key);
                self.ensure_metric(entity_id, metric, definition.kind, definition.min, definition.max)
                    .await?
            }
        };
        handle.apply(delta);
        Ok(())
    }

    /// Retire the series of `old_id` and start a fresh one for `new_id`.
    /// The old store stays on disk untouched.
    pub async fn rename(&self, metric: &str, old_id: &str, new_id: &str) -> Result<MetricHandle> {
        let _guard = self.lock.lock().await;
        let old_key = SeriesKey::new(old_id, metric);

        let definition = match self.entries.get(&old_key).map(|e| Arc::clone(e.value())) {
            Some(entry) => MetricDefinition {
                kind: entry.kind,
                min: entry.min,
                max: entry.max,
            },
            None => self.definition(metric)?,
        };

        if old_id != new_id {
            self.delete_locked(&old_key).await?;
        }
        let handle = self
            .ensure_locked(SeriesKey::new(new_id, metric), definition)
            .await?;
        info!("Renamed series {} to {}.{}", old_key, new_id, metric);
        Ok(handle)
    }

    /// Rename every series of an entity
    pub async fn rename_entity(&self, old_id: &str, new_id: &str) -> Result<usize> {
        let metrics: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().entity_id == old_id)
            .map(|entry| entry.key().metric.clone())
            .collect();
        for metric in &metrics {
            self.rename(metric, old_id, new_id).await?;
        }
        Ok(metrics.len())
    }

    /// Stop the sampler, close the store, drop the entry. Returns whether an
    /// entry existed.
    pub async fn delete(&self, entity_id: &str, metric: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        self.delete_locked(&SeriesKey::new(entity_id, metric)).await
    }

    /// Delete every series of an entity
    pub async fn delete_entity(&self, entity_id: &str) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let keys: Vec<SeriesKey> = self
            .entries
            .iter()
            .filter(|entry| entry.key().entity_id == entity_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut deleted = 0;
        for key in &keys {
            if self.delete_locked(key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Stop every sampler and close every store
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let keys: Vec<SeriesKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        info!("Shutting down metric registry ({} series)", keys.len());

        let mut first_error = None;
        for key in &keys {
            if let Err(e) = self.delete_locked(key).await {
                warn!("Failed to shut down series {}: {}", key, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn get(&self, entity_id: &str, metric: &str) -> Option<MetricHandle> {
        self.entries
            .get(&SeriesKey::new(entity_id, metric))
            .map(|entry| entry.handle.clone())
    }

    pub fn entry(&self, entity_id: &str, metric: &str) -> Option<Arc<RegistryEntry>> {
        self.entries
            .get(&SeriesKey::new(entity_id, metric))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn sampler_state(&self, entity_id: &str, metric: &str) -> Option<SamplerState> {
        self.entry(entity_id, metric).map(|e| e.sampler_state())
    }

    pub fn keys(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sampler tasks still running, including stopped-but-unjoined ones
    pub fn live_samplers(&self) -> usize {
        self.tracker.live_tasks()
    }

    pub fn open_stores(&self) -> usize {
        self.tracker.open_stores()
    }

    pub fn resources(&self) -> ResourceSnapshot {
        self.tracker.snapshot()
    }

    fn existing(&self, key: &SeriesKey, kind: MetricKind) -> Option<MetricHandle> {
        let entry = self.entries.get(key)?;
        if entry.kind != kind {
            warn!(
                "Series {} exists as {:?}, ignoring request for {:?}",
                key, entry.kind, kind
            );
        }
        Some(entry.handle.clone())
    }

    fn definition(&self, metric: &str) -> Result<MetricDefinition> {
        self.definitions
            .get(metric)
            .map(|d| *d)
            .ok_or_else(|| MetricsError::UnknownMetric {
                metric: metric.to_string(),
            })
    }

    /// Caller holds `self.lock`
    async fn ensure_locked(&self, key: SeriesKey, definition: MetricDefinition) -> Result<MetricHandle> {
        if let Some(handle) = self.existing(&key, definition.kind) {
            return Ok(handle);
        }

        let file_name = key.file_name();
        if let Some(owner) = self.files.get(&file_name) {
            return Err(MetricsError::InvalidSpec {
                message: format!(
                    "series {} would share store file {} with {}",
                    key,
                    file_name,
                    owner.value()
                ),
            });
        }

        let spec = self
            .metrics
            .series_spec(definition.kind.ds_type(), definition.min, definition.max);
        spec.validate()?;
        tokio::fs::create_dir_all(&self.metrics.base_dir).await?;

        let handle = MetricHandle::new(definition.kind);
        let attribute = self.source.attribute_for(&key, &handle);
        let mut sampler = AttributeSampler::new(
            key.clone(),
            attribute,
            self.metrics.base_dir.clone(),
            spec,
            self.sampler.clone(),
            Arc::clone(&self.tracker),
        );
        if let Some(callback) = &self.on_failure {
            sampler = sampler.with_failure_callback(Arc::clone(callback));
        }
        sampler.start()?;

        let entry = Arc::new(RegistryEntry {
            key: key.clone(),
            kind: definition.kind,
            handle: handle.clone(),
            min: definition.min,
            max: definition.max,
            created_at: Utc::now(),
            sampler,
        });
        self.files.insert(file_name, key.clone());
        self.entries.insert(key.clone(), entry);
        info!("Created {:?} metric {}", definition.kind, key);
        Ok(handle)
    }

    /// Caller holds `self.lock`
    async fn delete_locked(&self, key: &SeriesKey) -> Result<bool> {
        let Some(entry) = self.entries.get(key).map(|e| Arc::clone(e.value())) else {
            return Ok(false);
        };

        entry.sampler.stop().await;
        let closed = entry.sampler.close_store().await;

        self.entries.remove(key);
        self.files.remove(&key.file_name());
        debug!("Deleted series {}", key);
        closed.map(|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SeriesReader;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.metrics.base_dir = dir.path().join("metrics");
        config.sampler = SamplerConfig {
            period_ms: 20,
            min_update_interval_secs: 1,
            probe_timeout_ms: 500,
            probe_interval_ms: 10,
        };
        config
    }

    async fn wait_active(registry: &MetricRegistry, entity: &str, metric: &str) {
        let entry = registry.entry(entity, metric).unwrap();
        let mut rx = entry.sampler().subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == SamplerState::Active))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_ensure_metric_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = MetricRegistry::new(&test_config(&dir));

        let first = registry
            .ensure_metric("src1", "Queries", MetricKind::Counter, 0.0, f64::NAN)
            .await
            .unwrap();
        let second = registry
            .ensure_metric("src1", "Queries", MetricKind::Counter, 0.0, f64::NAN)
            .await
            .unwrap();

        assert!(first.same_metric(&second));
        assert_eq!(registry.len(), 1);
        wait_active(&registry, "src1", "Queries").await;
        assert_eq!(registry.live_samplers(), 1);
        assert_eq!(registry.open_stores(), 1);

        let files: Vec<_> = std::fs::read_dir(registry.base_dir()).unwrap().collect();
        assert_eq!(files.len(), 1);

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_lazily_creates_standard_metrics() {
        let dir = TempDir::new().unwrap();
        let registry = MetricRegistry::new(&test_config(&dir));

        registry.update("src1", "Exceptions", 1).await.unwrap();
        registry.update("src1", "Exceptions", 1).await.unwrap();
        registry.update("src1", "Queries.TotalResults", 40).await.unwrap();

        let exceptions = registry.get("src1", "Exceptions").unwrap();
        assert_eq!(exceptions.as_counter().unwrap().get(), 2);
        let results = registry.get("src1", "Queries.TotalResults").unwrap();
        assert_eq!(results.as_distribution().unwrap().mean(), 40.0);

        let err = registry.update("src1", "Latency", 1).await.unwrap_err();
        assert!(matches!(err, MetricsError::UnknownMetric { .. }));
        assert!(registry.get("src1", "Latency").is_none());

        registry.define_metric("Latency", MetricKind::Distribution, 0.0, f64::NAN);
        registry.update("src1", "Latency", 12).await.unwrap();
        assert_eq!(registry.len(), 3);

        registry.shutdown().await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_rename_retires_old_series() {
        let dir = TempDir::new().unwrap();
        let registry = MetricRegistry::new(&test_config(&dir));

        registry
            .ensure_metric("a", "Queries", MetricKind::Counter, 0.0, f64::NAN)
            .await
            .unwrap();
        wait_active(&registry, "a", "Queries").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let renamed = registry.rename("Queries", "a", "b").await.unwrap();
        assert!(registry.get("a", "Queries").is_none());
        assert!(registry.get("b", "Queries").unwrap().same_metric(&renamed));

        let old_path = SeriesKey::new("a", "Queries").path_in(registry.base_dir());
        let old_bytes = std::fs::read(&old_path).unwrap();
        let old = SeriesReader::open(&old_path).await.unwrap();
        assert!(old.last_update().is_some());

        wait_active(&registry, "b", "Queries").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(SeriesKey::new("b", "Queries").path_in(registry.base_dir()).exists());
        assert_eq!(std::fs::read(&old_path).unwrap(), old_bytes);

        registry.shutdown().await.unwrap();
        assert_eq!(registry.resources(), ResourceSnapshot { live_tasks: 0, open_stores: 0 });
    }

    #[tokio::test]
    async fn test_rename_entity_moves_every_series() {
        let dir = TempDir::new().unwrap();
        let registry = MetricRegistry::new(&test_config(&dir));
        registry.define_metric("Latency", MetricKind::Distribution, 0.0, f64::NAN);

        registry.update("a", "Queries", 2).await.unwrap();
        registry.update("a", "Latency", 7).await.unwrap();
        registry.update("other", "Queries", 1).await.unwrap();

        assert_eq!(registry.rename_entity("a", "b").await.unwrap(), 2);
        assert!(registry.get("a", "Queries").is_none());
        assert!(registry.get("a", "Latency").is_none());
        assert_eq!(registry.entry("b", "Latency").unwrap().kind, MetricKind::Distribution);
        assert_eq!(registry.get("b", "Queries").unwrap().as_counter().unwrap().get(), 0);
        assert!(registry.get("other", "Queries").is_some());
        assert_eq!(registry.len(), 3);

        assert_eq!(registry.rename_entity("ghost", "c").await.unwrap(), 0);
        assert_eq!(registry.len(), 3);

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_is_noop_when_absent() {
        let dir = TempDir::new().unwrap();
        let registry = MetricRegistry::new(&test_config(&dir));

        assert!(!registry.delete("ghost", "Queries").await.unwrap());

        registry
            .ensure_metric("src1", "Queries", MetricKind::Counter, 0.0, f64::NAN)
            .await
            .unwrap();
        assert!(registry.delete("src1", "Queries").await.unwrap());
        assert!(!registry.delete("src1", "Queries").await.unwrap());
        assert_eq!(registry.live_samplers(), 0);
    }

    #[tokio::test]
    async fn test_colliding_file_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = MetricRegistry::new(&test_config(&dir));

        registry
            .ensure_metric("src-1", "Queries", MetricKind::Counter, 0.0, f64::NAN)
            .await
            .unwrap();
        let err = registry
            .ensure_metric("src1", "Queries", MetricKind::Counter, 0.0, f64::NAN)
            .await
            .unwrap_err();
        assert!(matches!(err, MetricsError::InvalidSpec { .. }));

        registry.delete_entity("src-1").await.unwrap();
        registry
            .ensure_metric("src1", "Queries", MetricKind::Counter, 0.0, f64::NAN)
            .await
            .unwrap();
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_archive_config_surfaces_on_create() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.metrics.counter_archives.clear();
        let registry = MetricRegistry::new(&config);

        let err = registry
            .ensure_metric("src1", "Queries", MetricKind::Counter, 0.0, f64::NAN)
            .await
            .unwrap_err();
        assert!(matches!(err, MetricsError::InvalidSpec { .. }));
        assert!(registry.is_empty());
        assert_eq!(registry.live_samplers(), 0);
    }
}
