//! End-to-end scenarios through the lifecycle bridge and registry
//!
//! Samplers run on real timers with short periods; the minimum update
//! interval keeps store writes deterministic.

use async_trait::async_trait;
use catalog_metrics::config::SamplerConfig;
use catalog_metrics::sampler::FailureCallback;
use catalog_metrics::{
    ArchiveSpec, AttributeReader, AttributeRef, AttributeSource, AttributeValue, Config,
    ConsolidationFn, EntityHandle, EntityLifecycleBridge, LocalAttributes, MetricHandle,
    MetricKind, MetricRegistry, MetricsEngine, MetricsError, Result, SamplerState, SeriesKey,
    SeriesReader, StandardMetric,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(base_dir: &Path, min_update_interval_secs: u64) -> Config {
    let mut config = Config::default();
    config.metrics.base_dir = base_dir.to_path_buf();
    config.metrics.counter_archives = vec![
        ArchiveSpec::new(ConsolidationFn::Total, 1, 60),
        ArchiveSpec::new(ConsolidationFn::Total, 15, 24),
    ];
    config.metrics.gauge_archives = vec![
        ArchiveSpec::new(ConsolidationFn::Average, 1, 60),
        ArchiveSpec::new(ConsolidationFn::Max, 1, 60),
    ];
    config.metrics.worker_pool_size = 8;
    config.sampler = SamplerConfig {
        period_ms: 25,
        min_update_interval_secs,
        probe_timeout_ms: 300,
        probe_interval_ms: 20,
    };
    config
}

async fn wait_for_state(registry: &MetricRegistry, entity: &str, metric: &str, target: SamplerState) {
    let entry = registry
        .entry(entity, metric)
        .unwrap_or_else(|| panic!("no entry for {entity}.{metric}"));
    let mut state = entry.sampler().subscribe();
    tokio::time::timeout(Duration::from_secs(10), state.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("{entity}.{metric} never reached {target:?}"))
        .unwrap();
}

struct Unreachable;

#[async_trait]
impl AttributeReader for Unreachable {
    async fn read(&self, attribute: &str) -> Result<AttributeValue> {
        Err(MetricsError::AttributeUnavailable {
            attribute: attribute.to_string(),
            message: "source offline".to_string(),
        })
    }
}

/// Entities listed as offline never expose their attributes
struct OfflineSources {
    offline: HashSet<String>,
}

impl AttributeSource for OfflineSources {
    fn attribute_for(&self, key: &SeriesKey, handle: &MetricHandle) -> AttributeRef {
        if self.offline.contains(&key.entity_id) {
            AttributeRef::new(Arc::new(Unreachable), handle.kind().sampled_attribute())
        } else {
            LocalAttributes.attribute_for(key, handle)
        }
    }
}

#[tokio::test]
async fn test_repeated_ensure_creates_one_series() {
    let temp_dir = TempDir::new().unwrap();
    let engine = MetricsEngine::new(test_config(temp_dir.path(), 1)).unwrap();
    engine.start().await.unwrap();
    let registry = engine.registry();

    let mut handles = Vec::new();
    for _ in 0..5 {
        handles.push(
            registry
                .ensure_metric("src1", "Queries", MetricKind::Counter, 0.0, f64::NAN)
                .await
                .unwrap(),
        );
    }
    assert!(handles.windows(2).all(|w| w[0].same_metric(&w[1])));
    wait_for_state(registry, "src1", "Queries", SamplerState::Active).await;

    let files: Vec<_> = std::fs::read_dir(temp_dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(files, vec![std::ffi::OsString::from("src1Queries.rrd")]);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_updates_within_interval_coalesce_into_one_append() {
    let temp_dir = TempDir::new().unwrap();
    let engine = MetricsEngine::new(test_config(temp_dir.path(), 60)).unwrap();
    engine.start().await.unwrap();
    let bridge = engine.bridge();
    let registry = engine.registry();

    let handle = EntityHandle::new();
    let report = bridge.on_entity_added(handle, "src1").wait().await;
    assert!(!report.is_degraded());
    wait_for_state(registry, "src1", "Exceptions", SamplerState::Active).await;

    for _ in 0..3 {
        registry.update("src1", "Exceptions", 1).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(250)).await;

    let entry = registry.entry("src1", "Exceptions").unwrap();
    let stats = entry.sampler_stats();
    assert_eq!(stats.written, 1, "stats: {stats:?}");
    assert!(stats.skipped >= 3, "stats: {stats:?}");
    assert_eq!(entry.handle.as_counter().unwrap().get(), 3);

    let store = entry.store().unwrap();
    assert!(store.read().await.last_update().is_some());

    bridge.on_entity_removed(handle).await.unwrap();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_unreadable_source_fails_probing_and_leaves_no_file() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path(), 1);
    let failures = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&failures);
    let callback: FailureCallback = Arc::new(move |key: &SeriesKey, err: &MetricsError| {
        assert_eq!(key.entity_id, "src2");
        assert!(matches!(err, MetricsError::AttributeUnavailable { .. }));
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let source = Arc::new(OfflineSources {
        offline: HashSet::from(["src2".to_string()]),
    });
    let registry = Arc::new(
        MetricRegistry::with_attribute_source(&config, source).with_failure_callback(callback),
    );
    registry.start().await.unwrap();
    let bridge = EntityLifecycleBridge::new(Arc::clone(&registry), 4);

    let handle = EntityHandle::new();
    let report = bridge.on_entity_added(handle, "src2").wait().await;
    assert_eq!(report.created.len(), 3);

    for metric in StandardMetric::ALL {
        wait_for_state(&registry, "src2", metric.name(), SamplerState::Failed).await;
        let path = SeriesKey::new("src2", metric.name()).path_in(temp_dir.path());
        assert!(!path.exists(), "{path:?} should not exist");
    }
    assert_eq!(failures.load(Ordering::SeqCst), 3);
    assert_eq!(registry.open_stores(), 0);

    bridge.on_entity_removed(handle).await.unwrap();
    assert!(registry.is_empty());
    assert_eq!(registry.live_samplers(), 0);
    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_rename_starts_fresh_series_and_freezes_old_one() {
    let temp_dir = TempDir::new().unwrap();
    let engine = MetricsEngine::new(test_config(temp_dir.path(), 1)).unwrap();
    engine.start().await.unwrap();
    let bridge = engine.bridge();
    let registry = engine.registry();

    let handle = EntityHandle::new();
    bridge.on_entity_added(handle, "a").wait().await;
    wait_for_state(registry, "a", "Queries", SamplerState::Active).await;
    registry.update("a", "Queries", 5).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(bridge.on_entity_observed(handle, "b").await.unwrap());
    let old_path = SeriesKey::new("a", "Queries").path_in(temp_dir.path());
    let frozen = std::fs::read(&old_path).unwrap();
    let old = SeriesReader::open(&old_path).await.unwrap();
    let old_last_update = old.last_update();
    assert!(old_last_update.is_some());

    wait_for_state(registry, "b", "Queries", SamplerState::Active).await;
    // long enough for the new sampler to append past a one-second boundary
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let new_entry = registry.entry("b", "Queries").unwrap();
    assert!(new_entry.sampler_stats().written >= 1);
    assert_eq!(new_entry.handle.as_counter().unwrap().get(), 0);
    assert_eq!(std::fs::read(&old_path).unwrap(), frozen);
    assert_eq!(
        SeriesReader::open(&old_path).await.unwrap().last_update(),
        old_last_update
    );

    bridge.on_entity_removed(handle).await.unwrap();
    assert!(registry.is_empty());
    assert!(old_path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_entities_added_and_removed_concurrently() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Arc::new(MetricsEngine::new(test_config(temp_dir.path(), 1)).unwrap());
    engine.start().await.unwrap();

    let handles: Vec<(EntityHandle, String)> = (0..100)
        .map(|i| (EntityHandle::new(), format!("source-{i}")))
        .collect();

    let adds: Vec<_> = handles
        .iter()
        .cloned()
        .map(|(handle, id)| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.bridge().on_entity_added(handle, &id).wait().await })
        })
        .collect();
    for add in adds {
        assert!(!add.await.unwrap().is_degraded());
    }

    let registry = engine.registry();
    assert_eq!(registry.len(), 300);
    for (_, id) in &handles {
        for metric in StandardMetric::ALL {
            wait_for_state(registry, id, metric.name(), SamplerState::Active).await;
        }
    }
    assert_eq!(registry.live_samplers(), 300);
    assert_eq!(registry.open_stores(), 300);

    let removes: Vec<_> = handles
        .iter()
        .map(|(handle, _)| {
            let engine = Arc::clone(&engine);
            let handle = *handle;
            tokio::spawn(async move { engine.bridge().on_entity_removed(handle).await })
        })
        .collect();
    for remove in removes {
        remove.await.unwrap().unwrap();
    }

    assert!(registry.is_empty());
    assert_eq!(engine.bridge().tracked_entities(), 0);
    assert_eq!(registry.live_samplers(), 0);
    assert_eq!(registry.open_stores(), 0);
}
