//! Integration test for structured logging
//!
//! Lives in its own test binary so the global subscriber installed here is
//! the only one.

use catalog_metrics::config::{LogFormat, LoggingConfig};
use catalog_metrics::logging::LoggingSystem;
use catalog_metrics::{Config, MetricKind, MetricsEngine};
use tempfile::TempDir;

#[tokio::test]
async fn test_json_file_logging_records_lifecycle_events() {
    let temp_dir = TempDir::new().unwrap();
    let log_path = temp_dir.path().join("logs").join("metrics.log");

    let logging = LoggingSystem::new(LoggingConfig {
        level: "debug".to_string(),
        format: LogFormat::Json,
        file_path: Some(log_path.clone()),
    });
    logging.initialize().await.unwrap();
    assert!(log_path.exists());

    let mut config = Config::default();
    config.metrics.base_dir = temp_dir.path().join("metrics");
    let engine = MetricsEngine::new(config).unwrap();
    engine.start().await.unwrap();
    engine
        .registry()
        .ensure_metric("src1", "Queries", MetricKind::Counter, 0.0, f64::NAN)
        .await
        .unwrap();
    engine.shutdown().await.unwrap();

    let content = tokio::fs::read_to_string(&log_path).await.unwrap();
    let lines: Vec<serde_json::Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(!lines.is_empty());
    assert!(lines.iter().all(|line| line.get("timestamp").is_some()));
    assert!(lines.iter().any(|line| {
        line["fields"]["message"]
            .as_str()
            .is_some_and(|m| m.contains("Created Counter metric src1.Queries"))
    }));
}
