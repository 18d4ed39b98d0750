//! In-process metric handles
//!
//! A metric is either a [`Counter`] or a [`Distribution`]. Both expose their
//! current values as named attributes, which is what samplers poll.

pub mod registry;

pub use registry::{AttributeSource, LocalAttributes, MetricRegistry, RegistryEntry};

use crate::error::{MetricsError, Result};
use crate::sampler::{AttributeReader, AttributeValue};
use crate::storage::DataSourceType;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Observations kept for `Mean`, `Min` and `Max`
pub const RECENT_WINDOW: usize = 1024;

/// Kind of metric behind a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    Counter,
    Distribution,
}

impl MetricKind {
    /// Counters are stored as rates of change, distributions as levels
    pub fn ds_type(self) -> DataSourceType {
        match self {
            MetricKind::Counter => DataSourceType::Counter,
            MetricKind::Distribution => DataSourceType::Gauge,
        }
    }

    /// Attribute a sampler polls for this kind
    pub fn sampled_attribute(self) -> &'static str {
        match self {
            MetricKind::Counter => "Count",
            MetricKind::Distribution => "Mean",
        }
    }
}

/// The metrics every entity gets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StandardMetric {
    Exceptions,
    Queries,
    TotalResults,
}

impl StandardMetric {
    pub const ALL: [StandardMetric; 3] = [
        StandardMetric::Exceptions,
        StandardMetric::Queries,
        StandardMetric::TotalResults,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StandardMetric::Exceptions => "Exceptions",
            StandardMetric::Queries => "Queries",
            StandardMetric::TotalResults => "Queries.TotalResults",
        }
    }

    pub fn kind(self) -> MetricKind {
        match self {
            StandardMetric::Exceptions | StandardMetric::Queries => MetricKind::Counter,
            StandardMetric::TotalResults => MetricKind::Distribution,
        }
    }

    /// Value domain `(min, max)`; NaN is unbounded
    pub fn bounds(self) -> (f64, f64) {
        (0.0, f64::NAN)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }
}

impl fmt::Display for StandardMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signed monotonic-by-convention counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicI64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub fn inc(&self) -> i64 {
        self.add(1)
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Bucketed histogram of non-negative observations
#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: Vec<(f64, u64)>,
    total_count: u64,
    total_sum: f64,
}

impl Histogram {
    /// 1-2-5 bucket bounds from 1 to 1e6, plus an overflow bucket
    pub fn new() -> Self {
        let mut buckets = Vec::new();
        let mut decade = 1.0;
        while decade <= 1e6 {
            for factor in [1.0, 2.0, 5.0] {
                buckets.push((decade * factor, 0));
            }
            decade *= 10.0;
        }
        buckets.push((f64::INFINITY, 0));

        Self {
            buckets,
            total_count: 0,
            total_sum: 0.0,
        }
    }

    pub fn record(&mut self, value: f64) {
        self.total_count += 1;
        self.total_sum += value;
        if let Some((_, count)) = self.buckets.iter_mut().find(|(limit, _)| value <= *limit) {
            *count += 1;
        }
    }

    /// Upper bound of the bucket holding the `p`th percentile
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.total_count == 0 {
            return None;
        }

        let target = ((self.total_count as f64 * p / 100.0).ceil() as u64).max(1);
        let mut cumulative = 0;
        for (limit, count) in &self.buckets {
            cumulative += count;
            if cumulative >= target {
                return Some(*limit);
            }
        }
        self.buckets.last().map(|(limit, _)| *limit)
    }

    pub fn average(&self) -> Option<f64> {
        (self.total_count > 0).then(|| self.total_sum / self.total_count as f64)
    }

    pub fn count(&self) -> u64 {
        self.total_count
    }

    pub fn sum(&self) -> f64 {
        self.total_sum
    }

    pub fn reset(&mut self) {
        for (_, count) in &mut self.buckets {
            *count = 0;
        }
        self.total_count = 0;
        self.total_sum = 0.0;
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct DistributionInner {
    histogram: Histogram,
    recent: VecDeque<f64>,
}

/// Distribution of observed values
#[derive(Debug, Default)]
pub struct Distribution {
    inner: Mutex<DistributionInner>,
}

impl Distribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, value: f64) {
        let mut inner = self.inner.lock();
        inner.histogram.record(value);
        if inner.recent.len() == RECENT_WINDOW {
            inner.recent.pop_front();
        }
        inner.recent.push_back(value);
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().histogram.count()
    }

    /// Mean of the recent window, NaN when nothing was observed
    pub fn mean(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.recent.is_empty() {
            return f64::NAN;
        }
        inner.recent.iter().sum::<f64>() / inner.recent.len() as f64
    }

    pub fn min(&self) -> f64 {
        self.inner
            .lock()
            .recent
            .iter()
            .copied()
            .fold(f64::NAN, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.inner
            .lock()
            .recent
            .iter()
            .copied()
            .fold(f64::NAN, f64::max)
    }

    pub fn percentile(&self, p: f64) -> Option<f64> {
        self.inner.lock().histogram.percentile(p)
    }

    pub fn snapshot(&self) -> Histogram {
        self.inner.lock().histogram.clone()
    }
}

/// A live metric
#[derive(Debug, Clone)]
pub enum MetricHandle {
    Counter(Arc<Counter>),
    Distribution(Arc<Distribution>),
}

impl MetricHandle {
    pub fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => MetricHandle::Counter(Arc::new(Counter::new())),
            MetricKind::Distribution => MetricHandle::Distribution(Arc::new(Distribution::new())),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricHandle::Counter(_) => MetricKind::Counter,
            MetricHandle::Distribution(_) => MetricKind::Distribution,
        }
    }

    /// Add to a counter or record an observation
    pub fn apply(&self, delta: i64) {
        match self {
            MetricHandle::Counter(counter) => {
                counter.add(delta);
            }
            MetricHandle::Distribution(distribution) => distribution.observe(delta as f64),
        }
    }

    pub fn as_counter(&self) -> Option<&Arc<Counter>> {
        match self {
            MetricHandle::Counter(counter) => Some(counter),
            MetricHandle::Distribution(_) => None,
        }
    }

    pub fn as_distribution(&self) -> Option<&Arc<Distribution>> {
        match self {
            MetricHandle::Distribution(distribution) => Some(distribution),
            MetricHandle::Counter(_) => None,
        }
    }

    /// Whether both handles refer to the same underlying metric
    pub fn same_metric(&self, other: &MetricHandle) -> bool {
        match (self, other) {
            (MetricHandle::Counter(a), MetricHandle::Counter(b)) => Arc::ptr_eq(a, b),
            (MetricHandle::Distribution(a), MetricHandle::Distribution(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn value_of(&self, attribute: &str) -> Option<AttributeValue> {
        match self {
            MetricHandle::Counter(counter) => match attribute {
                "Count" => Some(AttributeValue::Long(counter.get())),
                _ => None,
            },
            MetricHandle::Distribution(distribution) => match attribute {
                "Count" => Some(AttributeValue::Long(distribution.count() as i64)),
                "Mean" => Some(AttributeValue::Double(distribution.mean())),
                "Min" => Some(AttributeValue::Double(distribution.min())),
                "Max" => Some(AttributeValue::Double(distribution.max())),
                "50thPercentile" => distribution.percentile(50.0).map(AttributeValue::Double),
                "95thPercentile" => distribution.percentile(95.0).map(AttributeValue::Double),
                "99thPercentile" => distribution.percentile(99.0).map(AttributeValue::Double),
                _ => None,
            },
        }
    }
}

#[async_trait]
impl AttributeReader for MetricHandle {
    async fn read(&self, attribute: &str) -> Result<AttributeValue> {
        self.value_of(attribute)
            .ok_or_else(|| MetricsError::AttributeUnavailable {
                attribute: attribute.to_string(),
                message: format!("{:?} metric has no such attribute", self.kind()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_metrics() {
        assert_eq!(StandardMetric::Exceptions.kind(), MetricKind::Counter);
        assert_eq!(StandardMetric::TotalResults.kind(), MetricKind::Distribution);
        assert_eq!(StandardMetric::TotalResults.name(), "Queries.TotalResults");
        assert_eq!(
            StandardMetric::from_name("Queries"),
            Some(StandardMetric::Queries)
        );
        assert_eq!(StandardMetric::from_name("Latency"), None);

        let (min, max) = StandardMetric::Queries.bounds();
        assert_eq!(min, 0.0);
        assert!(max.is_nan());
    }

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.inc(), 1);
        assert_eq!(counter.add(5), 6);
        assert_eq!(counter.add(-2), 4);
        assert_eq!(counter.get(), 4);
    }

    #[test]
    fn test_histogram_percentiles() {
        let mut histogram = Histogram::new();
        assert!(histogram.percentile(50.0).is_none());
        assert!(histogram.average().is_none());

        for i in 1..=100 {
            histogram.record(i as f64);
        }
        assert_eq!(histogram.count(), 100);
        assert_eq!(histogram.sum(), 5050.0);
        assert_eq!(histogram.percentile(50.0), Some(50.0));
        assert_eq!(histogram.percentile(99.0), Some(100.0));
        assert_eq!(histogram.percentile(1.0), Some(1.0));

        histogram.record(5e7);
        assert_eq!(histogram.percentile(100.0), Some(f64::INFINITY));

        histogram.reset();
        assert_eq!(histogram.count(), 0);
    }

    #[test]
    fn test_distribution_recent_window() {
        let distribution = Distribution::new();
        assert!(distribution.mean().is_nan());
        assert!(distribution.max().is_nan());

        distribution.observe(2.0);
        distribution.observe(4.0);
        assert_eq!(distribution.mean(), 3.0);
        assert_eq!(distribution.min(), 2.0);

        for _ in 0..RECENT_WINDOW {
            distribution.observe(10.0);
        }
        assert_eq!(distribution.mean(), 10.0);
        assert_eq!(distribution.max(), 10.0);
        assert_eq!(distribution.count(), RECENT_WINDOW as u64 + 2);
    }

    #[tokio::test]
    async fn test_handles_expose_sampled_attributes() {
        let counter = MetricHandle::new(MetricKind::Counter);
        counter.apply(3);
        counter.apply(1);
        assert_eq!(
            counter.read(MetricKind::Counter.sampled_attribute()).await.unwrap(),
            AttributeValue::Long(4)
        );
        assert!(matches!(
            counter.read("Mean").await,
            Err(MetricsError::AttributeUnavailable { .. })
        ));

        let distribution = MetricHandle::new(MetricKind::Distribution);
        distribution.apply(10);
        distribution.apply(20);
        assert_eq!(
            distribution
                .read(MetricKind::Distribution.sampled_attribute())
                .await
                .unwrap(),
            AttributeValue::Double(15.0)
        );
        assert_eq!(
            distribution.read("Count").await.unwrap(),
            AttributeValue::Long(2)
        );
        assert!(distribution.same_metric(&distribution.clone()));
        assert!(!distribution.same_metric(&MetricHandle::new(MetricKind::Distribution)));
    }
}
