//! Read-only access to store files for reporting tools

use crate::error::Result;
use crate::storage::archive::ConsolidationFn;
use crate::storage::format::{FetchResult, SeriesImage, SeriesInfo};
use crate::storage::layout::SeriesKey;
use std::path::{Path, PathBuf};

/// Snapshot of a store file taken at open time
#[derive(Debug, Clone)]
pub struct SeriesReader {
    path: PathBuf,
    image: SeriesImage,
}

impl SeriesReader {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bytes = tokio::fs::read(&path).await?;
        let image = SeriesImage::decode(&path, &bytes)?;
        Ok(Self { path, image })
    }

    /// Open the series for `key` in the metrics directory
    pub async fn open_series(base_dir: &Path, key: &SeriesKey) -> Result<Self> {
        Self::open(key.path_in(base_dir)).await
    }

    pub fn fetch(&self, cf: ConsolidationFn, start: u64, end: u64) -> Result<FetchResult> {
        self.image.fetch(cf, start, end)
    }

    pub fn info(&self) -> SeriesInfo {
        self.image.info()
    }

    pub fn last_update(&self) -> Option<u64> {
        self.image.last_update()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MetricsError;
    use crate::storage::archive::{ArchiveSpec, DataSourceType, SeriesSpec};
    use crate::storage::rrd::RoundRobinStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_reader_sees_rows_of_open_store() {
        let temp_dir = tempdir().unwrap();
        let key = SeriesKey::new("src1", "Exceptions");
        let spec = SeriesSpec::new(
            10,
            DataSourceType::Counter,
            vec![ArchiveSpec::new(ConsolidationFn::Total, 1, 8)],
        );
        let mut store = RoundRobinStore::open_or_create(temp_dir.path(), &key, spec)
            .await
            .unwrap();
        for (i, count) in [0.0, 1.0, 1.0, 4.0, 6.0].iter().enumerate() {
            store.append((i as u64 + 1) * 10, *count).await.unwrap();
        }

        let reader = SeriesReader::open_series(temp_dir.path(), &key).await.unwrap();
        assert_eq!(reader.last_update(), Some(50));
        let result = reader.fetch(ConsolidationFn::Total, 20, 40).unwrap();
        assert_eq!(result.resolution_secs, 10);
        assert_eq!(result.rows, vec![(20, 1.0), (30, 0.0), (40, 3.0)]);
        assert_eq!(reader.info().ds_type, DataSourceType::Counter);
    }

    #[tokio::test]
    async fn test_reader_missing_file() {
        let temp_dir = tempdir().unwrap();
        let result = SeriesReader::open(temp_dir.path().join("absent.rrd")).await;
        assert!(matches!(result, Err(MetricsError::Io { .. })));
    }
}
