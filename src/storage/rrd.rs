//! Disk-backed round-robin store for one series
//!
//! The whole file is mirrored in memory. Each append rewrites the header
//! block and only the rows that changed, so the write cost stays constant no
//! matter how long the series has existed.

use crate::error::{MetricsError, Result};
use crate::storage::archive::{ConsolidationFn, SeriesSpec};
use crate::storage::format::{file_size, FetchResult, SeriesImage, SeriesInfo};
use crate::storage::layout::SeriesKey;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A store shared between its writer (one sampler) and readers
pub type SharedStore = Arc<RwLock<RoundRobinStore>>;

/// Fixed-footprint time-series file with several consolidation archives
#[derive(Debug)]
pub struct RoundRobinStore {
    name: String,
    path: PathBuf,
    file: Option<File>,
    image: SeriesImage,
}

impl RoundRobinStore {
    /// Open the store for `key` under `base_dir`, creating it if absent
    pub async fn open_or_create(base_dir: &Path, key: &SeriesKey, spec: SeriesSpec) -> Result<Self> {
        Self::create(key.path_in(base_dir), key.to_string(), spec).await
    }

    /// Create a store at `path` sized for `spec`. An existing file is
    /// reopened as-is instead of being recreated.
    pub async fn create(path: impl Into<PathBuf>, name: impl Into<String>, spec: SeriesSpec) -> Result<Self> {
        spec.validate()?;
        let path = path.into();
        let name = name.into();

        if tokio::fs::try_exists(&path).await? {
            let store = Self::open_named(&path, name).await?;
            if !same_layout(store.image.spec(), &spec) {
                warn!(
                    "Store {:?} exists with a different layout, keeping the existing one",
                    path
                );
            }
            return Ok(store);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Self::open_named(&path, name).await;
            }
            Err(e) => return Err(e.into()),
        };

        let image = SeriesImage::new(spec);
        file.write_all(&image.encode()).await?;
        file.sync_all().await?;

        info!(
            "Created store {:?} ({} bytes, {} archives)",
            path,
            file_size(image.spec()),
            image.archives().len()
        );

        Ok(Self {
            name,
            path,
            file: Some(file),
            image,
        })
    }

    /// Reopen an existing store for writing
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::open_named(&path, name).await
    }

    async fn open_named(path: &Path, name: String) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let image = SeriesImage::decode(path, &bytes)?;
        let file = OpenOptions::new().read(true).write(true).open(path).await?;
        debug!("Reopened store {:?} (last update {:?})", path, image.last_update());
        Ok(Self {
            name,
            path: path.to_path_buf(),
            file: Some(file),
            image,
        })
    }

    /// Record a sample. `value` may be NaN for "unknown".
    pub async fn append(&mut self, timestamp: u64, value: f64) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(MetricsError::ClosedStore {
                series: self.name.clone(),
            });
        };

        let Some(touched) = self.image.apply(timestamp, value) else {
            return Err(MetricsError::OutOfOrderSample {
                series: self.name.clone(),
                timestamp,
                last_update: self.image.last_update().unwrap_or_default(),
            });
        };

        // rows before the header: cursors must never run ahead of their rows
        for (archive, (first, count)) in touched.into_iter().enumerate() {
            if count == 0 {
                continue;
            }
            let ring = self.image.archives()[archive].spec.rows;
            let head = count.min(ring - first);
            for (start, len) in [(first, head), (0, count - head)] {
                if len == 0 {
                    continue;
                }
                file.seek(SeekFrom::Start(self.image.row_offset(archive, start)))
                    .await?;
                file.write_all(&self.image.encode_rows(archive, start, len))
                    .await?;
            }
        }
        file.seek(SeekFrom::Start(0)).await?;
        file.write_all(&self.image.encode_meta()).await?;
        file.flush().await?;

        debug!("Appended {} at {} to {}", value, timestamp, self.name);
        Ok(())
    }

    /// Record an unknown sample, used for gaps
    pub async fn append_unknown(&mut self, timestamp: u64) -> Result<()> {
        self.append(timestamp, f64::NAN).await
    }

    /// Consolidated rows for `[start, end]` from the best archive with `cf`
    pub fn fetch(&self, cf: ConsolidationFn, start: u64, end: u64) -> Result<FetchResult> {
        self.image.fetch(cf, start, end)
    }

    /// Most recent row of the finest archive with `cf`
    pub fn latest_row(&self, cf: ConsolidationFn) -> Option<(u64, f64)> {
        self.image
            .archives()
            .iter()
            .enumerate()
            .filter(|(_, a)| a.spec.cf == cf)
            .min_by_key(|(_, a)| a.spec.resolution)
            .and_then(|(index, a)| a.latest_row(self.image.rows(index)))
    }

    pub fn last_update(&self) -> Option<u64> {
        self.image.last_update()
    }

    pub fn info(&self) -> SeriesInfo {
        self.image.info()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Current size of the backing file
    pub async fn file_size(&self) -> Result<u64> {
        Ok(tokio::fs::metadata(&self.path).await?.len())
    }

    /// Flush and release the file handle. Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
            info!("Store {} closed", self.name);
        }
        Ok(())
    }
}

fn same_layout(a: &SeriesSpec, b: &SeriesSpec) -> bool {
    a.step == b.step && a.ds_type == b.ds_type && a.archives == b.archives
}
