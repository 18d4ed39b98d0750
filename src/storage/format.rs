//! Fixed-size on-disk image of a series
//!
//! Layout (all integers and floats little endian):
//!
//! ```text
//! header            80 bytes   magic, version, source type, step, xff,
//!                              value domain, last update, counter baseline,
//!                              primary data point in progress
//! descriptors       48 bytes   per archive: cf, resolution, rows, ring
//!                              cursor, last row end, row in progress
//! rows              8 bytes    per row, archive after archive
//! ```
//!
//! The header and descriptors are contiguous so the mutable bookkeeping of
//! one update is rewritten with a single positioned write. The file never
//! grows after creation.

use crate::error::{MetricsError, Result};
use crate::storage::archive::{
    align_up, ArchiveSpec, ArchiveState, CdpState, ConsolidationFn, DataSourceType, SeriesSpec,
    NO_TIMESTAMP,
};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MAGIC: &[u8; 4] = b"CMRR";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 80;
pub const ARCHIVE_DESC_LEN: usize = 48;
const ROW_LEN: usize = 8;

/// Bytes a series with this layout occupies on disk
pub fn file_size(spec: &SeriesSpec) -> u64 {
    let rows: u64 = spec.archives.iter().map(|a| a.rows as u64).sum();
    (HEADER_LEN + spec.archives.len() * ARCHIVE_DESC_LEN) as u64 + rows * ROW_LEN as u64
}

/// Primary data point under construction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdpState {
    pub end: u64,
    pub value: f64,
    pub known: u32,
}

impl PdpState {
    fn empty() -> Self {
        Self {
            end: NO_TIMESTAMP,
            value: f64::NAN,
            known: 0,
        }
    }

    fn starting_at(end: u64) -> Self {
        Self {
            end,
            value: f64::NAN,
            known: 0,
        }
    }

    fn add(&mut self, contribution: f64) {
        if contribution.is_nan() {
            return;
        }
        self.known += 1;
        self.value = if self.value.is_nan() {
            contribution
        } else {
            self.value + contribution
        };
    }

    fn finalize(&self, ds_type: DataSourceType) -> f64 {
        if self.known == 0 {
            return f64::NAN;
        }
        match ds_type {
            DataSourceType::Gauge => self.value / self.known as f64,
            DataSourceType::Counter => self.value,
        }
    }
}

/// Rows touched by one update, per archive, as (first ring index, count)
pub type TouchedRows = Vec<(u32, u32)>;

/// Result of a fetch: the archive that answered and its rows, oldest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub cf: ConsolidationFn,
    pub resolution_secs: u64,
    pub rows: Vec<(u64, f64)>,
}

/// Summary of a series layout for reporting tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub step: u64,
    pub ds_type: DataSourceType,
    pub min: f64,
    pub max: f64,
    pub xff: f64,
    pub last_update: Option<u64>,
    pub archives: Vec<ArchiveSpec>,
    pub file_size: u64,
}

/// In-memory copy of a whole store file
#[derive(Debug, Clone)]
pub struct SeriesImage {
    spec: SeriesSpec,
    last_update: u64,
    last_raw: f64,
    pdp: PdpState,
    archives: Vec<ArchiveState>,
    rows: Vec<Vec<f64>>,
}

impl SeriesImage {
    /// Fresh image for a validated spec, every row unknown
    pub fn new(spec: SeriesSpec) -> Self {
        let archives = spec.archives.iter().map(|a| ArchiveState::new(*a)).collect();
        let rows = spec
            .archives
            .iter()
            .map(|a| vec![f64::NAN; a.rows as usize])
            .collect();
        Self {
            spec,
            last_update: NO_TIMESTAMP,
            last_raw: f64::NAN,
            pdp: PdpState::empty(),
            archives,
            rows,
        }
    }

    pub fn spec(&self) -> &SeriesSpec {
        &self.spec
    }

    pub fn last_update(&self) -> Option<u64> {
        (self.last_update != NO_TIMESTAMP).then_some(self.last_update)
    }

    pub fn archives(&self) -> &[ArchiveState] {
        &self.archives
    }

    pub fn rows(&self, archive: usize) -> &[f64] {
        &self.rows[archive]
    }

    /// Apply one sample. Returns the ring spans written per archive, or
    /// `None` if the timestamp does not advance the series (nothing changed).
    pub fn apply(&mut self, timestamp: u64, value: f64) -> Option<TouchedRows> {
        if self.last_update != NO_TIMESTAMP && timestamp <= self.last_update {
            return None;
        }

        let contribution = self.contribution(value);
        let pdp_end = align_up(timestamp, self.spec.step);
        let mut touched: TouchedRows = self.archives.iter().map(|a| (a.cur_row, 0)).collect();

        if self.pdp.end == NO_TIMESTAMP {
            self.pdp = PdpState::starting_at(pdp_end);
        } else if pdp_end > self.pdp.end {
            let finished = self.pdp.finalize(self.spec.ds_type);
            let finished_end = self.pdp.end;
            for (index, archive) in self.archives.iter_mut().enumerate() {
                let start = (archive.cur_row + 1) % archive.spec.rows;
                let written = archive.push_pdp(
                    finished_end,
                    finished,
                    self.spec.step,
                    self.spec.xff,
                    &mut self.rows[index],
                );
                touched[index] = (start, written);
            }
            self.pdp = PdpState::starting_at(pdp_end);
        }

        self.pdp.add(contribution);
        self.last_update = timestamp;
        Some(touched)
    }

    fn contribution(&mut self, value: f64) -> f64 {
        let raw = match self.spec.ds_type {
            DataSourceType::Gauge => value,
            DataSourceType::Counter => {
                let previous = self.last_raw;
                self.last_raw = value;
                if value.is_nan() || previous.is_nan() {
                    f64::NAN
                } else if value < previous {
                    // counter reset
                    f64::NAN
                } else {
                    value - previous
                }
            }
        };
        self.spec.clamp_to_domain(raw)
    }

    /// Rows of the best archive with `cf` for the range `[start, end]`
    pub fn fetch(&self, cf: ConsolidationFn, start: u64, end: u64) -> Result<FetchResult> {
        let step = self.spec.step;
        let mut candidates: Vec<usize> = (0..self.archives.len())
            .filter(|&i| self.archives[i].spec.cf == cf)
            .collect();
        if candidates.is_empty() {
            return Err(MetricsError::invalid_spec(format!(
                "series has no {cf} archive"
            )));
        }
        candidates.sort_by_key(|&i| self.archives[i].spec.resolution);

        let chosen = candidates
            .iter()
            .copied()
            .find(|&i| {
                self.archives[i]
                    .oldest_row_end(step)
                    .is_some_and(|oldest| oldest <= start)
            })
            .or_else(|| {
                candidates
                    .iter()
                    .copied()
                    .max_by_key(|&i| self.archives[i].spec.retention_secs(step))
            })
            .unwrap_or(candidates[0]);

        let archive = &self.archives[chosen];
        let span = archive.row_span(step);
        let rows = archive
            .rows_chronological(step, &self.rows[chosen])
            .into_iter()
            .filter(|(row_end, _)| *row_end >= start && row_end.saturating_sub(span) < end)
            .collect();

        Ok(FetchResult {
            cf,
            resolution_secs: span,
            rows,
        })
    }

    pub fn info(&self) -> SeriesInfo {
        SeriesInfo {
            step: self.spec.step,
            ds_type: self.spec.ds_type,
            min: self.spec.min,
            max: self.spec.max,
            xff: self.spec.xff,
            last_update: self.last_update(),
            archives: self.spec.archives.clone(),
            file_size: file_size(&self.spec),
        }
    }

    /// Header plus all archive descriptors
    pub fn encode_meta(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data_offset() as usize);
        buf.put_slice(MAGIC);
        buf.put_u16_le(FORMAT_VERSION);
        buf.put_u8(self.spec.ds_type.code());
        buf.put_u8(self.archives.len() as u8);
        buf.put_u64_le(self.spec.step);
        buf.put_f64_le(self.spec.xff);
        buf.put_f64_le(self.spec.min);
        buf.put_f64_le(self.spec.max);
        buf.put_u64_le(self.last_update);
        buf.put_f64_le(self.last_raw);
        buf.put_u64_le(self.pdp.end);
        buf.put_f64_le(self.pdp.value);
        buf.put_u32_le(self.pdp.known);
        buf.put_u32_le(0);
        debug_assert_eq!(buf.len(), HEADER_LEN);

        for archive in &self.archives {
            buf.put_u8(archive.spec.cf.code());
            buf.put_bytes(0, 3);
            buf.put_u32_le(archive.spec.resolution);
            buf.put_u32_le(archive.spec.rows);
            buf.put_u32_le(archive.cur_row);
            buf.put_u64_le(archive.last_row_end);
            buf.put_u64_le(archive.cdp.end);
            buf.put_f64_le(archive.cdp.value);
            buf.put_u32_le(archive.cdp.known);
            buf.put_u32_le(0);
        }
        buf
    }

    /// Complete file contents
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.encode_meta();
        buf.reserve(file_size(&self.spec) as usize - buf.len());
        for rows in &self.rows {
            for value in rows {
                buf.put_f64_le(*value);
            }
        }
        buf
    }

    /// Encoded bytes of `count` consecutive rows starting at ring index `first`
    /// of one archive. The span must not wrap.
    pub fn encode_rows(&self, archive: usize, first: u32, count: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(count as usize * ROW_LEN);
        for value in &self.rows[archive][first as usize..(first + count) as usize] {
            buf.put_f64_le(*value);
        }
        buf
    }

    pub fn data_offset(&self) -> u64 {
        (HEADER_LEN + self.archives.len() * ARCHIVE_DESC_LEN) as u64
    }

    /// File offset of one row
    pub fn row_offset(&self, archive: usize, row: u32) -> u64 {
        let before: u64 = self.archives[..archive]
            .iter()
            .map(|a| a.spec.rows as u64)
            .sum();
        self.data_offset() + (before + row as u64) * ROW_LEN as u64
    }

    /// Parse a complete file image
    pub fn decode(path: &Path, bytes: &[u8]) -> Result<Self> {
        let corrupt = |message: String| MetricsError::CorruptStore {
            path: path.to_path_buf(),
            message,
        };

        if bytes.len() < HEADER_LEN {
            return Err(corrupt(format!("file too short: {} bytes", bytes.len())));
        }
        let mut buf = bytes;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }
        let version = buf.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        let ds_type = DataSourceType::from_code(buf.get_u8())
            .ok_or_else(|| corrupt("unknown data source type".to_string()))?;
        let archive_count = buf.get_u8() as usize;
        let step = buf.get_u64_le();
        let xff = buf.get_f64_le();
        let min = buf.get_f64_le();
        let max = buf.get_f64_le();
        let last_update = buf.get_u64_le();
        let last_raw = buf.get_f64_le();
        let pdp = PdpState {
            end: buf.get_u64_le(),
            value: buf.get_f64_le(),
            known: buf.get_u32_le(),
        };
        buf.advance(4);

        if buf.remaining() < archive_count * ARCHIVE_DESC_LEN {
            return Err(corrupt("truncated archive descriptors".to_string()));
        }
        let mut archives = Vec::with_capacity(archive_count);
        for index in 0..archive_count {
            let cf = ConsolidationFn::from_code(buf.get_u8())
                .ok_or_else(|| corrupt(format!("archive {index}: unknown consolidation function")))?;
            buf.advance(3);
            let spec = ArchiveSpec::new(cf, buf.get_u32_le(), buf.get_u32_le());
            let cur_row = buf.get_u32_le();
            let last_row_end = buf.get_u64_le();
            let cdp = CdpState {
                end: buf.get_u64_le(),
                value: buf.get_f64_le(),
                known: buf.get_u32_le(),
            };
            buf.advance(4);
            if spec.resolution == 0 || spec.rows == 0 || cur_row >= spec.rows {
                return Err(corrupt(format!("archive {index}: inconsistent descriptor")));
            }
            archives.push(ArchiveState {
                spec,
                cur_row,
                last_row_end,
                cdp,
            });
        }

        let spec = SeriesSpec {
            step,
            ds_type,
            min,
            max,
            xff,
            archives: archives.iter().map(|a| a.spec).collect(),
        };
        spec.validate()
            .map_err(|e| corrupt(format!("invalid layout: {e}")))?;

        let expected = file_size(&spec);
        if bytes.len() as u64 != expected {
            return Err(corrupt(format!(
                "size {} does not match layout size {expected}",
                bytes.len()
            )));
        }

        let rows = archives
            .iter()
            .map(|a| (0..a.spec.rows).map(|_| buf.get_f64_le()).collect())
            .collect();

        Ok(Self {
            spec,
            last_update,
            last_raw,
            pdp,
            archives,
            rows,
        })
    }
}
