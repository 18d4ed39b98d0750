//! Archive definitions and consolidation
//!
//! An archive keeps a fixed ring of consolidated rows for one series. Primary
//! data points are folded into the row being built until the row's time
//! window is complete, then the row is written over the oldest slot.

use crate::error::{MetricsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Marker for "no timestamp recorded yet" in persisted state
pub const NO_TIMESTAMP: u64 = u64::MAX;

/// Default X-files factor: at most half of a row's primary points may be unknown
pub const DEFAULT_XFF: f64 = 0.5;

/// Aggregation applied when primary data points are folded into a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsolidationFn {
    Average,
    Min,
    Max,
    Total,
}

impl ConsolidationFn {
    pub fn code(self) -> u8 {
        match self {
            ConsolidationFn::Average => 0,
            ConsolidationFn::Min => 1,
            ConsolidationFn::Max => 2,
            ConsolidationFn::Total => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ConsolidationFn::Average),
            1 => Some(ConsolidationFn::Min),
            2 => Some(ConsolidationFn::Max),
            3 => Some(ConsolidationFn::Total),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConsolidationFn::Average => "AVERAGE",
            ConsolidationFn::Min => "MIN",
            ConsolidationFn::Max => "MAX",
            ConsolidationFn::Total => "TOTAL",
        }
    }
}

impl fmt::Display for ConsolidationFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConsolidationFn {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AVERAGE" | "AVG" => Ok(ConsolidationFn::Average),
            "MIN" => Ok(ConsolidationFn::Min),
            "MAX" => Ok(ConsolidationFn::Max),
            "TOTAL" => Ok(ConsolidationFn::Total),
            other => Err(MetricsError::invalid_spec(format!(
                "unknown consolidation function '{other}'"
            ))),
        }
    }
}

/// How raw samples turn into primary data points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSourceType {
    /// The sample value is the measurement itself
    Gauge,
    /// The sample is a cumulative count; the increase since the previous
    /// sample is what gets stored
    Counter,
}

impl DataSourceType {
    pub fn code(self) -> u8 {
        match self {
            DataSourceType::Gauge => 0,
            DataSourceType::Counter => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DataSourceType::Gauge),
            1 => Some(DataSourceType::Counter),
            _ => None,
        }
    }
}

/// Shape of one archive: consolidation function, primary steps per row, ring size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSpec {
    pub cf: ConsolidationFn,
    pub resolution: u32,
    pub rows: u32,
}

impl ArchiveSpec {
    pub fn new(cf: ConsolidationFn, resolution: u32, rows: u32) -> Self {
        Self {
            cf,
            resolution,
            rows,
        }
    }

    /// Seconds of history one full ring covers for the given step
    pub fn retention_secs(&self, step: u64) -> u64 {
        step * self.resolution as u64 * self.rows as u64
    }
}

/// Full layout of a series: step, source type, value domain and archives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSpec {
    pub step: u64,
    pub ds_type: DataSourceType,
    /// Lower bound of accepted values, NaN for unbounded
    pub min: f64,
    /// Upper bound of accepted values, NaN for unbounded
    pub max: f64,
    pub xff: f64,
    pub archives: Vec<ArchiveSpec>,
}

impl SeriesSpec {
    pub fn new(step: u64, ds_type: DataSourceType, archives: Vec<ArchiveSpec>) -> Self {
        Self {
            step,
            ds_type,
            min: f64::NAN,
            max: f64::NAN,
            xff: DEFAULT_XFF,
            archives,
        }
    }

    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_xff(mut self, xff: f64) -> Self {
        self.xff = xff;
        self
    }

    /// Reject layouts that cannot be stored
    pub fn validate(&self) -> Result<()> {
        if self.step == 0 {
            return Err(MetricsError::invalid_spec("step must be at least one second"));
        }
        if self.archives.is_empty() {
            return Err(MetricsError::invalid_spec("at least one archive is required"));
        }
        if self.archives.len() > u8::MAX as usize {
            return Err(MetricsError::invalid_spec(format!(
                "too many archives: {}",
                self.archives.len()
            )));
        }
        if !(0.0..1.0).contains(&self.xff) {
            return Err(MetricsError::invalid_spec(format!(
                "xff must be in [0, 1), got {}",
                self.xff
            )));
        }
        if !self.min.is_nan() && !self.max.is_nan() && self.min >= self.max {
            return Err(MetricsError::invalid_spec(format!(
                "min {} must be below max {}",
                self.min, self.max
            )));
        }
        for (index, archive) in self.archives.iter().enumerate() {
            if archive.resolution == 0 {
                return Err(MetricsError::invalid_spec(format!(
                    "archive {index}: resolution must be positive"
                )));
            }
            if archive.rows == 0 {
                return Err(MetricsError::invalid_spec(format!(
                    "archive {index}: row count must be positive"
                )));
            }
        }
        Ok(())
    }

    /// Map a contribution outside [min, max] to unknown
    pub fn clamp_to_domain(&self, value: f64) -> f64 {
        if value.is_nan() {
            return value;
        }
        if (!self.min.is_nan() && value < self.min) || (!self.max.is_nan() && value > self.max) {
            return f64::NAN;
        }
        value
    }
}

/// Round `ts` up to the next multiple of `span`
pub fn align_up(ts: u64, span: u64) -> u64 {
    ts.div_ceil(span) * span
}

/// Consolidated data point under construction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CdpState {
    pub end: u64,
    pub value: f64,
    pub known: u32,
}

impl CdpState {
    pub fn empty() -> Self {
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

    fn fold(&mut self, cf: ConsolidationFn, pdp: f64) {
        if pdp.is_nan() {
            return;
        }
        self.known += 1;
        if self.value.is_nan() {
            self.value = pdp;
            return;
        }
        self.value = match cf {
            ConsolidationFn::Average | ConsolidationFn::Total => self.value + pdp,
            ConsolidationFn::Min => self.value.min(pdp),
            ConsolidationFn::Max => self.value.max(pdp),
        };
    }

    fn finalize(&self, spec: &ArchiveSpec, xff: f64) -> f64 {
        let unknown = spec.resolution.saturating_sub(self.known);
        if self.known == 0 || unknown as f64 / spec.resolution as f64 > xff {
            return f64::NAN;
        }
        match spec.cf {
            ConsolidationFn::Average => self.value / self.known as f64,
            ConsolidationFn::Min | ConsolidationFn::Max | ConsolidationFn::Total => self.value,
        }
    }
}

/// Persistent state of one archive, excluding its row data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveState {
    pub spec: ArchiveSpec,
    /// Ring index of the most recently written row
    pub cur_row: u32,
    /// End timestamp of the most recently written row
    pub last_row_end: u64,
    pub cdp: CdpState,
}

impl ArchiveState {
    pub fn new(spec: ArchiveSpec) -> Self {
        Self {
            spec,
            // first write lands on row 0
            cur_row: spec.rows.saturating_sub(1),
            last_row_end: NO_TIMESTAMP,
            cdp: CdpState::empty(),
        }
    }

    /// Seconds covered by one row
    pub fn row_span(&self, step: u64) -> u64 {
        step * self.spec.resolution as u64
    }

    /// Fold a finished primary data point ending at `pdp_end` into this
    /// archive. Completed rows are written into `rows`; the number of rows
    /// written (at most the ring size) is returned.
    pub fn push_pdp(&mut self, pdp_end: u64, pdp: f64, step: u64, xff: f64, rows: &mut [f64]) -> u32 {
        let span = self.row_span(step);
        let cdp_end = align_up(pdp_end, span);
        let mut written: u64 = 0;

        // a window left open by missing points closes once a later one starts
        if self.cdp.end != NO_TIMESTAMP && cdp_end > self.cdp.end {
            let finished = self.cdp.finalize(&self.spec, xff);
            self.write_row(self.cdp.end, finished, rows);
            self.cdp = CdpState::empty();
            written += 1;
        }

        // whole windows without any primary point are unknown rows
        if self.last_row_end != NO_TIMESTAMP && cdp_end > self.last_row_end + span {
            let skipped = (cdp_end - self.last_row_end) / span - 1;
            let fill = skipped.min(self.spec.rows as u64);
            for i in (1..=fill).rev() {
                self.write_row(cdp_end - i * span, f64::NAN, rows);
                written += 1;
            }
        }

        if self.cdp.end == NO_TIMESTAMP {
            self.cdp = CdpState::starting_at(cdp_end);
        }
        self.cdp.fold(self.spec.cf, pdp);

        if pdp_end == cdp_end {
            let finished = self.cdp.finalize(&self.spec, xff);
            self.write_row(cdp_end, finished, rows);
            self.cdp = CdpState::empty();
            written += 1;
        }

        written.min(self.spec.rows as u64) as u32
    }

    fn write_row(&mut self, end: u64, value: f64, rows: &mut [f64]) {
        self.cur_row = (self.cur_row + 1) % self.spec.rows;
        rows[self.cur_row as usize] = value;
        self.last_row_end = end;
    }

    /// Timestamp and value of the most recently written row
    pub fn latest_row(&self, rows: &[f64]) -> Option<(u64, f64)> {
        if self.last_row_end == NO_TIMESTAMP {
            return None;
        }
        Some((self.last_row_end, rows[self.cur_row as usize]))
    }

    /// Earliest row end still held in the ring
    pub fn oldest_row_end(&self, step: u64) -> Option<u64> {
        if self.last_row_end == NO_TIMESTAMP {
            return None;
        }
        let back = (self.spec.rows as u64 - 1) * self.row_span(step);
        Some(self.last_row_end.saturating_sub(back))
    }

    /// Rows in chronological order as (row end, value), skipping slots that
    /// would predate the epoch
    pub fn rows_chronological(&self, step: u64, rows: &[f64]) -> Vec<(u64, f64)> {
        if self.last_row_end == NO_TIMESTAMP {
            return Vec::new();
        }
        let span = self.row_span(step);
        let count = self.spec.rows as u64;
        (0..count)
            .filter_map(|k| {
                let end = self.last_row_end.checked_sub((count - 1 - k) * span)?;
                let index = (self.cur_row as u64 + 1 + k) % count;
                Some((end, rows[index as usize]))
            })
            .collect()
    }
}
