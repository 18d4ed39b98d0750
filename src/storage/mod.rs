//! Storage layer implementations
//!
//! This module provides the round-robin time-series store: archive layouts
//! and consolidation, the fixed-size file format, deterministic file naming
//! and read-only access for reporting tools.

pub mod archive;
pub mod format;
pub mod layout;
pub mod reader;
pub mod rrd;

pub use archive::{ArchiveSpec, ConsolidationFn, DataSourceType, SeriesSpec, DEFAULT_XFF};
pub use format::{FetchResult, SeriesInfo};
pub use layout::{sanitize, SeriesKey, STORE_EXTENSION};
pub use reader::SeriesReader;
pub use rrd::{RoundRobinStore, SharedStore};
