//! Series identity and deterministic file naming
//!
//! Every `(entity, metric)` pair maps to exactly one file in a flat metrics
//! directory. Non-alphanumeric characters are stripped from both parts so the
//! name is safe on every filesystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Extension of every store file
pub const STORE_EXTENSION: &str = "rrd";

/// Logical key of a series: the entity's external id and the metric name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub entity_id: String,
    pub metric: String,
}

impl SeriesKey {
    pub fn new(entity_id: impl Into<String>, metric: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            metric: metric.into(),
        }
    }

    /// File name of this series, e.g. `src1Queries.rrd` for `("src-1", "Queries")`
    pub fn file_name(&self) -> String {
        format!(
            "{}{}.{}",
            sanitize(&self.entity_id),
            sanitize(&self.metric),
            STORE_EXTENSION
        )
    }

    /// Path of this series' store under `base_dir`
    pub fn path_in(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(self.file_name())
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity_id, self.metric)
    }
}

/// Keep only ASCII letters and digits
pub fn sanitize(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}
