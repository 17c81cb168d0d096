use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DatamanError, Result};

/// One week in milliseconds; the default tolerance for "new" files that
/// carry a modification time older than the watermark.
pub const ONE_WEEK_MS: i64 = 1000 * 60 * 60 * 24 * 7;

/// Global knobs for the dataset coordination services.
///
/// All fields carry defaults so a deployment only needs to spell out the
/// values it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct DatamanConfig {
    /// Worker pool sizing for the serial command executor.
    pub executor: ExecutorConfig,
    /// Capacity and change-feed tuning for the dataset cache.
    pub cache: CacheConfig,
    /// Where the "last processed" watermark lives.
    pub watermark: WatermarkConfig,
}

impl DatamanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.executor.workers == 0 {
            return Err(DatamanError::Contract(
                "executor.workers must be at least 1".into(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(DatamanError::Contract(
                "cache.capacity must be at least 1".into(),
            ));
        }
        if self.cache.label_capacity < self.cache.capacity {
            return Err(DatamanError::Contract(
                "cache.label_capacity must be at least cache.capacity".into(),
            ));
        }
        if self.cache.grace_period_ms < 0 {
            return Err(DatamanError::Contract(
                "cache.grace_period_ms must not be negative".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of keys drained concurrently. Further keys wait for a
    /// free worker instead of spawning more work.
    pub workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory that dataset identifiers are resolved against.
    pub directory: PathBuf,
    /// Maximum number of parsed datasets kept in memory.
    pub capacity: usize,
    /// Maximum number of remembered labels. Labels outlive evicted entries so
    /// deletions can be reported by label; the least recently published ones
    /// are forgotten past this bound.
    pub label_capacity: usize,
    /// "New" files older than `watermark - grace_period_ms` are ignored.
    pub grace_period_ms: i64,
    /// How many upcoming file names to announce to the change source.
    pub lookahead: usize,
    /// Accepted file extensions without the dot. Empty accepts everything.
    pub extensions: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            capacity: 1000,
            label_capacity: 10_000,
            grace_period_ms: ONE_WEEK_MS,
            lookahead: 5,
            extensions: Vec::new(),
        }
    }
}

impl CacheConfig {
    pub fn accepts(&self, file_name: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let Some((_, ext)) = file_name.rsplit_once('.') else {
            return false;
        };
        self.extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ext))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct WatermarkConfig {
    /// JSON file holding the watermark. `None` keeps it in memory only.
    pub path: Option<PathBuf>,
}
