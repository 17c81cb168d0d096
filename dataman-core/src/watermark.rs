//! Durable, monotonic "last processed" timestamp.
//!
//! Restart recovery resumes incremental scanning from the watermark instead
//! of reprocessing every file. The only mutation the cache uses is
//! [`WatermarkStore::raise_to`], so out-of-order batches can never move it
//! backwards.

use std::{
    fmt,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DatamanError, Result};

/// Value reported by [`WatermarkStore::get`] before anything was recorded.
pub const UNSET_WATERMARK: i64 = -1;

/// Single-scalar persistence used by [`WatermarkStore`].
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<Option<i64>>;

    /// Must not return before the value is durable.
    fn store(&self, value: i64) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// Keeps the watermark in memory only.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    value: Mutex<Option<i64>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<i64>> {
        Ok(*self.value.lock())
    }

    fn store(&self, value: i64) -> Result<()> {
        *self.value.lock() = Some(value);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.value.lock() = None;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkDocument {
    last_modified: i64,
    updated_at: DateTime<Utc>,
}

/// Stores the watermark as a small JSON document.
///
/// Writes go to a sibling temp file that is synced and then renamed over
/// the target, so a crash leaves either the old or the new value.
#[derive(Clone, Debug)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "watermark".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<i64>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let document: WatermarkDocument = serde_json::from_str(&raw)?;
        Ok(Some(document.last_modified))
    }

    fn store(&self, value: i64) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let document = WatermarkDocument {
            last_modified: value,
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&document)?;

        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Monotonic high-water mark over a [`StateStore`].
pub struct WatermarkStore {
    store: Arc<dyn StateStore>,
    // Cached copy of the persisted value; the mutex also serializes writers.
    current: Mutex<i64>,
}

impl fmt::Debug for WatermarkStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store_type = std::any::type_name_of_val(self.store.as_ref());
        f.debug_struct("WatermarkStore")
            .field("store_type", &store_type)
            .field("current", &self.get())
            .finish()
    }
}

impl WatermarkStore {
    /// Opens the store, reading any previously persisted value.
    pub fn open(store: Arc<dyn StateStore>) -> Result<Self> {
        let current = store.load()?.unwrap_or(UNSET_WATERMARK);
        debug!(target: "dataman::watermark", current, "watermark loaded");
        Ok(Self {
            store,
            current: Mutex::new(current),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryStateStore::new()),
            current: Mutex::new(UNSET_WATERMARK),
        }
    }

    /// Last persisted value, or [`UNSET_WATERMARK`].
    pub fn get(&self) -> i64 {
        *self.current.lock()
    }

    pub fn is_set(&self) -> bool {
        self.get() != UNSET_WATERMARK
    }

    /// Persists `value` unconditionally. Negative values are a caller bug.
    pub fn set(&self, value: i64) -> Result<()> {
        if value < 0 {
            return Err(DatamanError::Contract(format!(
                "watermark must not be negative (got {value})"
            )));
        }
        let mut current = self.current.lock();
        self.store.store(value)?;
        *current = value;
        Ok(())
    }

    /// Persists `value` only if it is greater than the current watermark.
    /// Returns whether the watermark moved.
    pub fn raise_to(&self, value: i64) -> Result<bool> {
        if value < 0 {
            return Err(DatamanError::Contract(format!(
                "watermark must not be negative (got {value})"
            )));
        }
        let mut current = self.current.lock();
        if value <= *current {
            return Ok(false);
        }
        self.store.store(value)?;
        debug!(target: "dataman::watermark", from = *current, to = value, "watermark raised");
        *current = value;
        Ok(true)
    }

    /// Forgets the watermark. The next scan starts from scratch.
    pub fn reset(&self) -> Result<()> {
        let mut current = self.current.lock();
        self.store.clear()?;
        *current = UNSET_WATERMARK;
        info!(target: "dataman::watermark", "watermark reset");
        Ok(())
    }
}
