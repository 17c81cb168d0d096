use std::path::{Path, PathBuf};

use crate::error::Result;

use super::metadata::{DatasetMetadata, FieldChange};

/// Reads and rewrites dataset headers. Calls are synchronous and may be
/// slow; the cache runs them on the blocking pool and never retries.
pub trait MetadataExtractor: Send + Sync {
    /// Fails with [`DatamanError::Malformed`](crate::error::DatamanError::Malformed)
    /// when the file exists but cannot be understood.
    fn parse(&self, path: &Path) -> Result<DatasetMetadata>;

    /// Persists exactly `changes` to the file at `path`.
    fn write_fields(&self, path: &Path, changes: &[FieldChange]) -> Result<()>;
}

/// The directory monitor feeding change batches into the cache.
pub trait ChangeSource: Send + Sync {
    /// Hint that the named files are about to change. Best-effort.
    fn expect_updates(&self, file_names: &[String]) -> Result<()>;

    /// Files modified in `(since, until]`, used to catch up after a restart.
    fn modified_between(&self, since: i64, until: i64)
    -> Result<Vec<ChangedFile>>;
}

/// A file reported by the change source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangedFile {
    pub path: PathBuf,
    /// Modification time, milliseconds since the epoch.
    pub last_modified: i64,
}

impl ChangedFile {
    pub fn new(path: impl Into<PathBuf>, last_modified: i64) -> Self {
        Self {
            path: path.into(),
            last_modified,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }
}

/// One batch of directory changes.
///
/// Within a batch a file appears at most once per list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryChange {
    pub new_files: Vec<ChangedFile>,
    pub modified_files: Vec<ChangedFile>,
    pub deleted_files: Vec<PathBuf>,
    /// Latest modification time covered by this batch.
    pub as_of: i64,
}

impl DirectoryChange {
    pub fn new(as_of: i64) -> Self {
        Self {
            as_of,
            ..Self::default()
        }
    }

    pub fn with_new(mut self, file: ChangedFile) -> Self {
        self.new_files.push(file);
        self
    }

    pub fn with_modified(mut self, file: ChangedFile) -> Self {
        self.modified_files.push(file);
        self
    }

    pub fn with_deleted(mut self, path: impl Into<PathBuf>) -> Self {
        self.deleted_files.push(path.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty()
            && self.modified_files.is_empty()
            && self.deleted_files.is_empty()
    }
}
