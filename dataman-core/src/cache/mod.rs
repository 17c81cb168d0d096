//! Bounded LRU of parsed dataset metadata, kept current by directory change
//! batches, with asynchronous listener notification.
//!
//! Every read of a dataset file happens under a shared [`KeyedLock`] on the
//! dataset identifier and every header rewrite under an exclusive one, so a
//! refresh triggered by the change source can never observe a half-written
//! file produced by [`DatasetCache::update`]. Entries are published before
//! that hold is released: the cached snapshot of a dataset only changes
//! while its key is locked.

mod events;
pub mod metadata;
pub mod naming;
mod source;

use std::{fmt, num::NonZeroUsize, path::Path, sync::Arc};

use chrono::NaiveDate;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace};

pub use events::{DatasetEvent, DatasetEventKind, DatasetListener, ListenerId};
pub use metadata::{
    DatasetLabel, DatasetMetadata, DatasetPatch, FieldChange, QaState,
};
pub use source::{ChangeSource, ChangedFile, DirectoryChange, MetadataExtractor};

use crate::{
    config::CacheConfig,
    error::{DatamanError, Result},
    lock::{KeyedLock, LockMode},
    watermark::WatermarkStore,
};

use events::ListenerRegistry;

/// A published cache value. Replaced, never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub identifier: String,
    pub metadata: Arc<DatasetMetadata>,
    pub last_modified: i64,
}

pub struct DatasetCache {
    config: CacheConfig,
    extractor: Arc<dyn MetadataExtractor>,
    locks: KeyedLock,
    watermark: Arc<WatermarkStore>,
    entries: Mutex<LruCache<String, CacheEntry>>,
    // Last label seen per identifier; outlives eviction so deletions can
    // still be reported by label. Bounded by `label_capacity`.
    labels: Mutex<LruCache<String, DatasetLabel>>,
    listeners: ListenerRegistry,
    change_source: RwLock<Option<Arc<dyn ChangeSource>>>,
}

impl fmt::Debug for DatasetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.try_lock().map(|entries| entries.len());
        f.debug_struct("DatasetCache")
            .field("directory", &self.config.directory)
            .field("capacity", &self.config.capacity)
            .field("entries", &entries)
            .field("listeners", &self.listeners)
            .field("watermark", &self.watermark)
            .field(
                "change_source_attached",
                &self.change_source.read().is_some(),
            )
            .finish()
    }
}

impl DatasetCache {
    pub fn new(
        config: CacheConfig,
        extractor: Arc<dyn MetadataExtractor>,
        locks: KeyedLock,
        watermark: Arc<WatermarkStore>,
    ) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.capacity).ok_or_else(|| {
            DatamanError::Contract("cache capacity must be non-zero".into())
        })?;
        let label_capacity = capacity.max(
            NonZeroUsize::new(config.label_capacity).unwrap_or(capacity),
        );
        Ok(Self {
            config,
            extractor,
            locks,
            watermark,
            entries: Mutex::new(LruCache::new(capacity)),
            labels: Mutex::new(LruCache::new(label_capacity)),
            listeners: ListenerRegistry::new(),
            change_source: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn watermark(&self) -> &WatermarkStore {
        &self.watermark
    }

    /// Returns the metadata for `identifier`, parsing the file on a miss.
    ///
    /// `Ok(None)` means the file does not exist. Nothing is cached when
    /// parsing fails.
    pub async fn fetch(
        &self,
        identifier: &str,
    ) -> Result<Option<Arc<DatasetMetadata>>> {
        let hit = self
            .entries
            .lock()
            .get(identifier)
            .map(|entry| Arc::clone(&entry.metadata));
        if let Some(metadata) = hit {
            trace!(target: "dataman::cache", file = %identifier, "cache hit");
            return Ok(Some(metadata));
        }

        let path = self.config.directory.join(identifier);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }

        let metadata = self.load(identifier, &path).await?;
        Ok(Some(metadata))
    }

    /// Writes the fields of `patch` that differ from the current snapshot.
    ///
    /// The whole read, compare, write and publish sequence runs under one
    /// exclusive hold of the dataset's lock, so concurrent updates of the
    /// same dataset each start from the previous one's result.
    ///
    /// Returns `Ok(None)` for an unknown dataset. A patch that changes
    /// nothing performs no writes and returns the current snapshot.
    pub async fn update(
        &self,
        identifier: &str,
        patch: &DatasetPatch,
    ) -> Result<Option<Arc<DatasetMetadata>>> {
        let outcome = self
            .locks
            .with_lock(
                identifier,
                LockMode::Exclusive,
                self.update_locked(identifier, patch),
            )
            .await?;

        match outcome {
            Some((merged, true)) => {
                self.expect_updates(&[identifier.to_owned()]);
                Ok(Some(merged))
            }
            Some((current, false)) => Ok(Some(current)),
            None => Ok(None),
        }
    }

    pub async fn update_qa_state(
        &self,
        identifier: &str,
        qa_state: QaState,
    ) -> Result<Option<Arc<DatasetMetadata>>> {
        self.update(identifier, &DatasetPatch::qa_state(qa_state))
            .await
    }

    pub async fn update_release(
        &self,
        identifier: &str,
        release: NaiveDate,
        header_private: Option<bool>,
    ) -> Result<Option<Arc<DatasetMetadata>>> {
        self.update(identifier, &DatasetPatch::release(release, header_private))
            .await
    }

    /// Applies one batch from the change source.
    ///
    /// Per-file failures are logged and reported to listeners; the only
    /// error returned is a failure to persist the watermark.
    pub async fn on_directory_changed(
        &self,
        change: DirectoryChange,
    ) -> Result<()> {
        let threshold = self
            .watermark
            .get()
            .saturating_sub(self.config.grace_period_ms);

        let predicted = naming::predict_next(
            change.new_files.iter().filter_map(ChangedFile::file_name),
            self.config.lookahead,
        );
        if !predicted.is_empty() {
            self.expect_updates(&predicted);
        }

        for file in &change.new_files {
            if file.last_modified < threshold {
                debug!(
                    target: "dataman::cache",
                    file = %file.path.display(),
                    last_modified = file.last_modified,
                    threshold,
                    "ignoring stale new file"
                );
                continue;
            }
            self.refresh(&file.path, DatasetEventKind::Added).await;
        }
        for file in &change.modified_files {
            self.refresh(&file.path, DatasetEventKind::Modified).await;
        }
        for path in &change.deleted_files {
            self.forget(path).await;
        }

        self.watermark.raise_to(change.as_of)?;
        Ok(())
    }

    /// Catches up on files changed while the process was down, then
    /// remembers `source` for later update hints.
    pub async fn attach_change_source(
        &self,
        source: Arc<dyn ChangeSource>,
        last_modified: i64,
    ) -> Result<()> {
        let since = self.watermark.get();
        if self.watermark.is_set() && since < last_modified {
            info!(
                target: "dataman::cache",
                since,
                until = last_modified,
                "recovering changes since last run"
            );
            let lookup = Arc::clone(&source);
            let changed = tokio::task::spawn_blocking(move || {
                lookup.modified_between(since, last_modified)
            })
            .await
            .map_err(blocking_failed)??;
            for file in &changed {
                self.refresh(&file.path, DatasetEventKind::Modified).await;
            }
        }

        self.watermark.raise_to(last_modified)?;
        *self.change_source.write() = Some(source);
        Ok(())
    }

    pub fn add_listener(
        &self,
        listener: Arc<dyn DatasetListener>,
    ) -> Result<ListenerId> {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `identifier` is cached. Does not count as a use.
    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.lock().contains(identifier)
    }

    /// The cached entry for `identifier` without touching recency.
    pub fn peek(&self, identifier: &str) -> Option<CacheEntry> {
        self.entries.lock().peek(identifier).cloned()
    }

    // Caller holds the exclusive lock for `identifier`. The flag tells
    // whether anything was written.
    async fn update_locked(
        &self,
        identifier: &str,
        patch: &DatasetPatch,
    ) -> Result<Option<(Arc<DatasetMetadata>, bool)>> {
        let cached = self
            .entries
            .lock()
            .get(identifier)
            .map(|entry| Arc::clone(&entry.metadata));
        let current = match cached {
            Some(current) => current,
            None => {
                let path = self.config.directory.join(identifier);
                if !tokio::fs::try_exists(&path).await? {
                    return Ok(None);
                }
                let parsed = Arc::new(self.parse(&path).await?);
                self.publish(identifier, Arc::clone(&parsed));
                parsed
            }
        };

        let changes = patch.changes(&current);
        if changes.is_empty() {
            debug!(target: "dataman::cache", file = %identifier, "update is a no-op");
            return Ok(Some((current, false)));
        }

        info!(
            target: "dataman::cache",
            file = %identifier,
            label = %current.label,
            ?changes,
            "updating dataset headers"
        );
        let extractor = Arc::clone(&self.extractor);
        let path = current.file.clone();
        tokio::task::spawn_blocking(move || extractor.write_fields(&path, &changes))
            .await
            .map_err(blocking_failed)??;

        let merged = Arc::new(current.apply(patch));
        self.publish(identifier, Arc::clone(&merged));
        Ok(Some((merged, true)))
    }

    /// Parses `path` under a shared hold and publishes the result before
    /// the hold ends. A malformed file evicts any stale entry.
    async fn load(
        &self,
        identifier: &str,
        path: &Path,
    ) -> Result<Arc<DatasetMetadata>> {
        self.locks
            .with_lock(identifier, LockMode::Shared, async {
                match self.parse(path).await {
                    Ok(metadata) => {
                        let metadata = Arc::new(metadata);
                        self.publish(identifier, Arc::clone(&metadata));
                        Ok(metadata)
                    }
                    Err(err) => {
                        if err.is_malformed() {
                            self.entries.lock().pop(identifier);
                        }
                        Err(err)
                    }
                }
            })
            .await
    }

    async fn parse(&self, path: &Path) -> Result<DatasetMetadata> {
        let extractor = Arc::clone(&self.extractor);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || extractor.parse(&path))
            .await
            .map_err(blocking_failed)?
    }

    fn publish(&self, identifier: &str, metadata: Arc<DatasetMetadata>) {
        self.labels
            .lock()
            .push(identifier.to_owned(), metadata.label.clone());

        let entry = CacheEntry {
            identifier: identifier.to_owned(),
            last_modified: metadata.last_modified,
            metadata,
        };
        let displaced = self.entries.lock().push(identifier.to_owned(), entry);
        if let Some((evicted, _)) = displaced
            && evicted != identifier
        {
            trace!(target: "dataman::cache", file = %evicted, "evicted");
        }
    }

    async fn refresh(&self, path: &Path, kind: DatasetEventKind) {
        let Some(identifier) = file_name(path) else {
            debug!(target: "dataman::cache", path = %path.display(), "path has no file name");
            return;
        };
        if !self.config.accepts(identifier) {
            trace!(target: "dataman::cache", file = %identifier, "extension not accepted");
            return;
        }

        match self.load(identifier, path).await {
            Ok(metadata) => {
                self.listeners.fire(kind, DatasetEvent::parsed(metadata));
            }
            Err(err) if err.is_malformed() => {
                info!(
                    target: "dataman::cache",
                    file = %identifier,
                    error = %err,
                    "bad dataset"
                );
                let label = self.labels.lock().peek(identifier).cloned();
                self.listeners.fire(
                    DatasetEventKind::Modified,
                    DatasetEvent::bad_dataset(path, label, err.to_string()),
                );
            }
            Err(err) => {
                error!(
                    target: "dataman::cache",
                    file = %identifier,
                    error = %err,
                    "failed to refresh dataset"
                );
            }
        }
    }

    async fn forget(&self, path: &Path) {
        let Some(identifier) = file_name(path) else {
            return;
        };
        if !self.config.accepts(identifier) {
            return;
        }

        let guard = self.locks.acquire(identifier, LockMode::Exclusive).await;
        self.entries.lock().pop(identifier);
        let label = self.labels.lock().pop(identifier);
        if let Err(err) = guard.release() {
            error!(target: "dataman::cache", file = %identifier, error = %err, "failed to release dataset lock");
        }
        match label {
            Some(label) => {
                debug!(target: "dataman::cache", file = %identifier, %label, "dataset deleted");
                self.listeners.fire(
                    DatasetEventKind::Deleted,
                    DatasetEvent::deleted(path, Some(label)),
                );
            }
            None => {
                trace!(target: "dataman::cache", file = %identifier, "unknown file deleted");
            }
        }
    }

    fn expect_updates(&self, file_names: &[String]) {
        let source = self.change_source.read().clone();
        let Some(source) = source else {
            return;
        };
        if let Err(err) = source.expect_updates(file_names) {
            debug!(
                target: "dataman::cache",
                error = %err,
                files = ?file_names,
                "change source rejected update hint"
            );
        }
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn blocking_failed(err: tokio::task::JoinError) -> DatamanError {
    DatamanError::Internal(format!("blocking metadata task failed: {err}"))
}
