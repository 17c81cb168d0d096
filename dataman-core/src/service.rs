//! Wiring of the coordination components for one process.

use std::{fmt, sync::Arc};

use tracing::info;

use crate::{
    cache::{ChangeSource, DatasetCache, DatasetPatch, MetadataExtractor},
    config::DatamanConfig,
    error::Result,
    executor::{Command, SerialCommandExecutor},
    lock::KeyedLock,
    watermark::{FileStateStore, StateStore, WatermarkStore},
};

/// The lock table, executor, watermark and cache built from one
/// [`DatamanConfig`]. All parts share the same [`KeyedLock`].
pub struct DatasetServices {
    config: DatamanConfig,
    locks: KeyedLock,
    executor: SerialCommandExecutor,
    watermark: Arc<WatermarkStore>,
    cache: Arc<DatasetCache>,
}

impl fmt::Debug for DatasetServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetServices")
            .field("locks", &self.locks)
            .field("executor", &self.executor)
            .field("cache", &self.cache)
            .finish()
    }
}

impl DatasetServices {
    pub fn new(
        config: DatamanConfig,
        extractor: Arc<dyn MetadataExtractor>,
    ) -> Result<Self> {
        config.validate()?;

        let watermark = Arc::new(match &config.watermark.path {
            Some(path) => {
                let store: Arc<dyn StateStore> =
                    Arc::new(FileStateStore::new(path));
                WatermarkStore::open(store)?
            }
            None => WatermarkStore::in_memory(),
        });
        let locks = KeyedLock::new();
        let executor = SerialCommandExecutor::new(config.executor.clone());
        let cache = Arc::new(DatasetCache::new(
            config.cache.clone(),
            extractor,
            locks.clone(),
            Arc::clone(&watermark),
        )?);

        Ok(Self {
            config,
            locks,
            executor,
            watermark,
            cache,
        })
    }

    /// Starts the executor. Must run inside a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.executor.start()?;
        info!(
            target: "dataman::executor",
            directory = %self.config.cache.directory.display(),
            watermark = self.watermark.get(),
            "dataset services started"
        );
        Ok(())
    }

    pub fn stop(&self) {
        self.executor.stop();
    }

    /// Recovers missed changes and hooks up the directory monitor.
    pub async fn attach_change_source(
        &self,
        source: Arc<dyn ChangeSource>,
        last_modified: i64,
    ) -> Result<()> {
        self.cache.attach_change_source(source, last_modified).await
    }

    /// Queues a header update for `identifier` behind any other command
    /// for the same dataset. Returns `false` if the executor is stopped.
    pub fn submit_update(&self, identifier: &str, patch: DatasetPatch) -> bool {
        let cache = Arc::clone(&self.cache);
        let owned = identifier.to_owned();
        self.executor.submit(Command::new(identifier, async move {
            let updated = cache.update(&owned, &patch).await?;
            Ok(updated.is_some())
        }))
    }

    pub fn config(&self) -> &DatamanConfig {
        &self.config
    }

    pub fn locks(&self) -> &KeyedLock {
        &self.locks
    }

    pub fn executor(&self) -> &SerialCommandExecutor {
        &self.executor
    }

    pub fn watermark(&self) -> &WatermarkStore {
        &self.watermark
    }

    pub fn cache(&self) -> &Arc<DatasetCache> {
        &self.cache
    }
}
