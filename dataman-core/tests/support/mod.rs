//! Fakes shared by the dataman-core integration tests.
#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use dataman_core::{
    DatamanError, Result,
    cache::{
        ChangeSource, ChangedFile, DatasetCache, DatasetEvent, DatasetEventKind,
        DatasetLabel, DatasetListener, DatasetMetadata, FieldChange,
        MetadataExtractor, QaState,
    },
    config::CacheConfig,
    lock::KeyedLock,
    watermark::WatermarkStore,
};
use parking_lot::{Condvar, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Reads the dataset label from the first line of the file. A file whose
/// first line is `bad` is malformed.
#[derive(Debug, Default)]
pub struct FirstLineExtractor {
    pub parses: AtomicUsize,
    pub writes: Mutex<Vec<(PathBuf, Vec<FieldChange>)>>,
}

impl FirstLineExtractor {
    pub fn parse_count(&self) -> usize {
        self.parses.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }
}

impl MetadataExtractor for FirstLineExtractor {
    fn parse(&self, path: &Path) -> Result<DatasetMetadata> {
        self.parses.fetch_add(1, Ordering::SeqCst);
        let contents = std::fs::read_to_string(path)?;
        let label = contents.lines().next().unwrap_or_default().trim();
        if label.is_empty() || label == "bad" {
            return Err(DatamanError::Malformed(format!(
                "{} has no dataset label",
                path.display()
            )));
        }
        Ok(DatasetMetadata {
            label: DatasetLabel::from(label),
            file: path.to_path_buf(),
            qa_state: QaState::Undefined,
            release: None,
            header_private: false,
            last_modified: 0,
        })
    }

    fn write_fields(&self, path: &Path, changes: &[FieldChange]) -> Result<()> {
        self.writes
            .lock()
            .push((path.to_path_buf(), changes.to_vec()));
        Ok(())
    }
}

/// Remembers update hints and answers recovery queries from a fixed list.
#[derive(Debug, Default)]
pub struct ScriptedChangeSource {
    pub hints: Mutex<Vec<String>>,
    pub changed: Vec<ChangedFile>,
    pub queries: Mutex<Vec<(i64, i64)>>,
}

impl ChangeSource for ScriptedChangeSource {
    fn expect_updates(&self, file_names: &[String]) -> Result<()> {
        self.hints.lock().extend_from_slice(file_names);
        Ok(())
    }

    fn modified_between(
        &self,
        since: i64,
        until: i64,
    ) -> Result<Vec<ChangedFile>> {
        self.queries.lock().push((since, until));
        Ok(self
            .changed
            .iter()
            .filter(|file| file.last_modified > since && file.last_modified <= until)
            .cloned()
            .collect())
    }
}

#[derive(Clone, Debug)]
pub struct Delivered {
    pub kind: DatasetEventKind,
    pub event: DatasetEvent,
}

/// Forwards every event to a channel the test can await.
#[derive(Debug)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Delivered>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Delivered>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, kind: DatasetEventKind, event: &DatasetEvent) {
        let _ = self.tx.send(Delivered {
            kind,
            event: event.clone(),
        });
    }
}

impl DatasetListener for ChannelListener {
    fn dataset_added(&self, event: &DatasetEvent) {
        self.forward(DatasetEventKind::Added, event);
    }

    fn dataset_modified(&self, event: &DatasetEvent) {
        self.forward(DatasetEventKind::Modified, event);
    }

    fn dataset_deleted(&self, event: &DatasetEvent) {
        self.forward(DatasetEventKind::Deleted, event);
    }
}

/// A latch that stays closed until [`open`](Self::open) is called.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
}

/// Blocks its delivery thread on a [`Gate`] for every event.
#[derive(Debug, Default)]
pub struct GatedListener {
    pub gate: Gate,
    pub entered: AtomicUsize,
}

impl GatedListener {
    fn hold(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.gate.wait();
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

impl DatasetListener for GatedListener {
    fn dataset_added(&self, _event: &DatasetEvent) {
        self.hold();
    }

    fn dataset_modified(&self, _event: &DatasetEvent) {
        self.hold();
    }

    fn dataset_deleted(&self, _event: &DatasetEvent) {
        self.hold();
    }
}

/// Waits for the next delivered event.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Delivered>) -> Delivered {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within timeout")
        .expect("listener channel open")
}

/// Asserts nothing else is delivered within a short window.
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Delivered>) {
    let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err(), "unexpected event: {extra:?}");
}

pub struct CacheFixture {
    pub dir: TempDir,
    pub cache: DatasetCache,
    pub extractor: Arc<FirstLineExtractor>,
    pub watermark: Arc<WatermarkStore>,
    pub locks: KeyedLock,
}

impl CacheFixture {
    pub fn new(capacity: usize, grace_period_ms: i64) -> Self {
        Self::with_config(|config| {
            config.capacity = capacity;
            config.grace_period_ms = grace_period_ms;
        })
    }

    /// Builds a fixture rooted in a fresh temp directory after letting
    /// `tune` adjust the cache configuration.
    pub fn with_config(tune: impl FnOnce(&mut CacheConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let extractor = Arc::new(FirstLineExtractor::default());
        let watermark = Arc::new(WatermarkStore::in_memory());
        let locks = KeyedLock::new();
        let mut config = CacheConfig {
            directory: dir.path().to_path_buf(),
            ..CacheConfig::default()
        };
        tune(&mut config);
        let cache = DatasetCache::new(
            config,
            extractor.clone(),
            locks.clone(),
            Arc::clone(&watermark),
        )
        .expect("cache");
        Self {
            dir,
            cache,
            extractor,
            watermark,
            locks,
        }
    }

    /// Writes a dataset file whose label is `label` and returns its path.
    pub fn write(&self, name: &str, label: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("{label}\n")).expect("write dataset");
        path
    }
}
