use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::Result;

use super::metadata::{DatasetLabel, DatasetMetadata};

/// Payload delivered to listeners.
///
/// A successful parse carries `metadata`. A dataset that could not be parsed
/// is delivered through [`DatasetListener::dataset_modified`] with no
/// metadata and the failure in `message`.
#[derive(Clone, Debug)]
pub struct DatasetEvent {
    pub label: Option<DatasetLabel>,
    pub metadata: Option<Arc<DatasetMetadata>>,
    pub file: Option<PathBuf>,
    pub message: Option<String>,
}

impl DatasetEvent {
    pub fn parsed(metadata: Arc<DatasetMetadata>) -> Self {
        Self {
            label: Some(metadata.label.clone()),
            file: Some(metadata.file.clone()),
            metadata: Some(metadata),
            message: None,
        }
    }

    pub fn bad_dataset(
        file: &Path,
        label: Option<DatasetLabel>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            label,
            metadata: None,
            file: Some(file.to_path_buf()),
            message: Some(message.into()),
        }
    }

    pub fn deleted(file: &Path, label: Option<DatasetLabel>) -> Self {
        let name = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string());
        Self {
            label,
            metadata: None,
            file: Some(file.to_path_buf()),
            message: Some(format!("{name} deleted")),
        }
    }

    /// True for the parse-failure notification.
    pub fn is_bad_dataset(&self) -> bool {
        self.metadata.is_none() && self.message.is_some()
    }
}

/// Receives dataset lifecycle notifications.
///
/// Each listener is driven by its own thread, one event at a time, in the
/// order the cache produced them. A slow or panicking listener affects
/// nobody else.
pub trait DatasetListener: Send + Sync {
    fn dataset_added(&self, event: &DatasetEvent);
    fn dataset_modified(&self, event: &DatasetEvent);
    fn dataset_deleted(&self, event: &DatasetEvent);
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DatasetEventKind {
    Added,
    Modified,
    Deleted,
}

type Delivery = (DatasetEventKind, Arc<DatasetEvent>);

struct ListenerSlot {
    id: ListenerId,
    sender: mpsc::UnboundedSender<Delivery>,
}

/// Registered listeners and their delivery threads.
///
/// Removing a listener drops its sender; the thread finishes whatever is
/// already queued and exits.
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    slots: Mutex<Vec<ListenerSlot>>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(
        &self,
        listener: Arc<dyn DatasetListener>,
    ) -> Result<ListenerId> {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name(format!("dataman-{id}"))
            .spawn(move || deliver(id, listener, receiver))?;
        self.slots.lock().push(ListenerSlot { id, sender });
        debug!(target: "dataman::cache", %id, "listener registered");
        Ok(id)
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        let removed = slots.len() != before;
        if removed {
            debug!(target: "dataman::cache", %id, "listener removed");
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Queues `event` for every listener registered right now.
    pub(crate) fn fire(&self, kind: DatasetEventKind, event: DatasetEvent) {
        let event = Arc::new(event);
        let slots = self.slots.lock();
        for slot in slots.iter() {
            if slot.sender.send((kind, Arc::clone(&event))).is_err() {
                warn!(
                    target: "dataman::cache",
                    id = %slot.id,
                    "listener thread is gone, event dropped"
                );
            }
        }
    }
}

fn deliver(
    id: ListenerId,
    listener: Arc<dyn DatasetListener>,
    mut receiver: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some((kind, event)) = receiver.blocking_recv() {
        let outcome = catch_unwind(AssertUnwindSafe(|| match kind {
            DatasetEventKind::Added => listener.dataset_added(&event),
            DatasetEventKind::Modified => listener.dataset_modified(&event),
            DatasetEventKind::Deleted => listener.dataset_deleted(&event),
        }));
        if outcome.is_err() {
            error!(
                target: "dataman::cache",
                %id,
                ?kind,
                label = ?event.label,
                "listener panicked while handling event"
            );
        }
    }
    debug!(target: "dataman::cache", %id, "listener thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Recorder {
        tx: std::sync::mpsc::Sender<(DatasetEventKind, Option<String>)>,
        panic_on_added: bool,
    }

    impl Recorder {
        fn record(&self, kind: DatasetEventKind, event: &DatasetEvent) {
            let _ = self.tx.send((kind, event.message.clone()));
        }
    }

    impl DatasetListener for Recorder {
        fn dataset_added(&self, event: &DatasetEvent) {
            if self.panic_on_added {
                panic!("listener failure");
            }
            self.record(DatasetEventKind::Added, event);
        }

        fn dataset_modified(&self, event: &DatasetEvent) {
            self.record(DatasetEventKind::Modified, event);
        }

        fn dataset_deleted(&self, event: &DatasetEvent) {
            self.record(DatasetEventKind::Deleted, event);
        }
    }

    fn deleted(name: &str) -> DatasetEvent {
        DatasetEvent::deleted(Path::new(name), None)
    }

    #[test]
    fn events_arrive_in_order() {
        let registry = ListenerRegistry::new();
        let (tx, rx) = std::sync::mpsc::channel();
        registry
            .add(Arc::new(Recorder {
                tx,
                panic_on_added: false,
            }))
            .expect("add");

        for name in ["a.fits", "b.fits", "c.fits"] {
            registry.fire(DatasetEventKind::Deleted, deleted(name));
        }

        let received: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("event"))
            .map(|(_, message)| message.expect("message"))
            .collect();
        assert_eq!(
            received,
            vec!["a.fits deleted", "b.fits deleted", "c.fits deleted"]
        );
    }

    #[test]
    fn panicking_listener_keeps_receiving() {
        let registry = ListenerRegistry::new();
        let (tx, rx) = std::sync::mpsc::channel();
        registry
            .add(Arc::new(Recorder {
                tx,
                panic_on_added: true,
            }))
            .expect("add");

        let metadata = Arc::new(DatasetMetadata {
            label: DatasetLabel::from("GS-1"),
            file: PathBuf::from("a.fits"),
            qa_state: Default::default(),
            release: None,
            header_private: false,
            last_modified: 0,
        });
        registry.fire(DatasetEventKind::Added, DatasetEvent::parsed(metadata));
        registry.fire(DatasetEventKind::Deleted, deleted("a.fits"));

        let (kind, _) =
            rx.recv_timeout(Duration::from_secs(5)).expect("next event");
        assert_eq!(kind, DatasetEventKind::Deleted);
    }

    #[test]
    fn removed_listener_gets_nothing_new() {
        let registry = ListenerRegistry::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let id = registry
            .add(Arc::new(Recorder {
                tx,
                panic_on_added: false,
            }))
            .expect("add");
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert_eq!(registry.len(), 0);

        registry.fire(DatasetEventKind::Deleted, deleted("a.fits"));
        // The delivery thread drops the listener, and with it the sender,
        // once its channel closes.
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected)
        ));
    }
}
