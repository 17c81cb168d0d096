//! In-process reader/writer locks scoped to string keys.
//!
//! OS-level file locks only keep *other processes* out. Inside one process a
//! cache refresh can still race a header rewrite of the same file, so every
//! path that touches a dataset file goes through a [`KeyedLock`] first.
//!
//! Entries are reference counted: a key lives in the table only while some
//! caller holds or is waiting for its lock, and it is removed under the table
//! mutex the moment the last reference goes away. The underlying lock is
//! Tokio's [`RwLock`], whose FIFO fairness keeps a steady stream of shared
//! holders from starving an exclusive one.

use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{error, trace};

use crate::error::{DatamanError, Result};

/// How a keyed lock is held.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Any number of shared holders may coexist.
    Shared,
    /// Excludes every other holder of the same key.
    Exclusive,
}

struct LockEntry {
    refcount: usize,
    lock: Arc<RwLock<()>>,
}

#[derive(Default)]
struct LockTable {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl LockTable {
    fn retain(&self, key: &str) -> Arc<RwLock<()>> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_owned()).or_insert_with(|| LockEntry {
            refcount: 0,
            lock: Arc::new(RwLock::new(())),
        });
        entry.refcount += 1;
        Arc::clone(&entry.lock)
    }

    fn release(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.refcount > 0 => {
                entry.refcount -= 1;
                if entry.refcount == 0 {
                    entries.remove(key);
                }
                Ok(())
            }
            _ => Err(DatamanError::Contract(format!(
                "keyed lock reference count underflow for {key}"
            ))),
        }
    }
}

/// Process-wide table of reference-counted reader/writer locks.
///
/// Cloning is cheap and every clone shares the same table.
#[derive(Clone, Default)]
pub struct KeyedLock {
    table: Arc<LockTable>,
}

impl fmt::Debug for KeyedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("KeyedLock");
        match self.table.entries.try_lock() {
            Some(entries) => debug.field("keys", &entries.len()),
            None => debug.field("keys", &"<locked>"),
        };
        debug.finish()
    }
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the lock for `key` is held in `mode`.
    ///
    /// The key's reference is taken before waiting. If the returned future is
    /// dropped before the lock is obtained the reference is given back, so a
    /// cancelled acquisition never leaves the table unbalanced.
    pub async fn acquire(
        &self,
        key: impl Into<String>,
        mode: LockMode,
    ) -> KeyedLockGuard {
        let key = key.into();
        let lock = self.table.retain(&key);
        let reference = LockRef {
            table: Arc::clone(&self.table),
            key,
            released: false,
        };

        let held = match mode {
            LockMode::Shared => HeldLock::Shared(lock.read_owned().await),
            LockMode::Exclusive => HeldLock::Exclusive(lock.write_owned().await),
        };
        trace!(target: "dataman::lock", key = %reference.key, ?mode, "acquired");

        KeyedLockGuard {
            held: Some(held),
            reference,
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub async fn acquire_timeout(
        &self,
        key: impl Into<String>,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<KeyedLockGuard> {
        let key = key.into();
        match tokio::time::timeout(timeout, self.acquire(key.clone(), mode))
            .await
        {
            Ok(guard) => Ok(guard),
            Err(_) => Err(DatamanError::Cancelled(format!(
                "timed out after {timeout:?} waiting for {mode:?} lock on {key}"
            ))),
        }
    }

    /// Runs `work` while holding the lock for `key`.
    ///
    /// The lock is released on every exit path, including when `work`
    /// returns an error or panics. A failed release is reported only when
    /// `work` succeeded; otherwise it is logged and the work's error wins.
    pub async fn with_lock<F, T>(
        &self,
        key: impl Into<String>,
        mode: LockMode,
        work: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let guard = self.acquire(key, mode).await;
        let outcome = work.await;
        let key = guard.key().to_owned();
        settle(&key, outcome, guard.release())
    }

    /// Current number of holders and waiters for `key`.
    pub fn refcount(&self, key: &str) -> usize {
        self.table
            .entries
            .lock()
            .get(key)
            .map_or(0, |entry| entry.refcount)
    }

    /// Number of keys with at least one holder or waiter.
    pub fn len(&self) -> usize {
        self.table.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn settle<T>(key: &str, outcome: Result<T>, released: Result<()>) -> Result<T> {
    match (outcome, released) {
        (outcome, Ok(())) => outcome,
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(work_err), Err(release_err)) => {
            error!(
                target: "dataman::lock",
                key = %key,
                error = %release_err,
                "failed to release keyed lock after failed work"
            );
            Err(work_err)
        }
    }
}

struct LockRef {
    table: Arc<LockTable>,
    key: String,
    released: bool,
}

impl LockRef {
    fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(DatamanError::Contract(format!(
                "keyed lock for {} released twice",
                self.key
            )));
        }
        self.released = true;
        self.table.release(&self.key)
    }
}

impl Drop for LockRef {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.release() {
            error!(target: "dataman::lock", key = %self.key, error = %err, "failed to release keyed lock");
        }
    }
}

enum HeldLock {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// A held keyed lock.
///
/// Dropping the guard releases it. [`release`](Self::release) does the same
/// but reports a reference-count underflow instead of only logging it.
#[must_use = "the keyed lock is released as soon as the guard is dropped"]
pub struct KeyedLockGuard {
    // Field order matters: the lock is released before the reference.
    held: Option<HeldLock>,
    reference: LockRef,
}

impl fmt::Debug for KeyedLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLockGuard")
            .field("key", &self.reference.key)
            .field("mode", &self.mode())
            .finish()
    }
}

impl KeyedLockGuard {
    pub fn key(&self) -> &str {
        &self.reference.key
    }

    pub fn mode(&self) -> Option<LockMode> {
        self.held.as_ref().map(|held| match held {
            HeldLock::Shared(_) => LockMode::Shared,
            HeldLock::Exclusive(_) => LockMode::Exclusive,
        })
    }

    /// Releases the lock, then drops this holder's reference to the key.
    pub fn release(mut self) -> Result<()> {
        drop(self.held.take());
        trace!(target: "dataman::lock", key = %self.reference.key, "released");
        self.reference.release()
    }
}
