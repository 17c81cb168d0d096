//! Per-key serial command execution.
//!
//! Commands for different keys run in parallel on a bounded pool; commands
//! for the same key run one at a time, in the order they were submitted.
//! Each key with outstanding work owns a [`CommandQueue`] that a single
//! worker drains. When a queue runs dry the worker reports it to the
//! reclaimer, which drops it from the active table unless a newer queue has
//! already taken its place.

mod command;
mod queue;

pub use command::{Command, CommandFuture, CommandKey};

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::{
    runtime::Handle,
    sync::{Notify, Semaphore, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ExecutorConfig;
use crate::error::{DatamanError, Result};

use queue::CommandQueue;

/// Lifecycle and fault state of a [`SerialCommandExecutor`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutorHealth {
    Stopped,
    Running,
    /// The reclaimer stopped after an internal fault. Commands may still
    /// run, but drained queues are no longer reclaimed until a restart.
    Degraded(String),
}

struct Completion {
    queue: Arc<CommandQueue>,
}

/// Everything that only exists while the executor is running.
struct RunContext {
    shutdown: CancellationToken,
    permits: Arc<Semaphore>,
    completions: mpsc::UnboundedSender<Completion>,
    runtime: Handle,
    reclaimer: Mutex<Option<JoinHandle<()>>>,
}

struct ExecutorInner {
    config: ExecutorConfig,
    queues: Mutex<HashMap<CommandKey, Arc<CommandQueue>>>,
    lifecycle: RwLock<Option<Arc<RunContext>>>,
    degraded: Mutex<Option<String>>,
    idle: Notify,
}

impl ExecutorInner {
    /// Removes `queue` from the active table if it is still the one mapped
    /// to its key and it has drained.
    fn reclaim(&self, queue: &Arc<CommandQueue>) -> bool {
        let mut queues = self.queues.lock();
        let is_current = queues
            .get(queue.key())
            .is_some_and(|current| Arc::ptr_eq(current, queue));
        let removed = is_current && queue.is_drained();
        if removed {
            queues.remove(queue.key());
        }
        drop(queues);
        self.idle.notify_waiters();
        removed
    }

    fn abandon(&self, queue: &Arc<CommandQueue>) {
        let dropped = queue.abandon();
        if dropped > 0 {
            debug!(target: "dataman::executor", key = %queue.key(), dropped, "dropping queued commands");
        }
        self.reclaim(queue);
    }

    fn mark_degraded(&self, reason: String) {
        error!(target: "dataman::executor", reason = %reason, "executor degraded; restart required");
        *self.degraded.lock() = Some(reason);
    }
}

/// Runs commands in submission order per key, in parallel across keys.
///
/// Cloning yields another handle to the same executor.
#[derive(Clone)]
pub struct SerialCommandExecutor {
    inner: Arc<ExecutorInner>,
}

impl fmt::Debug for SerialCommandExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (active, pending) = self
            .inner
            .queues
            .try_lock()
            .map(|queues| {
                let pending: usize =
                    queues.values().map(|queue| queue.pending()).sum();
                (queues.len(), pending)
            })
            .unwrap_or_default();
        f.debug_struct("SerialCommandExecutor")
            .field("config", &self.inner.config)
            .field("health", &self.health())
            .field("active_queues", &active)
            .field("pending_commands", &pending)
            .finish()
    }
}

impl SerialCommandExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                config,
                queues: Mutex::new(HashMap::new()),
                lifecycle: RwLock::new(None),
                degraded: Mutex::new(None),
                idle: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Starts the worker pool and the reclaimer. Calling it again while
    /// running does nothing.
    ///
    /// Must be called from within a Tokio runtime; later submissions are
    /// scheduled on that runtime.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.write();
        if lifecycle.is_some() {
            return Ok(());
        }

        let runtime = Handle::try_current().map_err(|err| {
            DatamanError::Executor(format!(
                "executor must be started inside a Tokio runtime: {err}"
            ))
        })?;
        let workers = self.inner.config.workers.max(1);
        let (completions, completion_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let context = Arc::new(RunContext {
            shutdown: shutdown.clone(),
            permits: Arc::new(Semaphore::new(workers)),
            completions,
            runtime: runtime.clone(),
            reclaimer: Mutex::new(None),
        });

        let reclaimer = runtime.spawn(run_reclaimer(
            Arc::clone(&self.inner),
            shutdown,
            completion_rx,
        ));
        *context.reclaimer.lock() = Some(reclaimer);

        *self.inner.degraded.lock() = None;
        *lifecycle = Some(context);
        info!(target: "dataman::executor", workers, "serial command executor started");
        Ok(())
    }

    /// Stops the executor, cancelling in-flight and queued commands.
    ///
    /// Side effects of commands that already ran are kept. Ordering is not
    /// preserved across a stop/start cycle.
    pub fn stop(&self) {
        let Some(context) = self.inner.lifecycle.write().take() else {
            return;
        };

        context.shutdown.cancel();
        if let Some(reclaimer) = context.reclaimer.lock().take() {
            reclaimer.abort();
        }

        let queues: Vec<_> =
            self.inner.queues.lock().drain().map(|(_, q)| q).collect();
        let mut dropped = 0;
        for queue in &queues {
            dropped += queue.abandon();
        }

        *self.inner.degraded.lock() = None;
        self.inner.idle.notify_waiters();
        info!(target: "dataman::executor", queues = queues.len(), dropped, "serial command executor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.read().is_some()
    }

    pub fn health(&self) -> ExecutorHealth {
        if !self.is_running() {
            return ExecutorHealth::Stopped;
        }
        match self.inner.degraded.lock().clone() {
            Some(reason) => ExecutorHealth::Degraded(reason),
            None => ExecutorHealth::Running,
        }
    }

    /// Queues `command` behind any earlier command with the same key.
    ///
    /// Returns `false` and drops the command when the executor is not
    /// running. Callers must not assume delivery in that case.
    pub fn submit(&self, command: Command) -> bool {
        let lifecycle = self.inner.lifecycle.read();
        let Some(context) = lifecycle.as_ref() else {
            debug!(target: "dataman::executor", key = %command.key(), "executor not running; command dropped");
            return false;
        };

        let mut queues = self.inner.queues.lock();
        let command = match queues.get(command.key()) {
            Some(queue) => match queue.try_push(command) {
                Ok(()) => {
                    trace!(target: "dataman::executor", key = %queue.key(), "command appended");
                    return true;
                }
                // The old queue drained after its last command; replace it.
                Err(command) => command,
            },
            None => command,
        };

        let queue = Arc::new(CommandQueue::new(command));
        queues.insert(queue.key().clone(), Arc::clone(&queue));
        drop(queues);

        trace!(target: "dataman::executor", key = %queue.key(), "queue scheduled");
        context.runtime.spawn(drain_queue(
            Arc::clone(&self.inner),
            Arc::clone(context),
            queue,
        ));
        true
    }

    /// Whether `key` has an undrained queue right now. The answer can be
    /// stale as soon as it is returned.
    pub fn is_processing(&self, key: &str) -> bool {
        self.inner
            .queues
            .lock()
            .get(key)
            .is_some_and(|queue| !queue.is_drained())
    }

    /// Keys with undrained queues, sorted.
    pub fn active_keys(&self) -> Vec<CommandKey> {
        let mut keys: Vec<_> = self
            .inner
            .queues
            .lock()
            .values()
            .filter(|queue| !queue.is_drained())
            .map(|queue| queue.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Waits until `key` has no undrained queue, up to `timeout`. Returns
    /// whether the key went idle in time. Never cancels any work.
    pub async fn await_idle(&self, key: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_processing(key) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.is_processing(key);
            }
        }
    }

    /// Kills the reclaimer as an internal fault would.
    #[cfg(test)]
    pub(crate) fn kill_reclaimer(&self) {
        if let Some(context) = self.inner.lifecycle.read().as_ref()
            && let Some(reclaimer) = context.reclaimer.lock().take()
        {
            reclaimer.abort();
        }
    }
}

async fn drain_queue(
    inner: Arc<ExecutorInner>,
    context: Arc<RunContext>,
    queue: Arc<CommandQueue>,
) {
    let shutdown = context.shutdown.clone();
    let permit = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            inner.abandon(&queue);
            return;
        }
        permit = Arc::clone(&context.permits).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                inner.abandon(&queue);
                return;
            }
        },
    };

    while let Some(command) = queue.next() {
        let (key, run) = command.into_parts();
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(target: "dataman::executor", key = %key, "command interrupted by shutdown");
                inner.abandon(&queue);
                return;
            }
            outcome = AssertUnwindSafe(run).catch_unwind() => report(&key, outcome),
        }
    }
    drop(permit);

    inner.idle.notify_waiters();
    if context.completions.send(Completion { queue }).is_err()
        && !shutdown.is_cancelled()
    {
        inner.mark_degraded("completion channel closed".into());
    }
}

async fn run_reclaimer(
    inner: Arc<ExecutorInner>,
    shutdown: CancellationToken,
    mut completions: mpsc::UnboundedReceiver<Completion>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(target: "dataman::executor", "reclaimer shutting down");
                break;
            }
            completion = completions.recv() => match completion {
                Some(Completion { queue }) => {
                    if inner.reclaim(&queue) {
                        trace!(target: "dataman::executor", key = %queue.key(), "queue reclaimed");
                    }
                }
                None => {
                    inner.mark_degraded("completion channel closed under the reclaimer".into());
                    break;
                }
            },
        }
    }
}

fn report(
    key: &CommandKey,
    outcome: std::thread::Result<Result<bool>>,
) {
    match outcome {
        Ok(Ok(true)) => {
            trace!(target: "dataman::executor", key = %key, "command completed");
        }
        Ok(Ok(false)) => {
            warn!(target: "dataman::executor", key = %key, "command reported failure");
        }
        Ok(Err(err)) => {
            warn!(target: "dataman::executor", key = %key, error = %err, "command failed");
        }
        Err(panic) => {
            error!(target: "dataman::executor", key = %key, panic = %panic_message(panic.as_ref()), "command panicked");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic>"
    }
}
