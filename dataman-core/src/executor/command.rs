use std::{borrow::Borrow, fmt, future::Future, pin::Pin};

use serde::{Deserialize, Serialize};

use crate::error::{DatamanError, Result};

/// Future produced by a command. `Ok(false)` is a non-fatal failure.
pub type CommandFuture =
    Pin<Box<dyn Future<Output = Result<bool>> + Send + 'static>>;

/// Opaque key grouping commands that must never run concurrently.
#[derive(
    Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CommandKey(String);

impl CommandKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CommandKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CommandKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for CommandKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A unit of work bound to a key. Consumed exactly once by the executor.
pub struct Command {
    key: CommandKey,
    run: CommandFuture,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Command {
    /// Wraps an async unit of work. The future is not polled until the
    /// executor reaches it in the key's queue.
    pub fn new<F>(key: impl Into<CommandKey>, run: F) -> Self
    where
        F: Future<Output = Result<bool>> + Send + 'static,
    {
        Self {
            key: key.into(),
            run: Box::pin(run),
        }
    }

    /// Wraps synchronous work, run on Tokio's blocking pool when its turn
    /// comes.
    pub fn blocking<F>(key: impl Into<CommandKey>, work: F) -> Self
    where
        F: FnOnce() -> Result<bool> + Send + 'static,
    {
        Self::new(key, async move {
            match tokio::task::spawn_blocking(work).await {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => Err(DatamanError::Internal(
                    "blocking command panicked".into(),
                )),
                Err(err) => Err(DatamanError::Cancelled(err.to_string())),
            }
        })
    }

    pub fn key(&self) -> &CommandKey {
        &self.key
    }

    pub(crate) fn into_parts(self) -> (CommandKey, CommandFuture) {
        (self.key, self.run)
    }
}
