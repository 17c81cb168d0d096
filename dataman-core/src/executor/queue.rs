use std::collections::VecDeque;

use parking_lot::Mutex;

use super::command::{Command, CommandKey};

struct QueueState {
    pending: VecDeque<Command>,
    drained: bool,
}

/// Commands waiting to run for one key.
///
/// Once `drained` is set the queue is finished: it accepts no more commands
/// and the submitter must start a fresh queue instead. Setting the flag and
/// observing an empty `pending` happen under the same lock, which is what
/// keeps a late submit from landing in a queue that nobody will drain.
pub(crate) struct CommandQueue {
    key: CommandKey,
    state: Mutex<QueueState>,
}

impl CommandQueue {
    pub(crate) fn new(first: Command) -> Self {
        let mut pending = VecDeque::with_capacity(4);
        let key = first.key().clone();
        pending.push_back(first);
        Self {
            key,
            state: Mutex::new(QueueState {
                pending,
                drained: false,
            }),
        }
    }

    pub(crate) fn key(&self) -> &CommandKey {
        &self.key
    }

    /// Appends `command`, or hands it back if this queue already drained.
    pub(crate) fn try_push(
        &self,
        command: Command,
    ) -> std::result::Result<(), Command> {
        let mut state = self.state.lock();
        if state.drained {
            return Err(command);
        }
        state.pending.push_back(command);
        Ok(())
    }

    /// Takes the next command, marking the queue drained when none is left.
    pub(crate) fn next(&self) -> Option<Command> {
        let mut state = self.state.lock();
        let next = state.pending.pop_front();
        if next.is_none() {
            state.drained = true;
        }
        next
    }

    /// Drops every pending command and marks the queue drained.
    pub(crate) fn abandon(&self) -> usize {
        let mut state = self.state.lock();
        state.drained = true;
        let dropped = state.pending.len();
        state.pending.clear();
        dropped
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.state.lock().drained
    }

    pub(crate) fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(key: &str) -> Command {
        Command::new(key, async { Ok(true) })
    }

    #[test]
    fn drained_queue_refuses_new_work() {
        let queue = CommandQueue::new(noop("A"));
        assert!(queue.try_push(noop("A")).is_ok());
        assert_eq!(queue.pending(), 2);

        assert!(queue.next().is_some());
        assert!(queue.next().is_some());
        assert!(!queue.is_drained());
        assert!(queue.next().is_none());
        assert!(queue.is_drained());

        let rejected = queue.try_push(noop("A"));
        assert!(rejected.is_err());
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn abandon_drops_pending() {
        let queue = CommandQueue::new(noop("A"));
        queue.try_push(noop("A")).expect("push");
        assert_eq!(queue.abandon(), 2);
        assert!(queue.is_drained());
        assert!(queue.next().is_none());
    }
}
