//! Console command queue
//!
//! Commands may be queued from anywhere, including from inside a command
//! that is currently executing. The queue lock is held only while inserting
//! or popping, never while a command runs, so nested inserts land behind the
//! commands already waiting.

use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: Mutex<VecDeque<String>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: impl Into<String>) {
        self.pending.lock().push_back(command.into());
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Runs queued commands one at a time until the queue is empty
    pub fn drain<F>(&self, mut execute: F) -> usize
    where
        F: FnMut(&str, &CommandQueue),
    {
        let mut executed = 0;
        loop {
            let next = self.pending.lock().pop_front();
            match next {
                Some(command) => {
                    execute(&command, self);
                    executed += 1;
                }
                None => return executed,
            }
        }
    }
}
