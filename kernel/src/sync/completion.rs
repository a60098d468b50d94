//! One-shot completion signal.
//!
//! A [`Completion`] carries exactly one value from whoever resolves it to
//! whoever waits on it. Resolving never blocks, and a waiter that arrives late
//! still observes the value.

use crate::sync::{mutex::Mutex, semaphore::Semaphore};

pub struct Completion<T> {
    value: Mutex<Option<T>>,
    ready: Semaphore,
}

impl<T: Copy> Completion<T> {
    pub const fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Semaphore::new(0),
        }
    }

    /// Resolves the completion.
    ///
    /// # Panics
    ///
    /// Panics if the completion was already resolved.
    pub fn complete(&self, value: T) {
        let mut slot = self.value.lock();
        assert!(slot.is_none(), "completion resolved twice");
        *slot = Some(value);
        drop(slot);
        self.ready.up();
    }

    pub fn is_complete(&self) -> bool {
        self.value.lock().is_some()
    }

    /// Blocks until the completion is resolved and returns the value.
    pub fn wait(&self) -> T {
        self.ready.down();
        // Let any other waiter through as well.
        self.ready.up();
        match *self.value.lock() {
            Some(value) => value,
            None => unreachable!("completion signalled without a value"),
        }
    }
}

impl<T: Copy> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}
