use crate::sync::{mutex::TicketMutex, relax};

/// A counting semaphore.
pub struct Semaphore {
    value: TicketMutex<usize>,
}

impl Semaphore {
    pub const fn new(count: usize) -> Self {
        Self {
            value: TicketMutex::new(count),
        }
    }

    /// Waits until the count is positive, then decrements it.
    pub fn down(&self) {
        while !self.try_down() {
            relax();
        }
    }

    pub fn try_down(&self) -> bool {
        let mut value = self.value.lock();
        if *value == 0 {
            return false;
        }
        *value -= 1;
        true
    }

    pub fn up(&self) {
        *self.value.lock() += 1;
    }

    pub fn value(&self) -> usize {
        *self.value.lock()
    }
}
