//! A FIFO ticket lock.
//!
//! Each contender draws a ticket and waits until the lock serves that ticket,
//! so threads acquire the lock in the order they asked for it. Waiters relax
//! the processor between polls instead of spinning hot.

use crate::sync::relax;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
};

pub struct TicketMutex<T: ?Sized> {
    next_ticket: AtomicUsize,
    now_serving: AtomicUsize,
    data: UnsafeCell<T>,
}

pub struct TicketMutexGuard<'a, T: ?Sized + 'a> {
    now_serving: &'a AtomicUsize,
    ticket: usize,
    data: &'a mut T,
}

unsafe impl<T: ?Sized + Send> Sync for TicketMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for TicketMutex<T> {}

unsafe impl<T: ?Sized + Sync> Sync for TicketMutexGuard<'_, T> {}

impl<T> TicketMutex<T> {
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicUsize::new(0),
            now_serving: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    #[inline(always)]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> TicketMutex<T> {
    pub fn lock(&self) -> TicketMutexGuard<T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        while self.now_serving.load(Ordering::Acquire) != ticket {
            relax();
        }

        TicketMutexGuard {
            now_serving: &self.now_serving,
            ticket,
            // SAFETY: Only the holder of the served ticket reaches this point.
            data: unsafe { &mut *self.data.get() },
        }
    }

    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        let ticket = self.next_ticket.load(Ordering::Relaxed);
        self.now_serving.load(Ordering::Relaxed) != ticket
    }

    /// Takes the lock only if nobody holds it or is queued for it.
    pub fn try_lock(&self) -> Option<TicketMutexGuard<T>> {
        let serving = self.now_serving.load(Ordering::Acquire);
        self.next_ticket
            .compare_exchange(serving, serving + 1, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|ticket| TicketMutexGuard {
                now_serving: &self.now_serving,
                ticket,
                // SAFETY: The ticket drawn is the one being served.
                data: unsafe { &mut *self.data.get() },
            })
    }

    #[inline(always)]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<'a, T: ?Sized> Deref for TicketMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<'a, T: ?Sized> DerefMut for TicketMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<'a, T: ?Sized> Drop for TicketMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.now_serving.store(self.ticket + 1, Ordering::Release);
    }
}
