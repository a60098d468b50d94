//! Blocking primitives shared by the file system and the virtual memory manager.
//!
//! Every wait in this module is a busy wait that gives up the processor
//! between polls, so cooperative threads holding the resource can run.

pub mod completion;
pub mod mutex;
pub mod semaphore;

/// Gives up the processor for one polling round.
#[inline(always)]
pub(crate) fn relax() {
    #[cfg(not(target_os = "none"))]
    std::thread::yield_now();
    #[cfg(target_os = "none")]
    core::hint::spin_loop();
}
