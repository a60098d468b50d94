#![cfg_attr(target_os = "none", no_std)]

pub mod block;
pub mod config;
pub mod fs;
pub mod logger;
pub mod mem;
pub mod sync;
pub mod system;
pub mod user_program;

extern crate alloc;

pub use system::{BootError, Kernel, Pid, Syscall};
