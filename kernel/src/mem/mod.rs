//! Demand-paged virtual memory.
//!
//! User addresses go through a small TLB in front of per-process page tables.
//! Physical frames are handed out through the coremap, which remembers which
//! page of which address space each one holds so a frame can be reclaimed
//! from any process when memory runs out. Evicted dirty pages go to the
//! owning process's swap file.

pub mod address_space;
pub mod coremap;
pub mod machine;
pub mod page_replacement;
pub mod virtual_memory;

pub use address_space::{AddressSpace, SpaceId};
pub use coremap::{CoreMapEntry, Coremap};
pub use machine::{Fault, Machine, TranslationEntry};
pub use page_replacement::{FrameUsage, ReplacementPolicy};
pub use virtual_memory::{VirtualMemory, VmStats};

use crate::fs;
use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VmError {
    /// bad magic number, or a segment reaching past the end of the image
    InvalidExecutable,
    AddressOutOfRange { vaddr: usize },
    /// no free frame and nothing may be evicted
    OutOfFrames,
    /// the swap file could not be given its full size
    SwapFull,
    /// write to a page holding only code
    ReadOnly { vaddr: usize },
    NoCurrentSpace,
    UnknownSpace(SpaceId),
    Fs(fs::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VmError::InvalidExecutable => write!(f, "not a valid executable"),
            VmError::AddressOutOfRange { vaddr } => {
                write!(f, "address {vaddr:#x} outside the address space")
            }
            VmError::OutOfFrames => write!(f, "out of physical frames"),
            VmError::SwapFull => write!(f, "no room for swap file"),
            VmError::ReadOnly { vaddr } => write!(f, "write to read-only address {vaddr:#x}"),
            VmError::NoCurrentSpace => write!(f, "no address space is running"),
            VmError::UnknownSpace(id) => write!(f, "no address space {id}"),
            VmError::Fs(err) => write!(f, "swap: {err}"),
        }
    }
}

impl core::error::Error for VmError {}

impl From<fs::Error> for VmError {
    fn from(value: fs::Error) -> Self {
        VmError::Fs(value)
    }
}
