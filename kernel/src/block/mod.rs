pub mod block_core;
pub mod block_error;

pub use block_core::{BlockDevice, BlockSector, MemDisk, SynchDisk};
pub use block_error::BlockError;
