use crate::sizes::SECTOR_SIZE;

// Pages and sectors share a size so a page can be swapped with a single
// sector-aligned transfer.
pub const PAGE_SIZE: usize = SECTOR_SIZE;
pub const NUM_PHYS_PAGES: usize = 32;

/// Entries in the fully associative translation cache.
pub const TLB_SIZE: usize = 4;

/// Bytes reserved above the executable's image for the user stack.
pub const USER_STACK_SIZE: usize = 2048;
