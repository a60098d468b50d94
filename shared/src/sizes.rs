/// Bytes per disk sector. Every on-disk structure is laid out in units of this.
pub const SECTOR_SIZE: usize = 128;
/// Sectors on the simulated disk.
pub const NUM_SECTORS: usize = 1024;
