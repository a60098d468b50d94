use super::block_error::BlockError;
use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, vec, vec::Vec};
use core::fmt;
use sectoros_shared::sizes::SECTOR_SIZE;

/// Index of a disk sector.
pub type BlockSector = u32;

/// Lower-level interface to a sector-addressed device.
///
/// Implementations may assume the sector is in range and the buffer is exactly
/// [`SECTOR_SIZE`] bytes; [`SynchDisk`] checks both before delegating.
pub trait BlockDevice: Send {
    /// Read a sector
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]);
    /// Write a sector
    fn write(&mut self, sector: BlockSector, buf: &[u8]);
    /// Device size in sectors
    fn num_sectors(&self) -> BlockSector;
}

/// A RAM-backed disk.
pub struct MemDisk {
    data: Vec<u8>,
}

impl MemDisk {
    /// A zero-filled disk of `num_sectors` sectors.
    pub fn new(num_sectors: usize) -> Self {
        Self {
            data: vec![0; num_sectors * SECTOR_SIZE],
        }
    }

    /// Wraps a raw disk image.
    pub fn from_image(image: Vec<u8>) -> Result<Self, BlockError> {
        if image.is_empty() || image.len() % SECTOR_SIZE != 0 {
            return Err(BlockError::ImageInvalid);
        }
        Ok(Self { data: image })
    }

    pub fn into_image(self) -> Vec<u8> {
        self.data
    }

    fn range(sector: BlockSector) -> core::ops::Range<usize> {
        let start = sector as usize * SECTOR_SIZE;
        start..start + SECTOR_SIZE
    }
}

impl BlockDevice for MemDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) {
        buf.copy_from_slice(&self.data[Self::range(sector)]);
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) {
        self.data[Self::range(sector)].copy_from_slice(buf);
    }

    fn num_sectors(&self) -> BlockSector {
        (self.data.len() / SECTOR_SIZE) as BlockSector
    }
}

struct DiskState {
    device: Box<dyn BlockDevice>,
    read_count: u32,
    write_count: u32,
}

/// A disk that serves one request at a time.
///
/// All file system traffic goes through here; concurrent callers queue on the
/// device lock in arrival order.
pub struct SynchDisk {
    state: Mutex<DiskState>,
    num_sectors: BlockSector,
}

impl SynchDisk {
    pub fn new(device: impl BlockDevice + 'static) -> Self {
        let num_sectors = device.num_sectors();
        Self {
            state: Mutex::new(DiskState {
                device: Box::new(device),
                read_count: 0,
                write_count: 0,
            }),
            num_sectors,
        }
    }

    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        Ok(())
    }

    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.num_sectors {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(())
    }

    /// Reads `sector` into `buf`, which must be exactly one sector long.
    pub fn read_sector(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        let mut state = self.state.lock();
        state.device.read(sector, buf);
        state.read_count += 1;
        Ok(())
    }

    /// Writes `buf`, which must be exactly one sector long, to `sector`.
    pub fn write_sector(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        let mut state = self.state.lock();
        state.device.write(sector, buf);
        state.write_count += 1;
        Ok(())
    }

    pub fn num_sectors(&self) -> BlockSector {
        self.num_sectors
    }

    /// Copies the whole device into a raw image.
    pub fn dump(&self) -> Result<Vec<u8>, BlockError> {
        let mut image = vec![0; self.num_sectors as usize * SECTOR_SIZE];
        for (sector, chunk) in image.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.read_sector(sector as BlockSector, chunk)?;
        }
        Ok(image)
    }

    /// Returns `(reads, writes)` served so far.
    pub fn stats(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.read_count, state.write_count)
    }
}

impl fmt::Display for SynchDisk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (reads, writes) = self.stats();
        write!(
            f,
            "disk: {:04} sectors, {:04} read, {:04} write",
            self.num_sectors, reads, writes
        )
    }
}
