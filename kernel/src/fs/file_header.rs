use super::{Bitmap, Error, Result, HEADER_CAPACITY, NUM_DIRECT};
use crate::block::{BlockSector, SynchDisk};
use alloc::vec::Vec;
use core::{fmt, mem::size_of};
use sectoros_shared::sizes::SECTOR_SIZE;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// One header sector exactly as stored on disk.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
pub struct RawFileHeader {
    num_bytes: u32,                    // Bytes allocated under this header.
    num_sectors: u32,                  // Direct entries in use.
    data_sectors: [u32; NUM_DIRECT],   // Sector of each data block.
    next_file_header: u32,             // Continuation header, 0 at the end of the chain.
}

const _: () = assert!(size_of::<RawFileHeader>() == SECTOR_SIZE);

/// In-memory copy of one link of a file's header chain.
///
/// A header only knows about its own direct sectors; walking to the
/// continuation header is left to [`HeaderChain`].
#[derive(Clone, Copy)]
pub struct FileHeader {
    raw: RawFileHeader,
}

impl FileHeader {
    /// A header with nothing allocated and no continuation.
    pub fn new() -> Self {
        Self {
            raw: RawFileHeader::new_zeroed(),
        }
    }

    /// Extends this header's allocation by `num_bytes`, taking whatever new
    /// sectors that needs from `free_map`.
    ///
    /// On failure nothing changes: neither the header nor the bitmap.
    pub fn allocate(&mut self, free_map: &mut Bitmap, num_bytes: usize) -> Result<()> {
        let new_bytes = self.length() + num_bytes;
        if new_bytes > HEADER_CAPACITY {
            return Err(Error::NoSpace);
        }
        let new_sectors = new_bytes.div_ceil(SECTOR_SIZE);
        let wanted = new_sectors - self.num_sectors();
        if free_map.count_clear() < wanted {
            return Err(Error::NoSpace);
        }

        for slot in self.num_sectors()..new_sectors {
            let Some(sector) = free_map.find() else {
                unreachable!("bitmap ran dry after reporting {wanted} free sectors");
            };
            self.raw.data_sectors[slot] = sector as u32;
        }
        self.raw.num_bytes = new_bytes as u32;
        self.raw.num_sectors = new_sectors as u32;
        Ok(())
    }

    /// Releases this header's data sectors. The header's own sector and the
    /// rest of the chain are the caller's business.
    pub fn deallocate(&self, free_map: &mut Bitmap) {
        for &sector in self.data_sectors() {
            assert!(free_map.test(sector as usize), "freeing free sector {sector}");
            free_map.clear(sector as usize);
        }
    }

    pub fn fetch_from(disk: &SynchDisk, sector: BlockSector) -> Result<Self> {
        let mut buf = [0; SECTOR_SIZE];
        disk.read_sector(sector, &mut buf)?;
        let Some(raw) = RawFileHeader::read_from(&buf[..]) else {
            unreachable!("a header is exactly one sector");
        };
        Ok(Self { raw })
    }

    pub fn write_back(&self, disk: &SynchDisk, sector: BlockSector) -> Result<()> {
        Ok(disk.write_sector(sector, self.raw.as_bytes())?)
    }

    /// Sector holding byte `offset` of the data this header maps.
    pub fn byte_to_sector(&self, offset: usize) -> BlockSector {
        self.raw.data_sectors[offset / SECTOR_SIZE]
    }

    pub fn length(&self) -> usize {
        self.raw.num_bytes as usize
    }

    pub fn num_sectors(&self) -> usize {
        self.raw.num_sectors as usize
    }

    /// Bytes this header can still take before a continuation is needed.
    pub fn room(&self) -> usize {
        HEADER_CAPACITY - self.length()
    }

    pub fn data_sectors(&self) -> &[BlockSector] {
        let used = self.num_sectors().min(NUM_DIRECT);
        &self.raw.data_sectors[..used]
    }

    pub fn next(&self) -> Option<BlockSector> {
        match self.raw.next_file_header {
            0 => None,
            sector => Some(sector),
        }
    }

    pub fn set_next(&mut self, sector: BlockSector) {
        self.raw.next_file_header = sector;
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "File header: {} bytes, blocks:", self.length())?;
        for sector in self.data_sectors() {
            write!(f, " {sector}")?;
        }
        match self.next() {
            Some(next) => writeln!(f, ", continues at {next}"),
            None => writeln!(f),
        }
    }
}

/// Every header of one file, in chain order, with the sector each lives in.
///
/// All headers but the last are full, so byte `n` of the file always lives
/// under header `n / HEADER_CAPACITY`.
pub struct HeaderChain {
    links: Vec<(BlockSector, FileHeader)>,
}

impl HeaderChain {
    /// Reads the chain starting at `first`.
    ///
    /// # Panics
    ///
    /// Panics if the chain loops back on itself.
    pub fn load(disk: &SynchDisk, first: BlockSector) -> Result<Self> {
        let mut links = Vec::new();
        let mut sector = Some(first);
        while let Some(current) = sector {
            assert!(
                links.len() <= disk.num_sectors() as usize,
                "header chain starting at {first} does not terminate"
            );
            let header = FileHeader::fetch_from(disk, current)?;
            sector = header.next();
            links.push((current, header));
        }
        Ok(Self { links })
    }

    /// Total bytes allocated across the chain.
    pub fn length(&self) -> usize {
        self.links.iter().map(|(_, header)| header.length()).sum()
    }

    pub fn links(&self) -> &[(BlockSector, FileHeader)] {
        &self.links
    }

    /// Data sector holding byte `position` of the file.
    pub fn byte_to_sector(&self, position: usize) -> BlockSector {
        let (_, header) = &self.links[position / HEADER_CAPACITY];
        header.byte_to_sector(position % HEADER_CAPACITY)
    }

    /// Header sector whose direct blocks hold byte `position`.
    pub fn header_for(&self, position: usize) -> BlockSector {
        let index = (position / HEADER_CAPACITY).min(self.links.len() - 1);
        self.links[index].0
    }

    /// Grows the file until it spans `end` bytes.
    ///
    /// The tail header is filled first, then fresh headers are appended, each
    /// allocated, written and linked from its predecessor before the next one
    /// is considered. The tail and the first fresh header take their share in
    /// full or not at all; later headers settle for whatever sectors are
    /// still free. Keeps whatever was allocated before running out. Returns
    /// the new length.
    ///
    /// The caller persists `free_map` afterwards.
    pub fn extend(&mut self, disk: &SynchDisk, free_map: &mut Bitmap, end: usize) -> Result<usize> {
        let mut wanted = end.saturating_sub(self.length());

        let Some((tail_sector, tail)) = self.links.last_mut() else {
            unreachable!("a chain always has its first header");
        };
        let take = wanted.min(tail.room());
        if take > 0 {
            if tail.allocate(free_map, take).is_err() {
                return Ok(self.length());
            }
            tail.write_back(disk, *tail_sector)?;
            wanted -= take;
        }

        let mut appended = 0;
        while wanted > 0 {
            let Some(sector) = free_map.find() else {
                break;
            };
            let mut take = wanted.min(HEADER_CAPACITY);
            if appended > 0 {
                take = take.min(free_map.count_clear() * SECTOR_SIZE);
            }
            let mut header = FileHeader::new();
            if take == 0 || header.allocate(free_map, take).is_err() {
                free_map.clear(sector);
                break;
            }
            header.write_back(disk, sector as BlockSector)?;

            let Some((prev_sector, prev)) = self.links.last_mut() else {
                unreachable!("a chain always has its first header");
            };
            prev.set_next(sector as BlockSector);
            prev.write_back(disk, *prev_sector)?;

            self.links.push((sector as BlockSector, header));
            appended += 1;
            wanted -= take;
        }

        Ok(self.length())
    }

    /// Releases every data sector and every header sector of the chain.
    pub fn deallocate(&self, free_map: &mut Bitmap) {
        for (sector, header) in &self.links {
            header.deallocate(free_map);
            free_map.clear(*sector as usize);
        }
    }

    /// Reads from byte `position` into `buf`, stopping at the end of the file.
    pub fn read_at(&self, disk: &SynchDisk, buf: &mut [u8], position: usize) -> Result<usize> {
        let length = self.length();
        if position >= length {
            return Ok(0);
        }
        let count = buf.len().min(length - position);

        let mut sector_buf = [0; SECTOR_SIZE];
        let mut done = 0;
        while done < count {
            let at = position + done;
            let offset = at % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - offset).min(count - done);
            disk.read_sector(self.byte_to_sector(at), &mut sector_buf)?;
            buf[done..done + chunk].copy_from_slice(&sector_buf[offset..offset + chunk]);
            done += chunk;
        }
        Ok(count)
    }

    /// Writes `buf` at byte `position`, stopping at the end of the file.
    ///
    /// Sectors only partly covered by `buf` are read first so the bytes
    /// around the written span are kept.
    pub fn write_at(&self, disk: &SynchDisk, buf: &[u8], position: usize) -> Result<usize> {
        let length = self.length();
        if position >= length {
            return Ok(0);
        }
        let count = buf.len().min(length - position);

        let mut sector_buf = [0; SECTOR_SIZE];
        let mut done = 0;
        while done < count {
            let at = position + done;
            let offset = at % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - offset).min(count - done);
            let sector = self.byte_to_sector(at);
            if chunk < SECTOR_SIZE {
                disk.read_sector(sector, &mut sector_buf)?;
            }
            sector_buf[offset..offset + chunk].copy_from_slice(&buf[done..done + chunk]);
            disk.write_sector(sector, &sector_buf)?;
            done += chunk;
        }
        Ok(count)
    }
}
