use super::{file_header::HeaderChain, volume::Volume, Error, Result};
use crate::block::BlockSector;
use alloc::sync::Arc;

/// An open session on a file.
///
/// Every handle to a sector is counted in the volume's registration table;
/// dropping the handle closes it. Reads go straight to disk, writes through
/// any handle of the same file are serialized by the file's write lock.
pub struct OpenFile {
    volume: Arc<Volume>,
    sector: BlockSector,
    seek_position: usize,
    /// Header sector under which the last transfer ended.
    current_sector: BlockSector,
}

impl OpenFile {
    /// Opens the file whose first header is at `sector`.
    ///
    /// Fails with [`Error::NotFound`] if the file is being removed.
    pub(super) fn open(volume: Arc<Volume>, sector: BlockSector) -> Result<Self> {
        if !volume.registration(sector).open() {
            return Err(Error::NotFound);
        }
        Ok(Self {
            volume,
            sector,
            seek_position: 0,
            current_sector: sector,
        })
    }

    /// Reads from the seek position, following the header chain as needed.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let chain = HeaderChain::load(&self.volume.disk, self.sector)?;
        let count = chain.read_at(&self.volume.disk, buf, self.seek_position)?;
        self.advance(&chain, count);
        Ok(count)
    }

    /// Writes at the seek position, growing the file as needed.
    ///
    /// Returns how many bytes were written. If the disk fills up part way,
    /// the count is short and the sectors already claimed stay with the file.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let write_lock = self.volume.registration(self.sector).write_lock();
        let _guard = write_lock.lock();

        let disk = &self.volume.disk;
        let mut chain = HeaderChain::load(disk, self.sector)?;
        let end = self.seek_position + buf.len();
        if chain.length() < end {
            let length = self
                .volume
                .with_free_map(|free_map| chain.extend(disk, free_map, end))??;
            if length < end {
                log::debug!(
                    "file at sector {} short by {} bytes after extending",
                    self.sector,
                    end - length
                );
            }
        }

        let count = chain.write_at(disk, buf, self.seek_position)?;
        self.advance(&chain, count);
        Ok(count)
    }

    /// Reads at `position` without touching the seek position.
    pub fn read_at(&self, buf: &mut [u8], position: usize) -> Result<usize> {
        HeaderChain::load(&self.volume.disk, self.sector)?.read_at(&self.volume.disk, buf, position)
    }

    /// Writes at `position` without touching the seek position. Never grows
    /// the file: bytes past its end are dropped.
    pub fn write_at(&self, buf: &[u8], position: usize) -> Result<usize> {
        let write_lock = self.volume.registration(self.sector).write_lock();
        let _guard = write_lock.lock();
        HeaderChain::load(&self.volume.disk, self.sector)?.write_at(&self.volume.disk, buf, position)
    }

    fn advance(&mut self, chain: &HeaderChain, count: usize) {
        if count > 0 {
            self.current_sector = chain.header_for(self.seek_position + count - 1);
        }
        self.seek_position += count;
    }

    pub fn seek(&mut self, position: usize) {
        self.seek_position = position;
    }

    pub fn tell(&self) -> usize {
        self.seek_position
    }

    /// Bytes allocated across the whole chain.
    pub fn length(&self) -> Result<usize> {
        Ok(HeaderChain::load(&self.volume.disk, self.sector)?.length())
    }

    /// Sector of the file's first header.
    pub fn sector(&self) -> BlockSector {
        self.sector
    }

    pub fn current_sector(&self) -> BlockSector {
        self.current_sector
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        self.volume.registration(self.sector).close();
    }
}
