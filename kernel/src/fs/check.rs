//! Whole-volume consistency check.
//!
//! Rebuilds the free map from scratch by walking every header reachable from
//! sectors 0 and 1, then compares it with the map on disk.

use super::{
    file_system::FileSystem, volume::Volume, Bitmap, Directory, FileHeader, Result,
    DIRECTORY_SECTOR, FILE_NAME_MAX_LEN, FREE_MAP_SECTOR, MAX_DIR_LEVEL, NUM_DIRECT,
};
use crate::block::BlockSector;
use alloc::vec::Vec;
use log::warn;
use sectoros_shared::sizes::SECTOR_SIZE;

struct Checker<'a> {
    volume: &'a Volume,
    shadow: Bitmap,
    ok: bool,
}

impl<'a> Checker<'a> {
    fn fail(&mut self) {
        self.ok = false;
    }

    /// Records `sector` as used by `owner`. Returns false if it cannot be.
    fn claim(&mut self, sector: BlockSector, owner: &str) -> bool {
        if sector as usize >= self.shadow.num_bits() {
            warn!("{owner}: sector {sector} is out of range");
            self.fail();
            return false;
        }
        if self.shadow.test(sector as usize) {
            warn!("{owner}: sector {sector} is used more than once");
            self.fail();
            return false;
        }
        self.shadow.mark(sector as usize);
        true
    }

    /// Checks the chain starting at `first`, whose sector is already
    /// claimed. Returns the chain's length.
    fn check_chain(&mut self, first: BlockSector, owner: &str) -> Result<usize> {
        let mut length = 0;
        let mut sector = first;
        loop {
            let header = FileHeader::fetch_from(&self.volume.disk, sector)?;
            if header.num_sectors() > NUM_DIRECT {
                warn!("{owner}: header {sector} claims {} sectors", header.num_sectors());
                self.fail();
                return Ok(length);
            }
            if header.num_sectors() != header.length().div_ceil(SECTOR_SIZE) {
                warn!(
                    "{owner}: header {sector} has {} sectors for {} bytes",
                    header.num_sectors(),
                    header.length()
                );
                self.fail();
            }
            for &data in header.data_sectors() {
                self.claim(data, owner);
            }
            length += header.length();

            match header.next() {
                None => return Ok(length),
                Some(next) if self.claim(next, owner) => sector = next,
                // Broken or looping link: stop here rather than walk forever.
                Some(_) => return Ok(length),
            }
        }
    }

    fn check_directory(&mut self, sector: BlockSector, path: &str, depth: usize) -> Result<()> {
        if depth > MAX_DIR_LEVEL {
            warn!("{path}: nested deeper than {MAX_DIR_LEVEL} levels");
            self.fail();
            return Ok(());
        }
        let dir = Directory::load(self.volume, sector)?;
        let mut seen: Vec<&str> = Vec::new();
        for entry in dir.entries() {
            let Some(name) = entry.name() else {
                warn!("{path}: entry at sector {} has an unterminated name", entry.sector());
                self.fail();
                continue;
            };
            if name.is_empty() || name.len() > FILE_NAME_MAX_LEN {
                warn!("{path}: bad name {name:?}");
                self.fail();
            }
            if seen.contains(&name) {
                warn!("{path}: name {name} appears twice");
                self.fail();
            }
            seen.push(name);

            if !self.claim(entry.sector(), name) {
                continue;
            }
            self.check_chain(entry.sector(), name)?;
            if entry.is_directory() {
                self.check_directory(entry.sector(), name, depth + 1)?;
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        self.claim(FREE_MAP_SECTOR, "free map");
        self.claim(DIRECTORY_SECTOR, "root");

        let map_length = self.check_chain(FREE_MAP_SECTOR, "free map")?;
        if map_length != self.volume.free_map_size() {
            warn!(
                "free map: {map_length} bytes, expected {}",
                self.volume.free_map_size()
            );
            self.fail();
        }
        self.check_chain(DIRECTORY_SECTOR, "root")?;
        self.check_directory(DIRECTORY_SECTOR, "/", 0)?;

        let live = self.volume.fetch_free_map()?;
        for sector in 0..live.num_bits() {
            match (live.test(sector), self.shadow.test(sector)) {
                (true, false) => warn!("sector {sector} is marked but unused"),
                (false, true) => warn!("sector {sector} is used but not marked"),
                _ => continue,
            }
            self.fail();
        }
        Ok(())
    }
}

impl FileSystem {
    /// Checks every header, directory and the free map for consistency.
    ///
    /// Problems are logged as warnings; the result says whether there were any.
    pub fn check(&self) -> bool {
        let _traversal = self.lock_traversal();
        let volume = self.volume();
        let _free_map = volume.lock_free_map();

        let mut checker = Checker {
            volume,
            shadow: Bitmap::new(volume.num_sectors()),
            ok: true,
        };
        if let Err(err) = checker.run() {
            warn!("check aborted: {err}");
            return false;
        }
        if checker.ok {
            log::debug!("volume is consistent");
        }
        checker.ok
    }
}
