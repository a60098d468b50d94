use super::{
    file_header::HeaderChain, volume::Volume, Error, Result, FILE_NAME_MAX_LEN,
};
use crate::block::BlockSector;
use alloc::{string::String, vec, vec::Vec};
use core::{fmt, mem::size_of};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// One slot of a directory table as stored on disk.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
pub struct DirectoryEntry {
    in_use: u8,
    is_directory: u8,
    _padding: [u8; 2],
    sector: u32,
    name: [u8; FILE_NAME_MAX_LEN + 1], // NUL padded
}

pub const DIRECTORY_ENTRY_SIZE: usize = size_of::<DirectoryEntry>();

impl DirectoryEntry {
    pub fn in_use(&self) -> bool {
        self.in_use != 0
    }

    pub fn is_directory(&self) -> bool {
        self.in_use() && self.is_directory != 0
    }

    pub fn sector(&self) -> BlockSector {
        self.sector
    }

    /// The stored name, or `None` if the bytes are not a terminated name.
    pub fn name(&self) -> Option<&str> {
        let len = self.name.iter().position(|&b| b == 0)?;
        core::str::from_utf8(&self.name[..len]).ok()
    }
}

pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::InvalidPath);
    }
    if name.len() > FILE_NAME_MAX_LEN {
        return Err(Error::NameTooLong);
    }
    Ok(())
}

/// The name table of one directory.
///
/// The table is an ordinary file of fixed-size entries. It never shrinks;
/// when every slot is taken it grows by exactly one.
#[derive(Clone)]
pub struct Directory {
    table: Vec<DirectoryEntry>,
}

impl Directory {
    /// An empty table of `size` slots.
    pub fn new(size: usize) -> Self {
        Self {
            table: vec![DirectoryEntry::new_zeroed(); size],
        }
    }

    pub fn table_size(&self) -> usize {
        self.table.len()
    }

    /// Loads the table from the directory file at `sector`.
    ///
    /// With `recount`, the table is resized to however many entries the file
    /// holds; otherwise exactly the current number of slots is read.
    pub(super) fn fetch_from(
        &mut self,
        volume: &Volume,
        sector: BlockSector,
        recount: bool,
    ) -> Result<()> {
        let chain = HeaderChain::load(&volume.disk, sector)?;
        if recount {
            self.table = vec![DirectoryEntry::new_zeroed(); chain.length() / DIRECTORY_ENTRY_SIZE];
        }
        let bytes = self.table.as_bytes_mut();
        let read = chain.read_at(&volume.disk, bytes, 0)?;
        bytes[read..].fill(0);
        Ok(())
    }

    /// Reads the whole table of the directory at `sector`.
    pub(super) fn load(volume: &Volume, sector: BlockSector) -> Result<Self> {
        let mut dir = Self::new(0);
        dir.fetch_from(volume, sector, true)?;
        Ok(dir)
    }

    /// Persists the table, growing the directory file if the table grew.
    pub(super) fn write_back(&self, volume: &Volume, sector: BlockSector) -> Result<()> {
        let bytes = self.table.as_bytes();
        let mut chain = HeaderChain::load(&volume.disk, sector)?;
        if chain.length() < bytes.len() {
            let length =
                volume.with_free_map(|free_map| chain.extend(&volume.disk, free_map, bytes.len()))??;
            if length < bytes.len() {
                return Err(Error::NoSpace);
            }
        }
        chain.write_at(&volume.disk, bytes, 0)?;
        Ok(())
    }

    fn find_index(&self, name: &str) -> Option<usize> {
        self.table
            .iter()
            .position(|entry| entry.in_use() && entry.name() == Some(name))
    }

    pub fn find(&self, name: &str) -> Option<BlockSector> {
        self.find_index(name).map(|i| self.table[i].sector)
    }

    /// Whether `name` exists and is a subdirectory.
    pub fn find_directory(&self, name: &str) -> bool {
        self.find_index(name)
            .is_some_and(|i| self.table[i].is_directory())
    }

    /// Adds `name`, taking the first free slot or growing the table by one.
    pub fn add(&mut self, name: &str, sector: BlockSector, is_directory: bool) -> Result<()> {
        check_name(name)?;
        if self.find_index(name).is_some() {
            return Err(Error::Exists);
        }

        let mut entry = DirectoryEntry::new_zeroed();
        entry.in_use = 1;
        entry.is_directory = u8::from(is_directory);
        entry.sector = sector;
        entry.name[..name.len()].copy_from_slice(name.as_bytes());

        match self.table.iter_mut().find(|slot| !slot.in_use()) {
            Some(slot) => *slot = entry,
            None => self.table.push(entry),
        }
        Ok(())
    }

    /// Frees the slot of `name`. The table keeps its size.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let index = self.find_index(name).ok_or(Error::NotFound)?;
        let slot = &mut self.table[index];
        slot.in_use = 0;
        slot.is_directory = 0;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        !self.table.iter().any(DirectoryEntry::in_use)
    }

    pub fn entries(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.table.iter().filter(|entry| entry.in_use())
    }

    /// One name per line, subdirectories marked with a trailing `/`. An empty
    /// directory lists as a single blank line.
    pub fn list(&self) -> String {
        let mut out = String::new();
        for entry in self.entries() {
            out.push_str(entry.name().unwrap_or("?"));
            if entry.is_directory() {
                out.push('/');
            }
            out.push('\n');
        }
        if out.is_empty() {
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for Directory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Directory contents:")?;
        for entry in self.entries() {
            writeln!(
                f,
                "Name: {}, Sector: {}{}",
                entry.name().unwrap_or("?"),
                entry.sector,
                if entry.is_directory() { ", directory" } else { "" }
            )?;
        }
        Ok(())
    }
}
