//! Hierarchical file system over a sector-addressed disk.
//!
//! On-disk layout:
//!   Sector 0: file header of the free-sector bitmap
//!   Sector 1: file header of the root directory
//!   Every other sector is a file header, directory table data or file data,
//!   as recorded in the bitmap.
//!
//! Files are chains of one-sector headers. Each header maps up to
//! [`NUM_DIRECT`] data sectors and links the next header of the chain, so a
//! file grows by appending headers rather than by rewriting its first one.

pub mod bitmap;
mod check;
pub mod directory;
pub mod file_header;
pub mod file_system;
pub mod open_file;
mod volume;

pub use bitmap::Bitmap;
pub use directory::{Directory, DirectoryEntry};
pub use file_header::{FileHeader, RawFileHeader};
pub use file_system::FileSystem;
pub use open_file::OpenFile;
pub use volume::SectorPhase;

use crate::block::{BlockError, BlockSector};
use core::mem::size_of;
use sectoros_shared::sizes::SECTOR_SIZE;

pub const FREE_MAP_SECTOR: BlockSector = 0;
pub const DIRECTORY_SECTOR: BlockSector = 1;

/// Direct data sectors mapped by one file header: whatever is left of a
/// sector after the two counters and the link to the next header.
pub const NUM_DIRECT: usize = (SECTOR_SIZE - 2 * size_of::<u32>()) / size_of::<u32>() - 1;
/// Bytes of data a single header can map.
pub const HEADER_CAPACITY: usize = NUM_DIRECT * SECTOR_SIZE;

pub const FILE_NAME_MAX_LEN: usize = 15;
pub const MAX_DIR_LEVEL: usize = 10;
pub const FILE_PATH_MAX_LEN: usize = FILE_NAME_MAX_LEN * MAX_DIR_LEVEL;

/// Slots in a freshly created directory table.
pub const NUM_DIR_ENTRIES: usize = 10;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// directory entry not found, or the file is being removed
    NotFound,
    /// a path component names something that isn't a directory
    NotDirectory,
    /// operation expecting a file called with a directory
    IsDirectory,
    /// no free sectors left on the disk
    NoSpace,
    /// name already present in the target directory
    Exists,
    /// called remove on a directory that still has entries
    NotEmpty,
    /// the directory is the current working directory
    Busy,
    /// a path component is longer than [`FILE_NAME_MAX_LEN`]
    NameTooLong,
    /// a path has more than [`MAX_DIR_LEVEL`] components
    PathTooDeep,
    /// an empty path, or one that names no entry
    InvalidPath,
    /// the underlying disk rejected a transfer
    Device(BlockError),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::NotDirectory => write!(f, "not a directory"),
            Self::IsDirectory => write!(f, "is a directory"),
            Self::NoSpace => write!(f, "no space left on device"),
            Self::Exists => write!(f, "destination already exists"),
            Self::NotEmpty => write!(f, "directory not empty"),
            Self::Busy => write!(f, "directory in use"),
            Self::NameTooLong => write!(f, "file name too long"),
            Self::PathTooDeep => write!(f, "path too deep"),
            Self::InvalidPath => write!(f, "invalid path"),
            Self::Device(err) => write!(f, "device error: {err}"),
        }
    }
}

impl core::error::Error for Error {}

impl From<BlockError> for Error {
    fn from(err: BlockError) -> Self {
        Self::Device(err)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
