use core::error::Error;
use core::fmt::{Debug, Display, Formatter};

/// Error type for sector transfers
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The sector is past the end of the device
    SectorOutOfBounds,
    /// The buffer is not exactly one sector long
    BufferInvalid,
    /// A disk image whose length is not a whole number of sectors
    ImageInvalid,
}

impl Debug for BlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            BlockError::SectorOutOfBounds => write!(f, "SectorOutOfBounds"),
            BlockError::BufferInvalid => write!(f, "BufferInvalid"),
            BlockError::ImageInvalid => write!(f, "ImageInvalid"),
        }
    }
}

impl Display for BlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            BlockError::SectorOutOfBounds => write!(f, "sector out of bounds"),
            BlockError::BufferInvalid => write!(f, "buffer is not one sector long"),
            BlockError::ImageInvalid => write!(f, "disk image is not a whole number of sectors"),
        }
    }
}

impl Error for BlockError {}
