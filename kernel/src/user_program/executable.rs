//! User program images.
//!
//! An image starts with a fixed header: a magic number, then three segment
//! descriptors (code, initialized data, uninitialized data). Each descriptor
//! says where the segment goes in the address space, where its bytes start
//! in the file and how long it is. Everything is a little-endian `u32`.

use crate::fs::OpenFile;
use crate::mem::VmError;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;
use nom::combinator::verify;
use nom::number::complete::le_u32;
use nom::IResult;

pub const NOFF_MAGIC: u32 = 0x00BA_DFAD;
pub const HEADER_SIZE: usize = 4 + 3 * 12;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    pub virtual_addr: u32,
    pub in_file_addr: u32,
    pub size: u32,
}

impl Segment {
    fn parse(bytes: &[u8]) -> IResult<&[u8], Segment> {
        let (bytes, virtual_addr) = le_u32(bytes)?;
        let (bytes, in_file_addr) = le_u32(bytes)?;
        let (bytes, size) = le_u32(bytes)?;

        Ok((
            bytes,
            Segment {
                virtual_addr,
                in_file_addr,
                size,
            },
        ))
    }

    /// Addresses the segment occupies once loaded.
    pub fn virtual_range(&self) -> Range<usize> {
        let start = self.virtual_addr as usize;
        start..start + self.size as usize
    }

    fn file_range(&self) -> Range<usize> {
        let start = self.in_file_addr as usize;
        start..start + self.size as usize
    }

    fn to_bytes(self) -> [u8; 12] {
        let mut out = [0; 12];
        out[0..4].copy_from_slice(&self.virtual_addr.to_le_bytes());
        out[4..8].copy_from_slice(&self.in_file_addr.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NoffHeader {
    pub code: Segment,
    pub init_data: Segment,
    pub uninit_data: Segment,
}

impl NoffHeader {
    pub fn parse(bytes: &[u8]) -> IResult<&[u8], NoffHeader> {
        let (bytes, _) = verify(le_u32, |magic| *magic == NOFF_MAGIC)(bytes)?;
        let (bytes, code) = Segment::parse(bytes)?;
        let (bytes, init_data) = Segment::parse(bytes)?;
        let (bytes, uninit_data) = Segment::parse(bytes)?;

        Ok((
            bytes,
            NoffHeader {
                code,
                init_data,
                uninit_data,
            },
        ))
    }
}

/// A parsed image: the header plus the whole file it came from.
#[derive(Clone, Debug)]
pub struct Executable {
    header: NoffHeader,
    image: Vec<u8>,
}

impl Executable {
    /// Parses `image`, checking that every segment with contents lies inside
    /// it.
    pub fn from_bytes(image: Vec<u8>) -> Result<Self, VmError> {
        let (_, header) = NoffHeader::parse(&image).map_err(|_| VmError::InvalidExecutable)?;
        for segment in [header.code, header.init_data] {
            if segment.file_range().end > image.len() {
                return Err(VmError::InvalidExecutable);
            }
        }
        Ok(Self { header, image })
    }

    /// Reads the whole of `file` and parses it.
    pub fn load(file: &mut OpenFile) -> Result<Self, VmError> {
        let mut image = vec![0; file.length()?];
        file.seek(0);
        let read = file.read(&mut image)?;
        image.truncate(read);
        Self::from_bytes(image)
    }

    /// Builds an image with code at address 0 and data right after it.
    pub fn build(code: &[u8], init_data: &[u8], uninit_size: u32) -> Vec<u8> {
        let code_seg = Segment {
            virtual_addr: 0,
            in_file_addr: HEADER_SIZE as u32,
            size: code.len() as u32,
        };
        let data_seg = Segment {
            virtual_addr: code_seg.size,
            in_file_addr: code_seg.in_file_addr + code_seg.size,
            size: init_data.len() as u32,
        };
        let bss_seg = Segment {
            virtual_addr: data_seg.virtual_addr + data_seg.size,
            in_file_addr: 0,
            size: uninit_size,
        };

        let mut image = Vec::with_capacity(HEADER_SIZE + code.len() + init_data.len());
        image.extend_from_slice(&NOFF_MAGIC.to_le_bytes());
        for segment in [code_seg, data_seg, bss_seg] {
            image.extend_from_slice(&segment.to_bytes());
        }
        image.extend_from_slice(code);
        image.extend_from_slice(init_data);
        image
    }

    pub fn header(&self) -> &NoffHeader {
        &self.header
    }

    /// Bytes of address space the segments need, from address 0 to the end
    /// of the highest one.
    pub fn size(&self) -> usize {
        [self.header.code, self.header.init_data, self.header.uninit_data]
            .iter()
            .map(|segment| segment.virtual_range().end)
            .max()
            .unwrap_or(0)
    }

    /// Copies into `frame` whatever part of the code and initialized data
    /// falls inside `[page_addr, page_addr + frame.len())`. Other bytes are
    /// left alone.
    pub fn copy_page(&self, page_addr: usize, frame: &mut [u8]) {
        let page = page_addr..page_addr + frame.len();
        for segment in [self.header.code, self.header.init_data] {
            let extent = segment.virtual_range();
            let start = page.start.max(extent.start);
            let end = page.end.min(extent.end);
            if start >= end {
                continue;
            }
            let from = segment.in_file_addr as usize + (start - extent.start);
            frame[start - page.start..end - page.start]
                .copy_from_slice(&self.image[from..from + (end - start)]);
        }
    }

    /// Whether `[page_addr, page_addr + len)` holds nothing but code.
    pub fn is_code_only(&self, page_addr: usize, len: usize) -> bool {
        let code = self.header.code.virtual_range();
        code.start <= page_addr && page_addr + len <= code.end
    }
}
