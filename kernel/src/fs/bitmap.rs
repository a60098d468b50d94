use alloc::{vec, vec::Vec};
use core::fmt;

const BITS_IN_BYTE: usize = 8;

/// A fixed-size set of numbered slots, each either in use or free.
///
/// Backs both the free-sector map of the file system and the per-process
/// record of which pages have an image in swap. Not internally synchronized:
/// callers hold whatever lock guards the resource the bits describe.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    num_bits: usize,
    map: Vec<u8>,
}

impl Bitmap {
    /// All `num_bits` slots start out free.
    pub fn new(num_bits: usize) -> Self {
        Self {
            num_bits,
            map: vec![0; num_bits.div_ceil(BITS_IN_BYTE)],
        }
    }

    fn locate(&self, which: usize) -> (usize, u8) {
        assert!(
            which < self.num_bits,
            "bit {which} out of range for a map of {} bits",
            self.num_bits
        );
        (which / BITS_IN_BYTE, 1 << (which % BITS_IN_BYTE))
    }

    pub fn mark(&mut self, which: usize) {
        let (byte, mask) = self.locate(which);
        self.map[byte] |= mask;
    }

    pub fn clear(&mut self, which: usize) {
        let (byte, mask) = self.locate(which);
        self.map[byte] &= !mask;
    }

    pub fn test(&self, which: usize) -> bool {
        let (byte, mask) = self.locate(which);
        self.map[byte] & mask != 0
    }

    /// Marks and returns the lowest free slot, or `None` if every slot is in use.
    pub fn find(&mut self) -> Option<usize> {
        let which = (0..self.num_bits).find(|&i| !self.test(i))?;
        self.mark(which);
        Some(which)
    }

    pub fn count_clear(&self) -> usize {
        (0..self.num_bits).filter(|&i| !self.test(i)).count()
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// The flat bit region, least significant bit first within each byte.
    pub fn as_bytes(&self) -> &[u8] {
        &self.map
    }

    /// Replaces the contents with a region produced by [`Bitmap::as_bytes`].
    ///
    /// Bytes past the end of `bytes` are taken as free.
    pub fn load(&mut self, bytes: &[u8]) {
        let len = self.map.len().min(bytes.len());
        self.map.fill(0);
        self.map[..len].copy_from_slice(&bytes[..len]);
    }
}

impl fmt::Display for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Bitmap set:")?;
        for i in (0..self.num_bits).filter(|&i| self.test(i)) {
            write!(f, " {i}")?;
        }
        writeln!(f)
    }
}
