//! Reverse map from physical frame to the page occupying it.

use super::SpaceId;
use alloc::boxed::Box;
use alloc::vec;
use arbitrary_int::u31;
use bitbybit::bitfield;

#[bitfield(u64, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bits(1..=31, rw)]
    vpn: u31,
    #[bits(32..=63, rw)]
    space: u32,
}

impl CoreMapEntry {
    fn owned_by(space: SpaceId, vpn: usize) -> Self {
        CoreMapEntry::DEFAULT
            .with_allocated(true)
            .with_vpn(u31::new(vpn as u32))
            .with_space(space)
    }
}

/// One entry per physical frame. Not synchronized: callers hold the virtual
/// memory lock.
pub struct Coremap {
    entries: Box<[CoreMapEntry]>,
}

impl Coremap {
    pub fn new(num_frames: usize) -> Self {
        assert!(num_frames > 0);
        Self {
            entries: vec![CoreMapEntry::DEFAULT; num_frames].into_boxed_slice(),
        }
    }

    /// Claims the lowest free frame for page `vpn` of `space`.
    pub fn find(&mut self, space: SpaceId, vpn: usize) -> Option<usize> {
        let frame = self.entries.iter().position(|entry| !entry.allocated())?;
        self.entries[frame] = CoreMapEntry::owned_by(space, vpn);
        Some(frame)
    }

    /// Hands `frame` to page `vpn` of `space`, whoever held it before.
    pub fn mark(&mut self, frame: usize, space: SpaceId, vpn: usize) {
        self.entries[frame] = CoreMapEntry::owned_by(space, vpn);
    }

    pub fn clear(&mut self, frame: usize) {
        self.entries[frame] = CoreMapEntry::DEFAULT;
    }

    pub fn test(&self, frame: usize) -> bool {
        self.entries[frame].allocated()
    }

    /// The space and page holding `frame`, if it is in use.
    pub fn owner(&self, frame: usize) -> Option<(SpaceId, usize)> {
        let entry = self.entries[frame];
        entry
            .allocated()
            .then(|| (entry.space(), entry.vpn().value() as usize))
    }

    pub fn count_clear(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.allocated()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Frames currently held by `space`.
    pub fn frames_of(&self, space: SpaceId) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, entry)| entry.allocated() && entry.space() == space)
            .map(|(frame, _)| frame)
    }
}
