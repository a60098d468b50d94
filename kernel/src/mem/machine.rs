//! The simulated memory hardware: physical memory and a fully associative
//! TLB that every user access is translated through.

use alloc::vec;
use alloc::vec::Vec;
use arbitrary_int::u24;
use bitbybit::bitfield;
use sectoros_shared::mem::PAGE_SIZE;

/// A page table or TLB entry.
#[bitfield(u64, default = 0)]
pub struct TranslationEntry {
    #[bits(0..=23, rw)]
    virtual_page: u24,
    #[bits(24..=47, rw)]
    physical_page: u24,
    #[bit(48, rw)]
    valid: bool,
    #[bit(49, rw)]
    read_only: bool,
    /// Set by the hardware on every access.
    #[bit(50, rw)]
    used: bool,
    /// Set by the hardware on every write.
    #[bit(51, rw)]
    dirty: bool,
}

impl TranslationEntry {
    pub fn vpn(&self) -> usize {
        self.virtual_page().value() as usize
    }

    pub fn frame(&self) -> usize {
        self.physical_page().value() as usize
    }

    pub fn mapping(vpn: usize, frame: usize) -> Self {
        TranslationEntry::DEFAULT
            .with_virtual_page(u24::new(vpn as u32))
            .with_physical_page(u24::new(frame as u32))
            .with_valid(true)
    }

    /// Takes the use and dirty bits of `other`, keeping everything else.
    pub fn with_bits_of(self, other: TranslationEntry) -> Self {
        self.with_used(other.used()).with_dirty(other.dirty())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Fault {
    /// no TLB entry for the page
    TlbMiss { vaddr: usize },
    ReadOnly { vaddr: usize },
}

pub struct Machine {
    memory: Vec<u8>,
    tlb: Vec<TranslationEntry>,
    /// Slot the next refill replaces.
    next_slot: usize,
}

impl Machine {
    pub fn new(num_frames: usize, tlb_size: usize) -> Self {
        assert!(tlb_size > 0);
        Self {
            memory: vec![0; num_frames * PAGE_SIZE],
            tlb: vec![TranslationEntry::DEFAULT; tlb_size],
            next_slot: 0,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.memory.len() / PAGE_SIZE
    }

    pub fn frame(&self, frame: usize) -> &[u8] {
        &self.memory[frame * PAGE_SIZE..(frame + 1) * PAGE_SIZE]
    }

    pub fn frame_mut(&mut self, frame: usize) -> &mut [u8] {
        &mut self.memory[frame * PAGE_SIZE..(frame + 1) * PAGE_SIZE]
    }

    pub fn read_byte(&self, paddr: usize) -> u8 {
        self.memory[paddr]
    }

    pub fn write_byte(&mut self, paddr: usize, value: u8) {
        self.memory[paddr] = value;
    }

    /// Translates `vaddr` to a physical address, marking the entry used, and
    /// dirty if `writing`.
    pub fn translate(&mut self, vaddr: usize, writing: bool) -> Result<usize, Fault> {
        let vpn = vaddr / PAGE_SIZE;
        let Some(entry) = self
            .tlb
            .iter_mut()
            .find(|entry| entry.valid() && entry.vpn() == vpn)
        else {
            return Err(Fault::TlbMiss { vaddr });
        };
        if writing && entry.read_only() {
            return Err(Fault::ReadOnly { vaddr });
        }
        *entry = entry.with_used(true).with_dirty(entry.dirty() || writing);
        Ok(entry.frame() * PAGE_SIZE + vaddr % PAGE_SIZE)
    }

    /// Loads `entry` into the TLB, round robin. Returns the entry it
    /// displaced, whose bits belong back in its page table if it was valid.
    pub fn tlb_refill(&mut self, entry: TranslationEntry) -> TranslationEntry {
        let slot = self.next_slot;
        self.next_slot = (slot + 1) % self.tlb.len();
        core::mem::replace(&mut self.tlb[slot], entry)
    }

    /// Invalidates the whole TLB, returning the entries that were valid.
    pub fn flush_tlb(&mut self) -> Vec<TranslationEntry> {
        let valid = self.tlb.iter().copied().filter(|entry| entry.valid()).collect();
        self.tlb.fill(TranslationEntry::DEFAULT);
        valid
    }

    /// Invalidates the TLB entry mapping `frame`, if any, and returns it.
    pub fn tlb_take_frame(&mut self, frame: usize) -> Option<TranslationEntry> {
        let entry = self
            .tlb
            .iter_mut()
            .find(|entry| entry.valid() && entry.frame() == frame)?;
        let taken = *entry;
        *entry = entry.with_valid(false);
        Some(taken)
    }

    /// Clears the use bit of the TLB entry mapping `frame`.
    pub fn tlb_clear_used(&mut self, frame: usize) {
        for entry in &mut self.tlb {
            if entry.valid() && entry.frame() == frame {
                *entry = entry.with_used(false);
            }
        }
    }

    /// The TLB entry mapping `frame`, if any.
    pub fn tlb_entry_for(&self, frame: usize) -> Option<TranslationEntry> {
        self.tlb
            .iter()
            .copied()
            .find(|entry| entry.valid() && entry.frame() == frame)
    }
}
