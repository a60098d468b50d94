//! Per-process page tables and swap files.

use super::{TranslationEntry, VmError};
use crate::fs::{Bitmap, FileSystem, OpenFile};
use crate::user_program::executable::Executable;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use arbitrary_int::u24;
use sectoros_shared::mem::{PAGE_SIZE, USER_STACK_SIZE};

pub type SpaceId = u32;

/// A process's private backing store: one page-sized slot per virtual page.
struct Swap {
    name: String,
    file: OpenFile,
    /// Pages whose slot holds their current contents.
    stored: Bitmap,
}

impl Swap {
    /// Creates `SWAP.<pid>` in the root directory, replacing any stale copy,
    /// and gives it room for `num_pages` pages up front.
    fn create(fs: &FileSystem, pid: u32, num_pages: usize) -> Result<Self, VmError> {
        let name = format!("/SWAP.{pid}");
        if fs.remove(&name).is_ok() {
            log::debug!("replaced stale swap file {name}");
        }
        fs.create(&name)?;
        let mut file = fs.open(&name)?;

        let size = num_pages * PAGE_SIZE;
        if file.write(&vec![0; size])? < size {
            drop(file);
            fs.remove(&name)?;
            return Err(VmError::SwapFull);
        }
        Ok(Self {
            name,
            file,
            stored: Bitmap::new(num_pages),
        })
    }
}

pub struct AddressSpace {
    pid: u32,
    exe: Executable,
    page_table: Vec<TranslationEntry>,
    swap: Option<Swap>,
}

impl AddressSpace {
    /// Lays out the space for `exe` plus the user stack. Every page starts
    /// unmapped; pages holding nothing but code are read-only.
    ///
    /// With `swap_fs`, the swap file is created on it right away.
    pub fn new(exe: Executable, pid: u32, swap_fs: Option<&FileSystem>) -> Result<Self, VmError> {
        let num_pages = (exe.size() + USER_STACK_SIZE).div_ceil(PAGE_SIZE);
        let page_table = (0..num_pages)
            .map(|vpn| {
                TranslationEntry::DEFAULT
                    .with_virtual_page(u24::new(vpn as u32))
                    .with_read_only(exe.is_code_only(vpn * PAGE_SIZE, PAGE_SIZE))
            })
            .collect();
        let swap = swap_fs
            .map(|fs| Swap::create(fs, pid, num_pages))
            .transpose()?;

        log::info!(
            "address space for process {pid}: {num_pages} pages, {} bytes{}",
            num_pages * PAGE_SIZE,
            if swap.is_some() { ", swapped" } else { "" }
        );
        Ok(Self {
            pid,
            exe,
            page_table,
            swap,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn num_pages(&self) -> usize {
        self.page_table.len()
    }

    pub fn entry(&self, vpn: usize) -> TranslationEntry {
        self.page_table[vpn]
    }

    pub fn swap_name(&self) -> Option<&str> {
        self.swap.as_ref().map(|swap| swap.name.as_str())
    }

    /// Whether the swap file holds the contents of `vpn`.
    pub fn is_swapped(&self, vpn: usize) -> bool {
        self.swap.as_ref().is_some_and(|swap| swap.stored.test(vpn))
    }

    pub(super) fn map(&mut self, vpn: usize, frame: usize) {
        let entry = &mut self.page_table[vpn];
        *entry = entry
            .with_physical_page(u24::new(frame as u32))
            .with_valid(true)
            .with_used(false)
            .with_dirty(false);
    }

    pub(super) fn unmap(&mut self, vpn: usize) {
        let entry = &mut self.page_table[vpn];
        *entry = entry.with_valid(false).with_dirty(false).with_used(false);
    }

    /// Folds the use and dirty bits of a TLB entry back into the table.
    pub(super) fn absorb(&mut self, cached: TranslationEntry) {
        let entry = &mut self.page_table[cached.vpn()];
        if entry.valid() && entry.frame() == cached.frame() {
            *entry = entry.with_bits_of(cached);
        }
    }

    pub(super) fn clear_used(&mut self, vpn: usize) {
        let entry = &mut self.page_table[vpn];
        *entry = entry.with_used(false);
    }

    /// Fills `frame` with the contents of page `vpn`: the swapped-out copy if
    /// there is one, else whatever the executable puts there, else zeros.
    ///
    /// Returns whether the page came from swap.
    pub(super) fn fill_page(&mut self, vpn: usize, frame: &mut [u8]) -> Result<bool, VmError> {
        frame.fill(0);
        if let Some(swap) = self.swap.as_ref().filter(|swap| swap.stored.test(vpn)) {
            swap.file.read_at(frame, vpn * PAGE_SIZE)?;
            return Ok(true);
        }
        self.exe.copy_page(vpn * PAGE_SIZE, frame);
        Ok(false)
    }

    /// Saves `frame`, the contents of `vpn`, to the swap file.
    pub(super) fn swap_out(&mut self, vpn: usize, frame: &[u8]) -> Result<(), VmError> {
        let Some(swap) = self.swap.as_mut() else {
            return Err(VmError::OutOfFrames);
        };
        if swap.file.write_at(frame, vpn * PAGE_SIZE)? < frame.len() {
            return Err(VmError::SwapFull);
        }
        swap.stored.mark(vpn);
        Ok(())
    }

    /// Closes and deletes the swap file, if any.
    pub(super) fn destroy(self, fs: &FileSystem) -> Result<(), VmError> {
        if let Some(Swap { name, file, .. }) = self.swap {
            drop(file);
            fs.remove(&name)?;
        }
        Ok(())
    }
}
