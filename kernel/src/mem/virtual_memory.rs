//! The virtual memory manager.
//!
//! One `VirtualMemory` owns the machine, the coremap, the replacement policy
//! and every address space. It is meant to live behind a single lock: a
//! fault in one process may evict a page of another, which touches both page
//! tables and the coremap at once.

use super::{
    page_replacement, AddressSpace, Coremap, Fault, FrameUsage, Machine, ReplacementPolicy,
    SpaceId, VmError,
};
use crate::config::VmConfig;
use crate::fs::FileSystem;
use crate::user_program::executable::Executable;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use log::{debug, info, trace};
use sectoros_shared::mem::PAGE_SIZE;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct VmStats {
    /// Accesses to a page that was not in memory.
    pub page_faults: u64,
    pub tlb_misses: u64,
    pub pages_to_swap: u64,
    pub pages_from_swap: u64,
}

impl fmt::Display for VmStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "Paging: faults {}, TLB misses {}, to swap {}, from swap {}",
            self.page_faults, self.tlb_misses, self.pages_to_swap, self.pages_from_swap
        )
    }
}

pub struct VirtualMemory {
    fs: Arc<FileSystem>,
    demand_loading: bool,
    swap: bool,
    machine: Machine,
    coremap: Coremap,
    policy: Box<dyn ReplacementPolicy>,
    spaces: BTreeMap<SpaceId, AddressSpace>,
    current: Option<SpaceId>,
    next_id: SpaceId,
    stats: VmStats,
}

impl VirtualMemory {
    pub fn new(config: &VmConfig, fs: Arc<FileSystem>) -> Self {
        let policy = page_replacement::build(config.policy, config.seed);
        Self::with_policy(config, fs, policy)
    }

    pub fn with_policy(
        config: &VmConfig,
        fs: Arc<FileSystem>,
        policy: Box<dyn ReplacementPolicy>,
    ) -> Self {
        Self {
            fs,
            demand_loading: config.demand_loading,
            swap: config.swap,
            machine: Machine::new(config.num_frames, config.tlb_size),
            coremap: Coremap::new(config.num_frames),
            policy,
            spaces: BTreeMap::new(),
            current: None,
            next_id: 1,
            stats: VmStats::default(),
        }
    }

    /// Builds an address space for `exe`.
    ///
    /// Without demand loading every page gets a frame now, and the whole
    /// program is copied in; if there are not enough free frames nothing is
    /// claimed and [`VmError::OutOfFrames`] is returned.
    pub fn create_space(&mut self, exe: Executable, pid: u32) -> Result<SpaceId, VmError> {
        let id = self.next_id;
        let swap_fs = self.swap.then_some(&*self.fs);
        let mut space = AddressSpace::new(exe, pid, swap_fs)?;

        if !self.demand_loading {
            if space.num_pages() > self.coremap.count_clear() {
                debug!(
                    "process {pid} needs {} frames, {} free",
                    space.num_pages(),
                    self.coremap.count_clear()
                );
                space.destroy(&self.fs)?;
                return Err(VmError::OutOfFrames);
            }
            for vpn in 0..space.num_pages() {
                let frame = self.coremap.find(id, vpn).ok_or(VmError::OutOfFrames)?;
                space.map(vpn, frame);
                space.fill_page(vpn, self.machine.frame_mut(frame))?;
            }
        }

        self.next_id += 1;
        self.spaces.insert(id, space);
        Ok(id)
    }

    /// Frees every frame of the space and deletes its swap file.
    pub fn destroy_space(&mut self, id: SpaceId) -> Result<(), VmError> {
        let space = self.spaces.remove(&id).ok_or(VmError::UnknownSpace(id))?;
        if self.current == Some(id) {
            self.machine.flush_tlb();
            self.current = None;
        }
        let frames: Vec<usize> = self.coremap.frames_of(id).collect();
        for frame in frames {
            self.coremap.clear(frame);
        }
        info!("destroyed address space {id} of process {}", space.pid());
        space.destroy(&self.fs)
    }

    /// Context switch: saves the TLB bits of the running space into its page
    /// table, then starts `id` with an empty TLB.
    pub fn switch_to(&mut self, id: SpaceId) -> Result<(), VmError> {
        if !self.spaces.contains_key(&id) {
            return Err(VmError::UnknownSpace(id));
        }
        self.save_state();
        self.current = Some(id);
        trace!("switched to address space {id}");
        Ok(())
    }

    fn save_state(&mut self) {
        let cached = self.machine.flush_tlb();
        if let Some(space) = self.current.and_then(|id| self.spaces.get_mut(&id)) {
            for entry in cached {
                space.absorb(entry);
            }
        }
    }

    /// Brings page `vpn` of space `id` into a frame, evicting another page
    /// if memory is full and swapping is on. Returns the frame.
    ///
    /// # Panics
    ///
    /// Panics if the page is already in memory.
    pub fn load_page(&mut self, id: SpaceId, vpn: usize) -> Result<usize, VmError> {
        let space = self.spaces.get(&id).ok_or(VmError::UnknownSpace(id))?;
        if vpn >= space.num_pages() {
            return Err(VmError::AddressOutOfRange {
                vaddr: vpn * PAGE_SIZE,
            });
        }
        assert!(
            !space.entry(vpn).valid(),
            "page {vpn} of space {id} is already loaded"
        );

        let frame = match self.coremap.find(id, vpn) {
            Some(frame) => frame,
            None if self.swap => self.evict_for(id, vpn)?,
            None => return Err(VmError::OutOfFrames),
        };

        let space = self.spaces.get_mut(&id).ok_or(VmError::UnknownSpace(id))?;
        space.map(vpn, frame);
        match space.fill_page(vpn, self.machine.frame_mut(frame)) {
            Ok(true) => self.stats.pages_from_swap += 1,
            Ok(false) => {}
            Err(err) => {
                space.unmap(vpn);
                self.coremap.clear(frame);
                return Err(err);
            }
        }
        trace!("page {vpn} of space {id} loaded into frame {frame}");
        Ok(frame)
    }

    /// Picks a frame to reuse for page `vpn` of `id` and writes its current
    /// page out. The frame comes back owned by `(id, vpn)`.
    fn evict_for(&mut self, id: SpaceId, vpn: usize) -> Result<usize, VmError> {
        let mut usage: Vec<FrameUsage> = (0..self.coremap.len())
            .map(|frame| self.frame_usage(frame, (id, vpn)))
            .collect();
        let victim = self
            .policy
            .select_victim(&mut usage)
            .ok_or(VmError::OutOfFrames)?;
        assert!(usage[victim].eligible, "policy chose ineligible frame {victim}");

        for (frame, frame_usage) in usage.iter().enumerate() {
            if frame_usage.eligible && !frame_usage.used {
                self.clear_used(frame);
            }
        }

        self.write_out(victim)?;
        self.coremap.mark(victim, id, vpn);
        Ok(victim)
    }

    /// The freshest view of the page in `frame`: its page table entry with
    /// the TLB's bits if the TLB holds it.
    fn frame_usage(&self, frame: usize, faulting: (SpaceId, usize)) -> FrameUsage {
        let Some(owner) = self.coremap.owner(frame) else {
            return FrameUsage::default();
        };
        let Some(space) = self.spaces.get(&owner.0) else {
            panic!("frame {frame} belongs to missing space {}", owner.0);
        };
        let mut entry = space.entry(owner.1);
        if let Some(cached) = self.machine.tlb_entry_for(frame) {
            entry = entry.with_bits_of(cached);
        }
        FrameUsage {
            used: entry.used(),
            dirty: entry.dirty(),
            eligible: entry.valid() && entry.frame() == frame && owner != faulting,
        }
    }

    fn clear_used(&mut self, frame: usize) {
        if let Some((owner, vpn)) = self.coremap.owner(frame) {
            if let Some(space) = self.spaces.get_mut(&owner) {
                space.clear_used(vpn);
            }
            self.machine.tlb_clear_used(frame);
        }
    }

    /// Unmaps the page in `frame` from its owner, saving it to the owner's
    /// swap file first if it was modified.
    fn write_out(&mut self, frame: usize) -> Result<(), VmError> {
        let Some((owner, vpn)) = self.coremap.owner(frame) else {
            panic!("evicting free frame {frame}");
        };
        let Some(space) = self.spaces.get_mut(&owner) else {
            panic!("frame {frame} belongs to missing space {owner}");
        };
        if let Some(cached) = self.machine.tlb_take_frame(frame) {
            space.absorb(cached);
        }
        let dirty = space.entry(vpn).dirty();
        if dirty {
            space.swap_out(vpn, self.machine.frame(frame))?;
            self.stats.pages_to_swap += 1;
        }
        space.unmap(vpn);
        trace!(
            "evicted page {vpn} of space {owner} from frame {frame}{}",
            if dirty { " to swap" } else { "" }
        );
        Ok(())
    }

    /// Services a TLB miss at `vaddr` in the running space: loads the page
    /// if needed, then caches its translation, returning the displaced
    /// entry's bits to the page table.
    pub fn handle_page_fault(&mut self, vaddr: usize) -> Result<(), VmError> {
        let id = self.current.ok_or(VmError::NoCurrentSpace)?;
        self.stats.tlb_misses += 1;

        let vpn = vaddr / PAGE_SIZE;
        let space = self.spaces.get(&id).ok_or(VmError::UnknownSpace(id))?;
        if vpn >= space.num_pages() {
            return Err(VmError::AddressOutOfRange { vaddr });
        }
        if !space.entry(vpn).valid() {
            self.stats.page_faults += 1;
            self.load_page(id, vpn)?;
        }

        let space = self.spaces.get_mut(&id).ok_or(VmError::UnknownSpace(id))?;
        let displaced = self.machine.tlb_refill(space.entry(vpn));
        if displaced.valid() {
            space.absorb(displaced);
        }
        Ok(())
    }

    fn translate(&mut self, vaddr: usize, writing: bool) -> Result<usize, VmError> {
        loop {
            match self.machine.translate(vaddr, writing) {
                Ok(paddr) => return Ok(paddr),
                Err(Fault::TlbMiss { vaddr }) => self.handle_page_fault(vaddr)?,
                Err(Fault::ReadOnly { vaddr }) => return Err(VmError::ReadOnly { vaddr }),
            }
        }
    }

    /// Copies user memory at `vaddr` of the running space into `buf`.
    pub fn read_user(&mut self, vaddr: usize, buf: &mut [u8]) -> Result<(), VmError> {
        for (i, byte) in buf.iter_mut().enumerate() {
            let paddr = self.translate(vaddr + i, false)?;
            *byte = self.machine.read_byte(paddr);
        }
        Ok(())
    }

    /// Copies `data` into user memory at `vaddr` of the running space.
    pub fn write_user(&mut self, vaddr: usize, data: &[u8]) -> Result<(), VmError> {
        for (i, &byte) in data.iter().enumerate() {
            let paddr = self.translate(vaddr + i, true)?;
            self.machine.write_byte(paddr, byte);
        }
        Ok(())
    }

    pub fn current(&self) -> Option<SpaceId> {
        self.current
    }

    pub fn space(&self, id: SpaceId) -> Option<&AddressSpace> {
        self.spaces.get(&id)
    }

    pub fn free_frames(&self) -> usize {
        self.coremap.count_clear()
    }

    pub fn stats(&self) -> VmStats {
        self.stats
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::block_core::test::blank_disk;
    use crate::config::{FsConfig, ReplacementKind};
    use crate::mem::page_replacement::Fifo;
    use crate::sync::mutex::Mutex;

    const CODE_LEN: usize = 300;
    const DATA_LEN: usize = 200;
    /// Where in each page the stamps go: past the end of the code in the
    /// page shared by code and data.
    const STAMP_OFFSET: usize = PAGE_SIZE - 4;

    fn program() -> Executable {
        let code: Vec<u8> = (0..CODE_LEN).map(|i| (i % 251) as u8).collect();
        let data: Vec<u8> = (0..DATA_LEN).map(|i| (i % 13) as u8 + 100).collect();
        Executable::from_bytes(Executable::build(&code, &data, 100)).unwrap()
    }

    fn file_system() -> Arc<FileSystem> {
        Arc::new(FileSystem::format(blank_disk(), &FsConfig::default()).unwrap())
    }

    fn config(policy: ReplacementKind, num_frames: usize) -> VmConfig {
        VmConfig {
            policy,
            num_frames,
            tlb_size: 2,
            seed: 3,
            ..VmConfig::default()
        }
    }

    /// A byte unique to page `vpn` and round `round`.
    fn stamp(vpn: usize, round: usize) -> u8 {
        (vpn * 7 + round * 31) as u8
    }

    /// Writes a stamp into every writable page, then checks every page.
    fn thrash(vm: &mut VirtualMemory, id: SpaceId, round: usize) {
        let num_pages = vm.space(id).unwrap().num_pages();
        let first_writable = CODE_LEN.div_ceil(PAGE_SIZE);
        for vpn in first_writable..num_pages {
            let page = [stamp(vpn, round); 3];
            vm.write_user(vpn * PAGE_SIZE + STAMP_OFFSET, &page).unwrap();
        }
        for vpn in first_writable..num_pages {
            let mut page = [0; 3];
            vm.read_user(vpn * PAGE_SIZE + STAMP_OFFSET, &mut page).unwrap();
            assert_eq!(page, [stamp(vpn, round); 3], "page {vpn}");
        }
    }

    fn check_code(vm: &mut VirtualMemory) {
        let mut code = vec![0; CODE_LEN];
        vm.read_user(0, &mut code).unwrap();
        assert!(code.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
    }

    #[test]
    fn pages_survive_eviction_under_every_policy() {
        for policy in [ReplacementKind::Fifo, ReplacementKind::Clock, ReplacementKind::Random] {
            let mut vm = VirtualMemory::new(&config(policy, 4), file_system());
            let id = vm.create_space(program(), 1).unwrap();
            vm.switch_to(id).unwrap();

            check_code(&mut vm);
            thrash(&mut vm, id, 0);
            thrash(&mut vm, id, 1);
            check_code(&mut vm);

            let stats = vm.stats();
            assert!(stats.page_faults > 4, "{policy:?}: {stats}");
            assert!(stats.pages_to_swap > 0, "{policy:?}: {stats}");
            assert!(stats.pages_from_swap > 0, "{policy:?}: {stats}");
            assert!(stats.tlb_misses >= stats.page_faults);
            assert_eq!(vm.free_frames(), 0);
        }
    }

    /// Checks every choice of the wrapped policy.
    struct Audited {
        inner: Fifo,
        choices: Arc<Mutex<Vec<(usize, usize)>>>,
    }

    impl ReplacementPolicy for Audited {
        fn select_victim(&mut self, frames: &mut [FrameUsage]) -> Option<usize> {
            let eligible = frames.iter().filter(|frame| frame.eligible).count();
            let victim = self.inner.select_victim(frames)?;
            self.choices.lock().push((victim, eligible));
            Some(victim)
        }
    }

    #[test]
    fn victims_are_resident_pages() {
        let choices = Arc::new(Mutex::new(Vec::new()));
        let policy = Audited {
            inner: Fifo::default(),
            choices: choices.clone(),
        };
        let mut vm =
            VirtualMemory::with_policy(&config(ReplacementKind::Fifo, 3), file_system(), Box::new(policy));
        let id = vm.create_space(program(), 1).unwrap();
        vm.switch_to(id).unwrap();
        thrash(&mut vm, id, 0);

        let choices = choices.lock();
        assert!(!choices.is_empty());
        // Memory is full whenever the policy runs, and the faulting page is
        // never among the candidates.
        assert!(choices.iter().all(|&(_, eligible)| eligible == 3));
    }

    #[test]
    fn eviction_goes_through_the_owner() {
        let mut vm = VirtualMemory::new(&config(ReplacementKind::Clock, 4), file_system());
        let a = vm.create_space(program(), 1).unwrap();
        let b = vm.create_space(program(), 2).unwrap();

        vm.switch_to(a).unwrap();
        thrash(&mut vm, a, 5);
        vm.switch_to(b).unwrap();
        thrash(&mut vm, b, 6);

        // B's faults took every frame from A; A's pages must still read back.
        vm.switch_to(a).unwrap();
        let num_pages = vm.space(a).unwrap().num_pages();
        for vpn in CODE_LEN.div_ceil(PAGE_SIZE)..num_pages {
            let mut byte = [0];
            vm.read_user(vpn * PAGE_SIZE + STAMP_OFFSET + 1, &mut byte).unwrap();
            assert_eq!(byte[0], stamp(vpn, 5));
        }
        check_code(&mut vm);
        assert!(vm.space(a).unwrap().is_swapped(num_pages - 1));
    }

    #[test]
    fn clean_pages_are_not_swapped() {
        let mut vm = VirtualMemory::new(&config(ReplacementKind::Fifo, 2), file_system());
        let id = vm.create_space(program(), 1).unwrap();
        vm.switch_to(id).unwrap();
        for _ in 0..3 {
            check_code(&mut vm);
            let mut data = vec![0; DATA_LEN];
            vm.read_user(CODE_LEN, &mut data).unwrap();
            assert!(data.iter().enumerate().all(|(i, &b)| b == (i % 13) as u8 + 100));
        }
        assert_eq!(vm.stats().pages_to_swap, 0);
        assert_eq!(vm.stats().pages_from_swap, 0);
    }

    #[test]
    fn eager_loading_claims_every_frame() {
        let eager = VmConfig {
            demand_loading: false,
            swap: false,
            ..VmConfig::default()
        };
        let mut vm = VirtualMemory::new(&eager, file_system());
        let id = vm.create_space(program(), 1).unwrap();
        let num_pages = vm.space(id).unwrap().num_pages();
        assert_eq!(vm.free_frames(), eager.num_frames - num_pages);

        vm.switch_to(id).unwrap();
        check_code(&mut vm);
        assert_eq!(vm.stats().page_faults, 0);
        assert!(vm.stats().tlb_misses > 0);

        // A second copy does not fit, and takes nothing.
        assert_eq!(vm.create_space(program(), 2), Err(VmError::OutOfFrames));
        assert_eq!(vm.free_frames(), eager.num_frames - num_pages);
        vm.destroy_space(id).unwrap();
        assert_eq!(vm.free_frames(), eager.num_frames);
    }

    #[test]
    fn demand_loading_without_swap_runs_out() {
        let no_swap = VmConfig {
            swap: false,
            ..config(ReplacementKind::Fifo, 2)
        };
        let mut vm = VirtualMemory::new(&no_swap, file_system());
        let id = vm.create_space(program(), 1).unwrap();
        vm.switch_to(id).unwrap();
        let mut buf = [0; 1];
        vm.read_user(0, &mut buf).unwrap();
        vm.read_user(PAGE_SIZE, &mut buf).unwrap();
        assert_eq!(vm.read_user(2 * PAGE_SIZE, &mut buf), Err(VmError::OutOfFrames));
    }

    #[test]
    fn access_errors() {
        let mut vm = VirtualMemory::new(&config(ReplacementKind::Fifo, 4), file_system());
        let mut buf = [0; 1];
        assert_eq!(vm.read_user(0, &mut buf), Err(VmError::NoCurrentSpace));

        let id = vm.create_space(program(), 1).unwrap();
        vm.switch_to(id).unwrap();
        assert_eq!(vm.write_user(5, &[1]), Err(VmError::ReadOnly { vaddr: 5 }));

        let end = vm.space(id).unwrap().num_pages() * PAGE_SIZE;
        assert_eq!(
            vm.read_user(end, &mut buf),
            Err(VmError::AddressOutOfRange { vaddr: end })
        );
        assert_eq!(vm.switch_to(99), Err(VmError::UnknownSpace(99)));
    }

    #[test]
    fn swap_file_lives_with_the_space() {
        let fs = file_system();
        let mut vm = VirtualMemory::new(&config(ReplacementKind::Random, 4), fs.clone());
        let id = vm.create_space(program(), 17).unwrap();
        assert_eq!(vm.space(id).unwrap().swap_name(), Some("/SWAP.17"));
        assert_eq!(fs.list().unwrap(), "SWAP.17\n");
        let swap_len = fs.open("SWAP.17").unwrap().length().unwrap();
        assert_eq!(swap_len, vm.space(id).unwrap().num_pages() * PAGE_SIZE);

        vm.switch_to(id).unwrap();
        thrash(&mut vm, id, 2);
        vm.destroy_space(id).unwrap();
        assert_eq!(fs.list().unwrap(), "\n");
        assert_eq!(vm.current(), None);
        assert_eq!(vm.free_frames(), 4);
        assert!(fs.check());
    }
}
