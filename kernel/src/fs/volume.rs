//! State shared by the file system manager and every open file: the disk,
//! the free-sector map's lock and the per-sector registration table.

use super::{file_header::HeaderChain, Bitmap, Result, FREE_MAP_SECTOR};
use crate::block::{BlockSector, SynchDisk};
use crate::sync::{
    completion::Completion,
    mutex::{Mutex, MutexGuard},
};
use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use once_cell::race::OnceBox;

/// Identifies one removal request so the last closer can tell the remover
/// that its wait is over.
pub type RemovalId = u32;

/// Where a sector stands in the open/remove lifecycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SectorPhase {
    /// Created, or never used, and not open.
    Fresh,
    /// At least one handle is open.
    Open,
    /// A remove is waiting for the last handle to close.
    Removing,
    Removed,
}

#[derive(Default)]
struct RegistrationState {
    removed: bool,
    removing: bool,
    count: usize,
    remover: Option<RemovalId>,
    pending: Option<Arc<Completion<RemovalId>>>,
    write_lock: Option<Arc<Mutex<()>>>,
}

/// Open-file bookkeeping for one sector.
///
/// The state mutex doubles as the close lock: opens, closes and the start
/// of a removal are all decided under it. The write lock lives here, not in
/// any handle, and exists only while the sector has open handles.
pub(super) struct Registration {
    state: Mutex<RegistrationState>,
    remove_lock: OnceBox<Mutex<()>>,
}

/// What the remover has to do after claiming a sector.
pub(super) enum RemovalStart {
    /// No handle is open; deallocate right away.
    Ready,
    /// Wait on this until the last handle closes.
    Wait(Arc<Completion<RemovalId>>),
}

impl Registration {
    fn new() -> Self {
        Self {
            state: Mutex::new(RegistrationState::default()),
            remove_lock: OnceBox::new(),
        }
    }

    /// Forget everything about a previous file that lived in this sector.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        assert_eq!(state.count, 0, "reusing a sector that is still open");
        *state = RegistrationState::default();
    }

    /// Counts a new handle, unless the sector is on its way out.
    pub fn open(&self) -> bool {
        let mut state = self.state.lock();
        if state.removing || state.removed {
            return false;
        }
        state.count += 1;
        if state.write_lock.is_none() {
            state.write_lock = Some(Arc::new(Mutex::new(())));
        }
        self.remove_lock.get_or_init(|| Box::new(Mutex::new(())));
        true
    }

    /// Drops a handle. The last one out frees the write lock and wakes a
    /// pending remover.
    pub fn close(&self) {
        let mut state = self.state.lock();
        assert!(state.count > 0, "closing a sector with no open handles");
        state.count -= 1;
        if state.count > 0 {
            return;
        }
        state.write_lock = None;
        if state.removing {
            if let (Some(pending), Some(remover)) = (state.pending.take(), state.remover) {
                pending.complete(remover);
            }
        }
    }

    /// The lock serializing writes through every handle of this sector.
    pub fn write_lock(&self) -> Arc<Mutex<()>> {
        let state = self.state.lock();
        match &state.write_lock {
            Some(lock) => lock.clone(),
            None => unreachable!("write through a sector with no open handles"),
        }
    }

    /// Lock held by a remover for the whole removal.
    pub fn remove_lock(&self) -> &Mutex<()> {
        self.remove_lock.get_or_init(|| Box::new(Mutex::new(())))
    }

    /// Claims the sector for removal, or returns `None` if it is already
    /// removed or another removal got there first.
    pub fn begin_removal(&self, remover: RemovalId) -> Option<RemovalStart> {
        let mut state = self.state.lock();
        if state.removed || state.removing {
            return None;
        }
        state.removing = true;
        state.remover = Some(remover);
        if state.count == 0 {
            return Some(RemovalStart::Ready);
        }
        let pending = Arc::new(Completion::new());
        state.pending = Some(pending.clone());
        Some(RemovalStart::Wait(pending))
    }

    pub fn finish_removal(&self) {
        let mut state = self.state.lock();
        state.removed = true;
        state.removing = false;
        state.remover = None;
    }

    /// Gives up on a removal that could not be carried out.
    pub fn abort_removal(&self) {
        let mut state = self.state.lock();
        state.removing = false;
        state.remover = None;
        state.pending = None;
    }

    pub fn phase(&self) -> SectorPhase {
        let state = self.state.lock();
        if state.removed {
            SectorPhase::Removed
        } else if state.removing {
            SectorPhase::Removing
        } else if state.count > 0 {
            SectorPhase::Open
        } else {
            SectorPhase::Fresh
        }
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().count
    }
}

pub(super) struct Volume {
    pub disk: SynchDisk,
    registrations: Box<[Registration]>,
    free_map: Mutex<()>,
}

impl Volume {
    pub fn new(disk: SynchDisk) -> Self {
        let registrations = (0..disk.num_sectors())
            .map(|_| Registration::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            disk,
            registrations,
            free_map: Mutex::new(()),
        }
    }

    pub fn registration(&self, sector: BlockSector) -> &Registration {
        &self.registrations[sector as usize]
    }

    pub fn num_sectors(&self) -> usize {
        self.registrations.len()
    }

    /// Bytes in the free-map file: one bit per sector.
    pub fn free_map_size(&self) -> usize {
        self.num_sectors().div_ceil(8)
    }

    /// Reads the free-sector map as it is on disk.
    pub fn fetch_free_map(&self) -> Result<Bitmap> {
        let mut bytes = vec![0; self.free_map_size()];
        HeaderChain::load(&self.disk, FREE_MAP_SECTOR)?.read_at(&self.disk, &mut bytes, 0)?;
        let mut map = Bitmap::new(self.num_sectors());
        map.load(&bytes);
        Ok(map)
    }

    pub fn write_free_map(&self, map: &Bitmap) -> Result<()> {
        HeaderChain::load(&self.disk, FREE_MAP_SECTOR)?.write_at(&self.disk, map.as_bytes(), 0)?;
        Ok(())
    }

    /// Holds off every other free-map update.
    pub fn lock_free_map(&self) -> MutexGuard<()> {
        self.free_map.lock()
    }

    /// Runs `f` on the latest on-disk free map and writes the result back,
    /// all under the free-map lock.
    ///
    /// The map is written back even when `f` reports failure, so allocations
    /// made before the failure stay recorded.
    pub fn with_free_map<T>(&self, f: impl FnOnce(&mut Bitmap) -> T) -> Result<T> {
        let _guard = self.free_map.lock();
        let mut map = self.fetch_free_map()?;
        let out = f(&mut map);
        self.write_free_map(&map)?;
        Ok(out)
    }
}
