//! The file system manager: path resolution and the create, open, remove
//! and change-directory operations.
//!
//! One lock, the traversal lock, guards the current directory (its sector and
//! its table size). Every operation that resolves a path holds it, so a
//! temporary switch to another directory is never seen half done.

use super::{
    directory::{check_name, DIRECTORY_ENTRY_SIZE},
    file_header::HeaderChain,
    volume::{RemovalId, RemovalStart, Volume},
    Bitmap, Directory, Error, FileHeader, OpenFile, Result, SectorPhase, DIRECTORY_SECTOR,
    FREE_MAP_SECTOR, MAX_DIR_LEVEL,
};
use crate::block::{BlockSector, SynchDisk};
use crate::config::FsConfig;
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::{string::String, sync::Arc, vec::Vec};
use core::fmt::Write;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// A directory as the manager tracks it: where its header lives and how
/// many slots its table has.
#[derive(Clone, Copy, Debug)]
pub(super) struct WorkingDirectory {
    sector: BlockSector,
    size: usize,
}

/// Temporarily makes another directory current.
///
/// The previous directory and its size come back when the swap is dropped,
/// whichever way the operation ends.
struct DirectorySwap<'a> {
    active: &'a mut WorkingDirectory,
    saved: WorkingDirectory,
}

impl<'a> DirectorySwap<'a> {
    fn enter(active: &'a mut WorkingDirectory, target: WorkingDirectory) -> Self {
        let saved = core::mem::replace(active, target);
        Self { active, saved }
    }
}

impl Deref for DirectorySwap<'_> {
    type Target = WorkingDirectory;
    fn deref(&self) -> &WorkingDirectory {
        self.active
    }
}

impl DerefMut for DirectorySwap<'_> {
    fn deref_mut(&mut self) -> &mut WorkingDirectory {
        self.active
    }
}

impl Drop for DirectorySwap<'_> {
    fn drop(&mut self) {
        // The operation may have grown the very directory we came from.
        if self.saved.sector == self.active.sector {
            self.saved.size = self.active.size;
        }
        *self.active = self.saved;
    }
}

struct ParsedPath<'p> {
    absolute: bool,
    components: Vec<&'p str>,
}

fn parse_path(path: &str) -> Result<ParsedPath<'_>> {
    if path.is_empty() {
        return Err(Error::InvalidPath);
    }
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.len() > MAX_DIR_LEVEL {
        return Err(Error::PathTooDeep);
    }
    for name in &components {
        check_name(name)?;
    }
    Ok(ParsedPath {
        absolute: path.starts_with('/'),
        components,
    })
}

pub struct FileSystem {
    volume: Arc<Volume>,
    cwd: Mutex<WorkingDirectory>,
    directory_entries: usize,
    next_removal: AtomicU32,
}

impl FileSystem {
    /// Writes an empty volume to `disk`: a free map with only the two header
    /// sectors and their data in use, and an empty root directory.
    pub fn format(disk: SynchDisk, config: &FsConfig) -> Result<Self> {
        let volume = Volume::new(disk);
        let disk = &volume.disk;

        let mut free_map = Bitmap::new(volume.num_sectors());
        free_map.mark(FREE_MAP_SECTOR as usize);
        free_map.mark(DIRECTORY_SECTOR as usize);
        FileHeader::new().write_back(disk, FREE_MAP_SECTOR)?;
        FileHeader::new().write_back(disk, DIRECTORY_SECTOR)?;

        let map_size = volume.free_map_size();
        let root = Directory::new(config.directory_entries);
        let table_size = root.table_size() * DIRECTORY_ENTRY_SIZE;
        let map_len = HeaderChain::load(disk, FREE_MAP_SECTOR)?.extend(disk, &mut free_map, map_size)?;
        let root_len =
            HeaderChain::load(disk, DIRECTORY_SECTOR)?.extend(disk, &mut free_map, table_size)?;
        if map_len < map_size || root_len < table_size {
            return Err(Error::NoSpace);
        }

        volume.write_free_map(&free_map)?;
        root.write_back(&volume, DIRECTORY_SECTOR)?;
        log::info!(
            "formatted {} sectors, {} free",
            volume.num_sectors(),
            free_map.count_clear()
        );
        Self::with_volume(volume, config)
    }

    /// Opens the volume already on `disk`.
    pub fn mount(disk: SynchDisk, config: &FsConfig) -> Result<Self> {
        let volume = Volume::new(disk);
        let free = volume.fetch_free_map()?.count_clear();
        log::info!("mounted {} sectors, {} free", volume.num_sectors(), free);
        Self::with_volume(volume, config)
    }

    fn with_volume(volume: Volume, config: &FsConfig) -> Result<Self> {
        let root = directory_at(&volume, DIRECTORY_SECTOR)?;
        Ok(Self {
            volume: Arc::new(volume),
            cwd: Mutex::new(root),
            directory_entries: config.directory_entries,
            next_removal: AtomicU32::new(1),
        })
    }

    /// Reads the table of `at`, trusting the size the manager recorded.
    fn fetch(&self, at: &WorkingDirectory) -> Result<Directory> {
        let mut dir = Directory::new(at.size);
        dir.fetch_from(&self.volume, at.sector, false)?;
        Ok(dir)
    }

    /// Follows `components` from `at`, each of which must be a subdirectory.
    fn walk(&self, mut at: WorkingDirectory, components: &[&str]) -> Result<WorkingDirectory> {
        for name in components {
            let dir = self.fetch(&at)?;
            let sector = dir.find(name).ok_or(Error::NotFound)?;
            if !dir.find_directory(name) {
                return Err(Error::NotDirectory);
            }
            at = directory_at(&self.volume, sector)?;
        }
        Ok(at)
    }

    fn start_of(&self, path: &ParsedPath, cwd: &WorkingDirectory) -> Result<WorkingDirectory> {
        if path.absolute {
            directory_at(&self.volume, DIRECTORY_SECTOR)
        } else {
            Ok(*cwd)
        }
    }

    /// Splits `path` into the directory that holds its last component, and
    /// that component.
    fn resolve_parent<'p>(
        &self,
        cwd: &WorkingDirectory,
        path: &'p str,
    ) -> Result<(WorkingDirectory, &'p str, bool)> {
        let parsed = parse_path(path)?;
        let Some((name, parents)) = parsed.components.split_last() else {
            return Err(Error::InvalidPath);
        };
        let start = self.start_of(&parsed, cwd)?;
        let parent = self.walk(start, parents)?;
        let swapped = parsed.absolute || !parents.is_empty();
        Ok((parent, name, swapped))
    }

    /// Runs `op` with the parent directory of `path` as the current one.
    fn in_parent<T>(
        &self,
        path: &str,
        op: impl FnOnce(&mut WorkingDirectory, &str) -> Result<T>,
    ) -> Result<T> {
        let mut cwd = self.cwd.lock();
        let (parent, name, swapped) = self.resolve_parent(&cwd, path)?;
        if !swapped {
            return op(&mut cwd, name);
        }
        let mut scope = DirectorySwap::enter(&mut cwd, parent);
        op(&mut scope, name)
    }

    /// Creates an empty file.
    pub fn create(&self, path: &str) -> Result<()> {
        self.in_parent(path, |at, name| self.create_in(at, name, false))
    }

    /// Creates an empty directory with a table of the configured size.
    pub fn create_directory(&self, path: &str) -> Result<()> {
        self.in_parent(path, |at, name| self.create_in(at, name, true))
    }

    fn create_in(&self, at: &mut WorkingDirectory, name: &str, is_directory: bool) -> Result<()> {
        let mut dir = self.fetch(at)?;
        if dir.find(name).is_some() {
            return Err(Error::Exists);
        }

        let disk = &self.volume.disk;
        let table = Directory::new(self.directory_entries);
        let table_size = table.table_size() * DIRECTORY_ENTRY_SIZE;
        let sector = self.volume.with_free_map(|free_map| {
            let sector = free_map.find().ok_or(Error::NoSpace)? as BlockSector;
            FileHeader::new().write_back(disk, sector)?;
            if is_directory {
                let mut chain = HeaderChain::load(disk, sector)?;
                if chain.extend(disk, free_map, table_size)? < table_size {
                    chain.deallocate(free_map);
                    return Err(Error::NoSpace);
                }
            }
            Ok(sector)
        })??;

        let linked = (|| {
            if is_directory {
                table.write_back(&self.volume, sector)?;
            }
            dir.add(name, sector, is_directory)?;
            dir.write_back(&self.volume, at.sector)
        })();
        if let Err(err) = linked {
            let chain = HeaderChain::load(disk, sector)?;
            self.volume.with_free_map(|free_map| chain.deallocate(free_map))?;
            return Err(err);
        }

        self.volume.registration(sector).reset();
        at.size = dir.table_size();
        log::debug!(
            "created {} {name} at sector {sector}",
            if is_directory { "directory" } else { "file" }
        );
        Ok(())
    }

    /// Opens an existing file. A file whose removal is under way is not found.
    pub fn open(&self, path: &str) -> Result<OpenFile> {
        let cwd = self.cwd.lock();
        let (parent, name, _) = self.resolve_parent(&cwd, path)?;
        let dir = self.fetch(&parent)?;
        let sector = dir.find(name).ok_or(Error::NotFound)?;
        if dir.find_directory(name) {
            return Err(Error::IsDirectory);
        }
        OpenFile::open(self.volume.clone(), sector)
    }

    /// Deletes a file, or an empty directory.
    ///
    /// If the file is open the call waits for the last handle to close before
    /// releasing anything; meanwhile the file can no longer be opened.
    pub fn remove(&self, path: &str) -> Result<()> {
        let remover: RemovalId = self.next_removal.fetch_add(1, Ordering::Relaxed);

        let mut cwd = self.cwd.lock();
        let (parent, name, _) = self.resolve_parent(&cwd, path)?;
        let dir = self.fetch(&parent)?;
        let sector = dir.find(name).ok_or(Error::NotFound)?;
        if dir.find_directory(name) {
            if sector == cwd.sector {
                return Err(Error::Busy);
            }
            if !Directory::load(&self.volume, sector)?.is_empty() {
                return Err(Error::NotEmpty);
            }
        }

        let registration = self.volume.registration(sector);
        let start = registration
            .begin_removal(remover)
            .ok_or(Error::NotFound)?;
        let _remove_guard = registration.remove_lock().lock();
        if let RemovalStart::Wait(pending) = start {
            log::debug!(
                "remove {path}: waiting for {} open handles",
                registration.open_count()
            );
            drop(cwd);
            let signalled = pending.wait();
            assert_eq!(signalled, remover, "woken for someone else's removal");
            cwd = self.cwd.lock();
        }

        let result = self.finish_remove(&cwd, parent.sector, name, sector);
        match result {
            Ok(()) => registration.finish_removal(),
            Err(_) => registration.abort_removal(),
        }
        result
    }

    fn finish_remove(
        &self,
        cwd: &WorkingDirectory,
        parent_sector: BlockSector,
        name: &str,
        sector: BlockSector,
    ) -> Result<()> {
        let mut dir = if parent_sector == cwd.sector {
            self.fetch(cwd)?
        } else {
            Directory::load(&self.volume, parent_sector)?
        };
        dir.remove(name)?;

        let chain = HeaderChain::load(&self.volume.disk, sector)?;
        self.volume
            .with_free_map(|free_map| chain.deallocate(free_map))?;
        dir.write_back(&self.volume, parent_sector)?;
        log::debug!("removed {name} from sector {sector}");
        Ok(())
    }

    /// Makes `path` the current directory for every later relative path.
    pub fn change_directory(&self, path: &str) -> Result<()> {
        let mut cwd = self.cwd.lock();
        let parsed = parse_path(path)?;
        let start = self.start_of(&parsed, &cwd)?;
        *cwd = self.walk(start, &parsed.components)?;
        Ok(())
    }

    /// Listing of the current directory.
    pub fn list(&self) -> Result<String> {
        let cwd = self.cwd.lock();
        Ok(self.fetch(&cwd)?.list())
    }

    /// Listing of the directory at `path`.
    pub fn list_path(&self, path: &str) -> Result<String> {
        let cwd = self.cwd.lock();
        let parsed = parse_path(path)?;
        let start = self.start_of(&parsed, &cwd)?;
        let at = self.walk(start, &parsed.components)?;
        Ok(self.fetch(&at)?.list())
    }

    /// Slots in the current directory's table.
    pub fn current_directory_size(&self) -> usize {
        self.cwd.lock().size
    }

    pub fn phase(&self, sector: BlockSector) -> SectorPhase {
        self.volume.registration(sector).phase()
    }

    pub fn free_sectors(&self) -> Result<usize> {
        let _guard = self.volume.lock_free_map();
        Ok(self.volume.fetch_free_map()?.count_clear())
    }

    pub fn disk(&self) -> &SynchDisk {
        &self.volume.disk
    }

    pub(super) fn volume(&self) -> &Volume {
        &self.volume
    }

    pub(super) fn lock_traversal(&self) -> MutexGuard<WorkingDirectory> {
        self.cwd.lock()
    }

    /// Human-readable dump of the free map, then every header and directory
    /// table reachable from the root.
    pub fn print(&self) -> Result<String> {
        let _cwd = self.cwd.lock();
        let mut out = String::new();
        let _ = write!(out, "{}", self.volume.fetch_free_map()?);
        let _ = write!(out, "Free map ");
        self.print_chain(&mut out, FREE_MAP_SECTOR)?;
        self.print_directory(&mut out, "/", DIRECTORY_SECTOR, 0)?;
        let _ = writeln!(out, "{}", self.volume.disk);
        Ok(out)
    }

    fn print_chain(&self, out: &mut String, sector: BlockSector) -> Result<()> {
        for (at, header) in HeaderChain::load(&self.volume.disk, sector)?.links() {
            let _ = write!(out, "[{at}] {header}");
        }
        Ok(())
    }

    fn print_directory(
        &self,
        out: &mut String,
        name: &str,
        sector: BlockSector,
        depth: usize,
    ) -> Result<()> {
        let dir = Directory::load(&self.volume, sector)?;
        let _ = writeln!(out, "Directory {name}");
        self.print_chain(out, sector)?;
        let _ = write!(out, "{dir}");
        if depth >= MAX_DIR_LEVEL {
            return Ok(());
        }
        for entry in dir.entries() {
            let entry_name = entry.name().unwrap_or("?");
            if entry.is_directory() {
                self.print_directory(out, entry_name, entry.sector(), depth + 1)?;
            } else {
                let _ = write!(out, "File {entry_name} ");
                self.print_chain(out, entry.sector())?;
            }
        }
        Ok(())
    }
}

/// The directory whose header is at `sector`, sized from its file length.
fn directory_at(volume: &Volume, sector: BlockSector) -> Result<WorkingDirectory> {
    let length = HeaderChain::load(&volume.disk, sector)?.length();
    Ok(WorkingDirectory {
        sector,
        size: length / DIRECTORY_ENTRY_SIZE,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::{block_core::test::blank_disk, MemDisk};
    use crate::fs::{HEADER_CAPACITY, NUM_DIR_ENTRIES};
    use std::io::{Read, Write as _};
    use std::thread;

    fn fresh() -> FileSystem {
        FileSystem::format(blank_disk(), &FsConfig::default()).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| b"0123456789"[i % 10]).collect()
    }

    fn write_file(fs: &FileSystem, path: &str, data: &[u8]) {
        fs.create(path).unwrap();
        let mut file = fs.open(path).unwrap();
        assert_eq!(file.write(data).unwrap(), data.len());
    }

    fn read_file(fs: &FileSystem, path: &str) -> Vec<u8> {
        let mut file = fs.open(path).unwrap();
        let mut buf = vec![0; file.length().unwrap()];
        assert_eq!(file.read(&mut buf).unwrap(), buf.len());
        buf
    }

    #[test]
    fn format_gives_empty_root() {
        let fs = fresh();
        assert_eq!(fs.list().unwrap(), "\n");
        assert_eq!(fs.current_directory_size(), NUM_DIR_ENTRIES);
        // Both headers, one free map sector and two root table sectors.
        assert_eq!(fs.free_sectors().unwrap(), fs.disk().num_sectors() as usize - 5);
        assert!(fs.check());
    }

    #[test]
    fn write_then_read() {
        let fs = fresh();
        let data = pattern(300);
        write_file(&fs, "f", &data);
        assert_eq!(read_file(&fs, "f"), data);

        let mut file = fs.open("f").unwrap();
        let mut buf = [0; 5];
        assert_eq!(file.read_at(&mut buf, 10).unwrap(), 5);
        assert_eq!(&buf, b"01234");
        assert_eq!(file.tell(), 0);
        assert_eq!(file.write_at(b"abc", 298).unwrap(), 2);
        assert_eq!(file.length().unwrap(), 300);

        file.seek(295);
        let mut tail = [0; 10];
        assert_eq!(file.read(&mut tail).unwrap(), 5);
        assert_eq!(&tail[..5], b"567ab");
        assert!(fs.check());
    }

    #[test]
    fn one_byte_past_a_header_links_another() {
        let fs = fresh();
        fs.create("big").unwrap();
        let mut file = fs.open("big").unwrap();
        let data = pattern(HEADER_CAPACITY + 1);
        assert_eq!(file.write(&data[..HEADER_CAPACITY]).unwrap(), HEADER_CAPACITY);
        assert_eq!(file.current_sector(), file.sector());

        assert_eq!(file.write(&data[HEADER_CAPACITY..]).unwrap(), 1);
        assert_ne!(file.current_sector(), file.sector());
        drop(file);

        assert_eq!(read_file(&fs, "big"), data);
        assert!(fs.check());
    }

    #[test]
    fn hierarchy_end_to_end() {
        let fs = fresh();
        fs.create_directory("/a").unwrap();
        fs.create("/a/f").unwrap();
        let data = pattern(3000);
        {
            let mut file = fs.open("/a/f").unwrap();
            assert_eq!(file.write(&data).unwrap(), 3000);
        }

        fs.change_directory("/a").unwrap();
        let mut file = fs.open("f").unwrap();
        let mut buf = vec![0; 3000];
        assert_eq!(file.read(&mut buf).unwrap(), 3000);
        assert_eq!(buf, data);

        assert_eq!(fs.list_path("/").unwrap(), "a/\n");
        assert_eq!(fs.list().unwrap(), "f\n");
        fs.change_directory("/").unwrap();
        assert_eq!(fs.list().unwrap(), "a/\n");
        assert!(fs.check());
    }

    #[test]
    fn absolute_paths_leave_cwd_alone() {
        let fs = FileSystem::format(
            blank_disk(),
            &FsConfig {
                directory_entries: 1,
                ..FsConfig::default()
            },
        )
        .unwrap();
        fs.create_directory("d").unwrap();
        assert_eq!(fs.current_directory_size(), 1);

        // Grow /d while the root stays current.
        fs.create("/d/x").unwrap();
        fs.create("/d/y").unwrap();
        assert_eq!(fs.current_directory_size(), 1);
        assert_eq!(fs.list().unwrap(), "d/\n");
        assert_eq!(fs.list_path("d").unwrap(), "x\ny\n");

        // A failing walk restores just the same.
        assert_eq!(fs.create("/d/missing/z"), Err(Error::NotFound));
        assert_eq!(fs.list().unwrap(), "d/\n");

        // Growing the current directory through an absolute path sticks.
        fs.create("/e").unwrap();
        assert_eq!(fs.current_directory_size(), 2);
        assert_eq!(fs.list().unwrap(), "d/\ne\n");
        assert!(fs.check());
    }

    #[test]
    fn directory_grows_one_slot_at_a_time() {
        let fs = FileSystem::format(
            blank_disk(),
            &FsConfig {
                directory_entries: 2,
                ..FsConfig::default()
            },
        )
        .unwrap();
        for (i, name) in ["a", "b", "c", "d"].into_iter().enumerate() {
            fs.create(name).unwrap();
            assert_eq!(fs.current_directory_size(), 2.max(i + 1));
        }
        assert_eq!(fs.list().unwrap(), "a\nb\nc\nd\n");
        fs.remove("b").unwrap();
        assert_eq!(fs.current_directory_size(), 4);
        fs.create("e").unwrap();
        assert_eq!(fs.current_directory_size(), 4);
        assert!(fs.check());
    }

    #[test]
    fn error_cases() {
        let fs = fresh();
        fs.create("f").unwrap();
        fs.create_directory("d").unwrap();
        fs.create("d/inner").unwrap();

        assert_eq!(fs.create("f"), Err(Error::Exists));
        assert_eq!(fs.create_directory("d"), Err(Error::Exists));
        assert!(matches!(fs.open("nope"), Err(Error::NotFound)));
        assert!(matches!(fs.open("d"), Err(Error::IsDirectory)));
        assert_eq!(fs.create("f/x"), Err(Error::NotDirectory));
        assert_eq!(fs.change_directory("f"), Err(Error::NotDirectory));
        assert_eq!(fs.create("0123456789abcdef"), Err(Error::NameTooLong));
        assert_eq!(fs.create("/"), Err(Error::InvalidPath));
        assert_eq!(fs.create(""), Err(Error::InvalidPath));
        assert_eq!(fs.create("/a/b/c/d/e/f/g/h/i/j/k"), Err(Error::PathTooDeep));
        assert_eq!(fs.remove("d"), Err(Error::NotEmpty));
        assert_eq!(fs.remove("ghost"), Err(Error::NotFound));

        fs.change_directory("d").unwrap();
        assert_eq!(fs.remove("/d"), Err(Error::Busy));
        fs.remove("inner").unwrap();
        fs.change_directory("/").unwrap();
        fs.remove("d").unwrap();
        assert_eq!(fs.list().unwrap(), "f\n");
        assert!(fs.check());
    }

    #[test]
    fn remove_returns_every_sector() {
        let fs = fresh();
        let before = fs.free_sectors().unwrap();
        write_file(&fs, "f", &pattern(HEADER_CAPACITY * 2 + 10));
        assert!(fs.free_sectors().unwrap() < before);

        fs.remove("f").unwrap();
        assert_eq!(fs.free_sectors().unwrap(), before);
        assert!(matches!(fs.open("f"), Err(Error::NotFound)));
        assert_eq!(fs.remove("f"), Err(Error::NotFound));
        assert!(fs.check());
    }

    #[test]
    fn remove_waits_for_open_handles() {
        let fs = Arc::new(fresh());
        write_file(&fs, "f", &pattern(500));
        let handles: Vec<_> = (0..3).map(|_| fs.open("f").unwrap()).collect();
        let sector = handles[0].sector();
        assert_eq!(fs.phase(sector), SectorPhase::Open);
        let free_before = fs.free_sectors().unwrap();

        let remover = {
            let fs = fs.clone();
            thread::spawn(move || fs.remove("f"))
        };
        while fs.phase(sector) != SectorPhase::Removing {
            thread::yield_now();
        }

        // Removing: no new handles, nothing freed yet.
        assert!(matches!(fs.open("f"), Err(Error::NotFound)));
        assert_eq!(fs.free_sectors().unwrap(), free_before);

        let mut handles = handles.into_iter();
        let mut last = handles.next().unwrap();
        let mut buf = [0; 10];
        assert_eq!(last.read(&mut buf).unwrap(), 10);
        drop(handles);
        assert!(!remover.is_finished());
        assert_eq!(fs.phase(sector), SectorPhase::Removing);

        drop(last);
        assert_eq!(remover.join().unwrap(), Ok(()));
        assert_eq!(fs.phase(sector), SectorPhase::Removed);
        assert!(fs.free_sectors().unwrap() > free_before);
        assert!(fs.check());
    }

    #[test]
    fn remove_waits_for_busy_threads() {
        let fs = Arc::new(fresh());
        fs.create("shared").unwrap();
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let mut file = fs.open("shared").unwrap();
                thread::spawn(move || {
                    file.seek(i * 200);
                    for _ in 0..20 {
                        file.write(&[i as u8; 10]).unwrap();
                        thread::yield_now();
                    }
                })
            })
            .collect();

        let sector = {
            let cwd = fs.lock_traversal();
            fs.fetch(&cwd).unwrap().find("shared").unwrap()
        };
        fs.remove("shared").unwrap();
        // Remove only comes back once every worker has closed its handle.
        assert_eq!(fs.phase(sector), SectorPhase::Removed);
        assert_eq!(fs.volume.registration(sector).open_count(), 0);
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(fs.check());
    }

    #[test]
    fn concurrent_writers_do_not_share_sectors() {
        let fs = Arc::new(fresh());
        fs.create("log").unwrap();
        let chunk = 1000;
        let writers: Vec<_> = (0..3)
            .map(|i| {
                let mut file = fs.open("log").unwrap();
                thread::spawn(move || {
                    file.seek(i * chunk);
                    for _ in 0..10 {
                        assert_eq!(file.write(&[b'a' + i as u8; 100]).unwrap(), 100);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let contents = read_file(&fs, "log");
        assert_eq!(contents.len(), 3 * chunk);
        for (i, part) in contents.chunks(chunk).enumerate() {
            assert!(part.iter().all(|&b| b == b'a' + i as u8));
        }
        assert!(fs.check());
    }

    #[test]
    fn full_disk_gives_short_write() {
        let fs = FileSystem::format(SynchDisk::new(MemDisk::new(64)), &FsConfig::default()).unwrap();
        fs.create("f").unwrap();
        let mut file = fs.open("f").unwrap();
        let wanted = 64 * sectoros_shared::sizes::SECTOR_SIZE;
        let written = file.write(&pattern(wanted)).unwrap();
        assert!(written > 0 && written < wanted);
        assert_eq!(file.length().unwrap(), written);
        assert_eq!(file.tell(), written);
        drop(file);

        assert_eq!(read_file(&fs, "f"), pattern(written));
        assert!(fs.check());
    }

    #[test]
    fn check_spots_a_lost_sector() {
        let fs = fresh();
        write_file(&fs, "f", &pattern(500));
        assert!(fs.check());

        let sector = {
            let file = fs.open("f").unwrap();
            HeaderChain::load(fs.disk(), file.sector()).unwrap().byte_to_sector(0)
        };
        fs.volume
            .with_free_map(|free_map| free_map.clear(sector as usize))
            .unwrap();
        assert!(!fs.check());
    }

    /// Overwrites `bytes` at `offset` of `sector`, behind the file system's back.
    fn scribble(fs: &FileSystem, sector: BlockSector, offset: usize, bytes: &[u8]) {
        let mut buf = [0; sectoros_shared::sizes::SECTOR_SIZE];
        fs.disk().read_sector(sector, &mut buf).unwrap();
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        fs.disk().write_sector(sector, &buf).unwrap();
    }

    /// Header sector and first data sector of the file at `path`.
    fn first_block(fs: &FileSystem, path: &str) -> (BlockSector, BlockSector) {
        let file = fs.open(path).unwrap();
        let chain = HeaderChain::load(fs.disk(), file.sector()).unwrap();
        (file.sector(), chain.byte_to_sector(0))
    }

    // Offset of the first direct sector inside a header.
    const FIRST_DIRECT: usize = 8;
    // Offset of the name inside a directory entry.
    const ENTRY_NAME: usize = 8;

    /// Points `b`'s first data block somewhere else and frees the block it
    /// had, so the only damage is where the pointer now leads.
    fn redirect_first_block(fs: &FileSystem, to: BlockSector) {
        let (header, lost) = first_block(fs, "b");
        scribble(fs, header, FIRST_DIRECT, &to.to_le_bytes());
        fs.volume
            .with_free_map(|free_map| free_map.clear(lost as usize))
            .unwrap();
    }

    #[test]
    fn check_spots_a_shared_sector() {
        let fs = fresh();
        write_file(&fs, "a", &pattern(300));
        write_file(&fs, "b", &pattern(300));
        assert!(fs.check());

        let (_, shared) = first_block(&fs, "a");
        redirect_first_block(&fs, shared);
        assert!(!fs.check());
    }

    #[test]
    fn check_spots_a_sector_past_the_disk() {
        let fs = fresh();
        write_file(&fs, "a", &pattern(300));
        write_file(&fs, "b", &pattern(300));
        assert!(fs.check());

        redirect_first_block(&fs, 99_999);
        assert!(!fs.check());
    }

    #[test]
    fn check_spots_a_duplicate_name() {
        let fs = fresh();
        write_file(&fs, "a", b"first");
        write_file(&fs, "b", b"second");
        assert!(fs.check());

        // Root table: "a" in slot 0, "b" in slot 1.
        let table = HeaderChain::load(fs.disk(), DIRECTORY_SECTOR).unwrap().byte_to_sector(0);
        scribble(&fs, table, DIRECTORY_ENTRY_SIZE + ENTRY_NAME, b"a");
        assert_eq!(fs.list().unwrap(), "a\na\n");
        assert!(!fs.check());
    }

    #[test]
    fn check_spots_an_unterminated_name() {
        let fs = fresh();
        write_file(&fs, "a", b"first");
        write_file(&fs, "b", b"second");
        assert!(fs.check());

        let table = HeaderChain::load(fs.disk(), DIRECTORY_SECTOR).unwrap().byte_to_sector(0);
        scribble(&fs, table, DIRECTORY_ENTRY_SIZE + ENTRY_NAME, &[b'x'; 16]);
        assert!(!fs.check());
    }

    #[test]
    fn print_walks_everything() {
        let fs = fresh();
        fs.create_directory("docs").unwrap();
        write_file(&fs, "/docs/readme", b"hello");
        let dump = fs.print().unwrap();
        assert!(dump.starts_with("Bitmap set: 0 1 2 3 4"));
        assert!(dump.contains("Directory docs"));
        assert!(dump.contains("File readme [8] File header: 5 bytes, blocks: 9"));
    }

    #[test]
    fn volume_survives_a_compressed_image() {
        let fs = fresh();
        fs.create_directory("a").unwrap();
        let data = pattern(5000);
        write_file(&fs, "/a/f", &data);

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&fs.disk().dump().unwrap()).unwrap();
        let compressed = encoder.finish().unwrap();
        drop(fs);

        let mut image = vec![];
        flate2::read::GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut image)
            .unwrap();
        let disk = SynchDisk::new(MemDisk::from_image(image).unwrap());
        let fs = FileSystem::mount(disk, &FsConfig::default()).unwrap();
        assert!(fs.check());
        assert_eq!(fs.list().unwrap(), "a/\n");
        assert_eq!(read_file(&fs, "/a/f"), data);
    }
}
