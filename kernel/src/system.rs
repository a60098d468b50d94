//! The assembled kernel: configuration, logging, the file system, virtual
//! memory and the system call layer, plus the table of running processes.

use crate::block::SynchDisk;
use crate::config::{ConfigError, KernelConfig};
use crate::fs::{self, FileSystem, FILE_PATH_MAX_LEN};
use crate::logger;
use crate::mem::{SpaceId, VirtualMemory, VmError};
use crate::sync::mutex::{Mutex, MutexGuard};
use crate::user_program::executable::Executable;
use crate::user_program::syscall::{Fd, SyscallTable};
use crate::user_program::transfer::{read_user_buffer, read_user_string, CStrError};
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use log::{debug, info};
use sectoros_shared::mem::PAGE_SIZE;

pub type Pid = u32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BootError {
    Config(ConfigError),
    Fs(fs::Error),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BootError::Config(err) => write!(f, "bad boot arguments: {err}"),
            BootError::Fs(err) => write!(f, "file system: {err}"),
        }
    }
}

impl core::error::Error for BootError {}

impl From<ConfigError> for BootError {
    fn from(value: ConfigError) -> Self {
        BootError::Config(value)
    }
}

impl From<fs::Error> for BootError {
    fn from(value: fs::Error) -> Self {
        BootError::Fs(value)
    }
}

/// A system call with its arguments as the user program passes them:
/// strings and buffers are user addresses.
#[derive(Clone, Copy, Debug)]
pub enum Syscall {
    Create { path: usize, is_directory: bool },
    Remove { path: usize },
    Open { path: usize },
    Close { fd: Fd },
    Read { buf: usize, size: usize, fd: Fd },
    Write { buf: usize, size: usize, fd: Fd },
    Ls { buf: usize, size: usize },
    Cd { path: usize },
}

pub struct Kernel {
    fs: Arc<FileSystem>,
    vm: Mutex<VirtualMemory>,
    syscalls: SyscallTable,
    processes: Mutex<BTreeMap<Pid, SpaceId>>,
    next_pid: AtomicU32,
}

impl Kernel {
    /// Parses `cmdline`, installs the logger and brings up the file system
    /// on `disk`, formatting it first if asked to.
    pub fn boot(cmdline: &str, disk: SynchDisk) -> Result<Self, BootError> {
        let config = KernelConfig::parse(cmdline)?;
        logger::init(config.log_level);

        let fs = if config.fs.format {
            FileSystem::format(disk, &config.fs)?
        } else {
            FileSystem::mount(disk, &config.fs)?
        };
        let fs = Arc::new(fs);
        info!(
            "virtual memory: {} frames, {} TLB slots, {:?} replacement, demand loading {}, swap {}",
            config.vm.num_frames,
            config.vm.tlb_size,
            config.vm.policy,
            config.vm.demand_loading,
            config.vm.swap
        );

        Ok(Self {
            vm: Mutex::new(VirtualMemory::new(&config.vm, fs.clone())),
            syscalls: SyscallTable::new(fs.clone()),
            fs,
            processes: Mutex::new(BTreeMap::new()),
            next_pid: AtomicU32::new(1),
        })
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub fn syscalls(&self) -> &SyscallTable {
        &self.syscalls
    }

    /// Locks the virtual memory manager.
    pub fn vm(&self) -> MutexGuard<VirtualMemory> {
        self.vm.lock()
    }

    /// Starts a process running the executable at `path`.
    pub fn exec(&self, path: &str) -> Result<Pid, VmError> {
        let exe = {
            let mut file = self.fs.open(path)?;
            Executable::load(&mut file)?
        };
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let space = self.vm.lock().create_space(exe, pid)?;
        self.processes.lock().insert(pid, space);
        info!("process {pid} runs {path}");
        Ok(pid)
    }

    /// Ends `pid`: closes its files and tears down its address space.
    pub fn exit(&self, pid: Pid) -> Result<(), VmError> {
        self.syscalls.exit(pid);
        let space = self
            .processes
            .lock()
            .remove(&pid)
            .ok_or(VmError::UnknownSpace(pid))?;
        self.vm.lock().destroy_space(space)
    }

    /// Locks virtual memory with `pid`'s address space running.
    fn enter(&self, pid: Pid) -> Result<MutexGuard<VirtualMemory>, VmError> {
        let space = *self
            .processes
            .lock()
            .get(&pid)
            .ok_or(VmError::UnknownSpace(pid))?;
        let mut vm = self.vm.lock();
        if vm.current() != Some(space) {
            vm.switch_to(space)?;
        }
        Ok(vm)
    }

    fn user_path(&self, pid: Pid, vaddr: usize) -> Result<String, CStrError> {
        read_user_string(&mut *self.enter(pid)?, vaddr, FILE_PATH_MAX_LEN)
    }

    /// Runs `call` on behalf of `pid` and returns what the program sees.
    ///
    /// Virtual memory is only locked while copying to or from the user, so
    /// a call that blocks in the file system holds up no one else.
    pub fn syscall(&self, pid: Pid, call: Syscall) -> i32 {
        match call {
            Syscall::Create { path, is_directory } => match self.user_path(pid, path) {
                Ok(path) => self.syscalls.sys_create(&path, is_directory),
                Err(err) => fault(pid, "create", err, 1),
            },
            Syscall::Remove { path } => match self.user_path(pid, path) {
                Ok(path) => self.syscalls.sys_remove(&path),
                Err(err) => fault(pid, "remove", err, 1),
            },
            Syscall::Open { path } => match self.user_path(pid, path) {
                Ok(path) => self.syscalls.sys_open(pid, &path),
                Err(err) => fault(pid, "open", err, -1),
            },
            Syscall::Close { fd } => self.syscalls.sys_close(pid, fd),
            Syscall::Read { buf, size, fd } => {
                if let Err(err) = self.check_buffer(pid, buf, size) {
                    return fault(pid, "read", err, 0);
                }
                let mut data = vec![0; size];
                let count = self.syscalls.sys_read(pid, fd, &mut data);
                self.copy_out(pid, "read", buf, &data[..count as usize], count)
            }
            Syscall::Write { buf, size, fd } => {
                if let Err(err) = self.check_buffer(pid, buf, size) {
                    return fault(pid, "write", err, 0);
                }
                let data = match self.enter(pid).and_then(|mut vm| read_user_buffer(&mut vm, buf, size)) {
                    Ok(data) => data,
                    Err(err) => return fault(pid, "write", err, 0),
                };
                self.syscalls.sys_write(pid, fd, &data)
            }
            Syscall::Ls { buf, size } => {
                if let Err(err) = self.check_buffer(pid, buf, size) {
                    return fault(pid, "ls", err, 0);
                }
                let mut listing = vec![0; size];
                let count = self.syscalls.sys_ls(&mut listing);
                self.copy_out(pid, "ls", buf, &listing[..count as usize], count)
            }
            Syscall::Cd { path } => match self.user_path(pid, path) {
                Ok(path) => self.syscalls.sys_cd(&path),
                Err(err) => fault(pid, "cd", err, 1),
            },
        }
    }

    /// Refuses a null buffer, or one reaching past the end of `pid`'s
    /// address space, before anything is allocated for it.
    fn check_buffer(&self, pid: Pid, vaddr: usize, size: usize) -> Result<(), VmError> {
        if vaddr == 0 {
            return Err(VmError::AddressOutOfRange { vaddr });
        }
        let space = *self
            .processes
            .lock()
            .get(&pid)
            .ok_or(VmError::UnknownSpace(pid))?;
        let limit = self
            .vm
            .lock()
            .space(space)
            .ok_or(VmError::UnknownSpace(space))?
            .num_pages()
            * PAGE_SIZE;
        match vaddr.checked_add(size) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(VmError::AddressOutOfRange {
                vaddr: vaddr.saturating_add(size),
            }),
        }
    }

    fn copy_out(&self, pid: Pid, call: &str, vaddr: usize, data: &[u8], count: i32) -> i32 {
        if data.is_empty() {
            return count;
        }
        match self.enter(pid).and_then(|mut vm| vm.write_user(vaddr, data)) {
            Ok(()) => count,
            Err(err) => fault(pid, call, err, 0),
        }
    }

    /// Disk and paging counters, one line each.
    pub fn statistics(&self) -> String {
        format!("{}\n{}", self.fs.disk(), self.vm.lock().stats())
    }
}

fn fault(pid: Pid, call: &str, err: impl fmt::Display, sentinel: i32) -> i32 {
    debug!("{call} by process {pid}: {err}");
    sentinel
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::block_core::test::blank_disk;

    const PATH: usize = 200;
    const MESSAGE: usize = 205;
    const SCRATCH: usize = 1024;

    /// Code at 0..200, then the data `/out\0hello, world\0`.
    fn program() -> alloc::vec::Vec<u8> {
        Executable::build(&[0x11; 200], b"/out\0hello, world\0", 0)
    }

    fn boot_with(cmdline: &str) -> Kernel {
        let kernel = Kernel::boot(cmdline, blank_disk()).unwrap();
        kernel.fs().create("/prog").unwrap();
        let mut file = kernel.fs().open("/prog").unwrap();
        let image = program();
        assert_eq!(file.write(&image).unwrap(), image.len());
        kernel
    }

    #[test]
    fn program_writes_and_reads_a_file() {
        let kernel = boot_with("format=on frames=4 tlb=2 policy=clock");
        let pid = kernel.exec("/prog").unwrap();

        let create = Syscall::Create {
            path: PATH,
            is_directory: false,
        };
        assert_eq!(kernel.syscall(pid, create), 0);
        assert_eq!(kernel.syscall(pid, create), 1);

        let fd = kernel.syscall(pid, Syscall::Open { path: PATH });
        assert_eq!(fd, 2);
        let write = Syscall::Write {
            buf: MESSAGE,
            size: 12,
            fd,
        };
        assert_eq!(kernel.syscall(pid, write), 12);
        assert_eq!(kernel.syscall(pid, Syscall::Close { fd }), 0);

        let fd = kernel.syscall(pid, Syscall::Open { path: PATH });
        let read = Syscall::Read {
            buf: SCRATCH,
            size: 64,
            fd,
        };
        assert_eq!(kernel.syscall(pid, read), 12);
        let mut copied = [0; 12];
        kernel.vm().read_user(SCRATCH, &mut copied).unwrap();
        assert_eq!(&copied, b"hello, world");

        let ls = Syscall::Ls {
            buf: SCRATCH,
            size: 64,
        };
        assert_eq!(kernel.syscall(pid, ls), 16);
        let mut listing = [0; 16];
        kernel.vm().read_user(SCRATCH, &mut listing).unwrap();
        assert_eq!(&listing, b"prog\nSWAP.1\nout\n");

        assert_eq!(kernel.syscall(pid, Syscall::Cd { path: PATH }), 1);
        kernel.exit(pid).unwrap();
        assert_eq!(kernel.fs().list().unwrap(), "prog\nout\n");
        assert!(kernel.fs().check());
        assert!(kernel.statistics().contains("Paging: faults"));
    }

    #[test]
    fn bad_user_arguments_are_sentinels() {
        let kernel = boot_with("format=on");
        let pid = kernel.exec("/prog").unwrap();

        // Code is read-only.
        let read = Syscall::Read {
            buf: 4,
            size: 4,
            fd: 0,
        };
        kernel.syscalls().push_console_input(b"abcd");
        assert_eq!(kernel.syscall(pid, read), 0);
        assert_eq!(kernel.syscall(pid, Syscall::Open { path: 0 }), -1);

        let end = kernel.vm().space(1).unwrap().num_pages() * PAGE_SIZE;
        assert_eq!(kernel.syscall(pid, Syscall::Cd { path: end }), 1);
        assert_eq!(kernel.syscall(99, Syscall::Remove { path: PATH }), 1);
        assert_eq!(kernel.exit(99), Err(VmError::UnknownSpace(99)));
    }

    #[test]
    fn processes_get_their_own_memory() {
        let kernel = boot_with("format=on frames=3 policy=fifo");
        let first = kernel.exec("/prog").unwrap();
        let second = kernel.exec("/prog").unwrap();
        kernel.syscalls().push_console_input(b"12");

        let read = |fd| Syscall::Read {
            buf: SCRATCH,
            size: 1,
            fd,
        };
        assert_eq!(kernel.syscall(first, read(0)), 1);
        assert_eq!(kernel.syscall(second, read(0)), 1);

        let write = Syscall::Write {
            buf: SCRATCH,
            size: 1,
            fd: 1,
        };
        assert_eq!(kernel.syscall(first, write), 1);
        assert_eq!(kernel.syscall(second, write), 1);
        assert_eq!(kernel.syscalls().take_console_output(), b"12");
    }

    #[test]
    fn oversized_buffers_are_refused() {
        let kernel = boot_with("format=on");
        let pid = kernel.exec("/prog").unwrap();
        kernel.syscalls().push_console_input(b"abcd");

        let huge = usize::MAX / 2;
        let read = Syscall::Read {
            buf: SCRATCH,
            size: huge,
            fd: 0,
        };
        assert_eq!(kernel.syscall(pid, read), 0);
        let write = Syscall::Write {
            buf: SCRATCH,
            size: huge,
            fd: 1,
        };
        assert_eq!(kernel.syscall(pid, write), 0);
        let ls = Syscall::Ls {
            buf: SCRATCH,
            size: huge,
        };
        assert_eq!(kernel.syscall(pid, ls), 0);
        let wraps = Syscall::Read {
            buf: usize::MAX,
            size: 2,
            fd: 0,
        };
        assert_eq!(kernel.syscall(pid, wraps), 0);

        // A null buffer is refused even when the size is fine.
        let null = Syscall::Read {
            buf: 0,
            size: 1,
            fd: 0,
        };
        assert_eq!(kernel.syscall(pid, null), 0);
        let null = Syscall::Write {
            buf: 0,
            size: 1,
            fd: 1,
        };
        assert_eq!(kernel.syscall(pid, null), 0);

        // None of that touched the console.
        let end = kernel.vm().space(1).unwrap().num_pages() * PAGE_SIZE;
        let last = Syscall::Read {
            buf: end - 4,
            size: 4,
            fd: 0,
        };
        assert_eq!(kernel.syscall(pid, last), 4);
        assert!(kernel.syscalls().take_console_output().is_empty());
    }

    #[test]
    fn swap_file_cannot_hold_up_exit() {
        let kernel = boot_with("format=on");
        let pid = kernel.exec("/prog").unwrap();
        // Any call that touches user memory runs the process.
        assert_eq!(kernel.syscall(pid, Syscall::Cd { path: PATH }), 1);
        kernel.vm().write_user(SCRATCH, b"/SWAP.1\0").unwrap();

        assert_eq!(kernel.syscall(pid, Syscall::Open { path: SCRATCH }), -1);
        assert_eq!(kernel.syscall(pid, Syscall::Remove { path: SCRATCH }), 1);
        kernel.exit(pid).unwrap();
        assert_eq!(kernel.fs().open("/SWAP.1").err(), Some(fs::Error::NotFound));
    }

    #[test]
    fn boot_failures() {
        assert!(matches!(
            Kernel::boot("frames=zero", blank_disk()),
            Err(BootError::Config(_))
        ));
        assert!(matches!(
            Kernel::boot("swap=on demand=off", blank_disk()),
            Err(BootError::Config(ConfigError::Inconsistent))
        ));
        let kernel = boot_with("format=on");
        assert_eq!(kernel.exec("/missing"), Err(VmError::Fs(fs::Error::NotFound)));
        kernel.fs().create("/junk").unwrap();
        assert_eq!(kernel.exec("/junk"), Err(VmError::InvalidExecutable));
    }
}
