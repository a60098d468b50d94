//! File system calls as user programs see them.
//!
//! Every call reports failure as a sentinel return value (and a debug log
//! line) rather than an error: user code never sees a [`fs::Error`].

use crate::fs::{self, FileSystem, OpenFile};
use crate::sync::mutex::Mutex;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::debug;

pub type Fd = i32;

pub const CONSOLE_INPUT: Fd = 0;
pub const CONSOLE_OUTPUT: Fd = 1;
const FIRST_FILE_FD: Fd = 2;

/// Open files of one process.
struct Descriptors {
    files: BTreeMap<Fd, OpenFile>,
    next: Fd,
}

impl Default for Descriptors {
    fn default() -> Self {
        Self {
            files: BTreeMap::new(),
            next: FIRST_FILE_FD,
        }
    }
}

pub struct SyscallTable {
    fs: Arc<FileSystem>,
    processes: Mutex<BTreeMap<u32, Descriptors>>,
    console_input: Mutex<VecDeque<u8>>,
    console_output: Mutex<Vec<u8>>,
}

fn status(call: &str, arg: &str, result: fs::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => {
            debug!("{call}({arg}): {err}");
            1
        }
    }
}

/// Swap files are held open by virtual memory for the life of their process;
/// user programs may not create, open or remove anything by that name.
fn is_swap_file(path: &str) -> bool {
    path.rsplit('/').next().is_some_and(|name| {
        name.strip_prefix("SWAP.")
            .is_some_and(|pid| !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit()))
    })
}

fn reserved(call: &str, path: &str) -> bool {
    if is_swap_file(path) {
        debug!("{call}({path}): reserved for swap");
        return true;
    }
    false
}

impl SyscallTable {
    pub fn new(fs: Arc<FileSystem>) -> Self {
        Self {
            fs,
            processes: Mutex::new(BTreeMap::new()),
            console_input: Mutex::new(VecDeque::new()),
            console_output: Mutex::new(Vec::new()),
        }
    }

    /// Returns 0 on success, 1 on failure.
    pub fn sys_create(&self, path: &str, is_directory: bool) -> i32 {
        debug!("create({path}, directory: {is_directory})");
        if reserved("create", path) {
            return 1;
        }
        let result = if is_directory {
            self.fs.create_directory(path)
        } else {
            self.fs.create(path)
        };
        status("create", path, result)
    }

    /// Returns 0 on success, 1 on failure. Blocks while the file is open.
    pub fn sys_remove(&self, path: &str) -> i32 {
        debug!("remove({path})");
        if reserved("remove", path) {
            return 1;
        }
        status("remove", path, self.fs.remove(path))
    }

    /// Returns the new descriptor, or -1.
    pub fn sys_open(&self, pid: u32, path: &str) -> Fd {
        debug!("open({path}) by process {pid}");
        if reserved("open", path) {
            return -1;
        }
        let file = match self.fs.open(path) {
            Ok(file) => file,
            Err(err) => {
                debug!("open({path}): {err}");
                return -1;
            }
        };
        let mut processes = self.processes.lock();
        let descriptors = processes.entry(pid).or_default();
        let fd = descriptors.next;
        descriptors.next += 1;
        descriptors.files.insert(fd, file);
        fd
    }

    /// Returns 0, or -1 if `fd` is not open.
    pub fn sys_close(&self, pid: u32, fd: Fd) -> i32 {
        debug!("close({fd}) by process {pid}");
        let file = self
            .processes
            .lock()
            .get_mut(&pid)
            .and_then(|descriptors| descriptors.files.remove(&fd));
        match file {
            Some(file) => {
                drop(file);
                0
            }
            None => {
                debug!("close({fd}): not open");
                -1
            }
        }
    }

    /// Returns the bytes read, 0 on failure.
    pub fn sys_read(&self, pid: u32, fd: Fd, buf: &mut [u8]) -> i32 {
        debug!("read({fd}, {}) by process {pid}", buf.len());
        if fd == CONSOLE_INPUT {
            let mut input = self.console_input.lock();
            let count = buf.len().min(input.len());
            for (slot, byte) in buf.iter_mut().zip(input.drain(..count)) {
                *slot = byte;
            }
            return count as i32;
        }
        self.with_file(pid, fd, "read", |file| file.read(buf))
    }

    /// Returns the bytes written, 0 on failure.
    pub fn sys_write(&self, pid: u32, fd: Fd, buf: &[u8]) -> i32 {
        debug!("write({fd}, {}) by process {pid}", buf.len());
        if fd == CONSOLE_OUTPUT {
            self.console_output.lock().extend_from_slice(buf);
            return buf.len() as i32;
        }
        self.with_file(pid, fd, "write", |file| file.write(buf))
    }

    fn with_file(
        &self,
        pid: u32,
        fd: Fd,
        call: &str,
        op: impl FnOnce(&mut OpenFile) -> fs::Result<usize>,
    ) -> i32 {
        let mut processes = self.processes.lock();
        let Some(file) = processes
            .get_mut(&pid)
            .and_then(|descriptors| descriptors.files.get_mut(&fd))
        else {
            debug!("{call}({fd}): not open");
            return 0;
        };
        match op(file) {
            Ok(count) => count as i32,
            Err(err) => {
                debug!("{call}({fd}): {err}");
                0
            }
        }
    }

    /// Copies the listing of the current directory into `buf`, cut short if
    /// it does not fit. Returns the bytes copied.
    pub fn sys_ls(&self, buf: &mut [u8]) -> i32 {
        debug!("ls");
        match self.fs.list() {
            Ok(listing) => {
                let count = listing.len().min(buf.len());
                buf[..count].copy_from_slice(&listing.as_bytes()[..count]);
                count as i32
            }
            Err(err) => {
                debug!("ls: {err}");
                0
            }
        }
    }

    /// Returns 0 on success, 1 on failure.
    pub fn sys_cd(&self, path: &str) -> i32 {
        debug!("cd({path})");
        status("cd", path, self.fs.change_directory(path))
    }

    /// Closes everything `pid` left open.
    pub fn exit(&self, pid: u32) {
        let descriptors = self.processes.lock().remove(&pid);
        if let Some(descriptors) = descriptors {
            debug!("process {pid} exits with {} open files", descriptors.files.len());
        }
    }

    pub fn push_console_input(&self, bytes: &[u8]) {
        self.console_input.lock().extend(bytes);
    }

    /// Everything written to the console so far, which is then forgotten.
    pub fn take_console_output(&self) -> Vec<u8> {
        core::mem::take(&mut *self.console_output.lock())
    }
}
