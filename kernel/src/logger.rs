//! Kernel log sink for the `log` facade.
//!
//! Lines are formatted as `[LEVEL target] message` and kept in a bounded ring
//! so tests and the shell can look at recent output. On the host they are
//! echoed to stderr as well.

use crate::sync::mutex::Mutex;
use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use log::{LevelFilter, Log, Metadata, Record};

/// Lines kept by [`recent`].
pub const LOG_CAPACITY: usize = 256;

pub struct KernelLogger {
    lines: Mutex<VecDeque<String>>,
}

static LOGGER: KernelLogger = KernelLogger::new();

impl KernelLogger {
    const fn new() -> Self {
        Self {
            lines: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == LOG_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("[{} {}] {}", record.level(), record.target(), record.args());
        #[cfg(not(target_os = "none"))]
        std::eprintln!("{line}");
        self.push(line);
    }

    fn flush(&self) {}
}

/// Installs the kernel logger at `level`. Later calls only change the level.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::info!("logger installed");
    }
    log::set_max_level(level);
}

/// The most recent log lines, oldest first.
pub fn recent() -> Vec<String> {
    LOGGER.lines.lock().iter().cloned().collect()
}
