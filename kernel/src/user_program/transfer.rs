//! Copying between user memory and the kernel.

use crate::mem::{VirtualMemory, VmError};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CStrError {
    Null,
    /// No NUL within the allowed length.
    TooLong,
    BadUtf8,
    Fault(VmError),
}

impl fmt::Display for CStrError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CStrError::Null => write!(f, "null string address"),
            CStrError::TooLong => write!(f, "string too long"),
            CStrError::BadUtf8 => write!(f, "string is not UTF-8"),
            CStrError::Fault(err) => write!(f, "{err}"),
        }
    }
}

impl From<VmError> for CStrError {
    fn from(value: VmError) -> Self {
        CStrError::Fault(value)
    }
}

/// Reads a NUL-terminated string of at most `max_len` bytes (the NUL not
/// counted) from the running address space.
pub fn read_user_string(
    vm: &mut VirtualMemory,
    vaddr: usize,
    max_len: usize,
) -> Result<String, CStrError> {
    if vaddr == 0 {
        return Err(CStrError::Null);
    }
    let mut bytes = Vec::new();
    loop {
        let mut byte = [0];
        vm.read_user(vaddr + bytes.len(), &mut byte)?;
        if byte[0] == 0 {
            break;
        }
        if bytes.len() == max_len {
            return Err(CStrError::TooLong);
        }
        bytes.push(byte[0]);
    }
    String::from_utf8(bytes).map_err(|_| CStrError::BadUtf8)
}

pub fn read_user_buffer(vm: &mut VirtualMemory, vaddr: usize, len: usize) -> Result<Vec<u8>, VmError> {
    let mut buf = vec![0; len];
    vm.read_user(vaddr, &mut buf)?;
    Ok(buf)
}
