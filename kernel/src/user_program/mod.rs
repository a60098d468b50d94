pub mod executable;
pub mod syscall;
pub mod transfer;
