//! Kernel-wide error currency. Every fallible core operation returns
//! `Result<T, KernelError>`; the syscall boundary maps these down to the
//! small, stable negative codes user programs see (see `to_user_errno`).

use core::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KernelError {
    InvalidArgument,
    OutOfMemory,
    Io,
    NotFound,
    BadFormat,
    NotImplemented,
    SlotTaken,
    BadPath,
}

pub type KResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelError::InvalidArgument => "invalid argument",
            KernelError::OutOfMemory => "out of memory",
            KernelError::Io => "i/o error",
            KernelError::NotFound => "not found",
            KernelError::BadFormat => "bad format",
            KernelError::NotImplemented => "not implemented",
            KernelError::SlotTaken => "slot taken",
            KernelError::BadPath => "bad path",
        };
        f.write_str(s)
    }
}

/// Stable user-ABI error codes, returned as small negative integers from
/// system calls.
pub const EINVAL: i64 = -1;
pub const ENOMEM: i64 = -2;
pub const EIO: i64 = -3;
pub const ENOENT: i64 = -4;
pub const ENOSYS: i64 = -5;
pub const EPERM: i64 = -6;

pub fn to_user_errno(e: KernelError) -> i64 {
    match e {
        KernelError::InvalidArgument => EINVAL,
        KernelError::OutOfMemory => ENOMEM,
        KernelError::Io => EIO,
        KernelError::NotFound => ENOENT,
        KernelError::BadPath => ENOENT,
        KernelError::NotImplemented => ENOSYS,
        KernelError::SlotTaken => EPERM,
        KernelError::BadFormat => EINVAL,
    }
}
