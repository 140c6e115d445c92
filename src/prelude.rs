use core::fmt;

#[allow(unused_imports)]
pub(crate) use alloc::{boxed::Box, string::String, sync::Arc, vec, vec::Vec};

#[allow(unused_imports)]
pub(crate) use zenith_log::{
    print, println, println_debug, println_fatal, println_info, println_warn,
};

pub type KResult<T> = Result<T, KernelError>;

/// Every error kind the core surfaces. Invariant violations are not errors:
/// those panic with the caller's identity and a category string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    InvalidArgument,
    NoMemory,
    NoEntry,
    Busy,
    AlreadyExists,
    PermissionDenied,
    SegmentationViolation,
    Io,
    Timeout,
    WouldBlock,
    Deadlock,
    NotSupported,
}

impl KernelError {
    pub const fn errno(self) -> u32 {
        match self {
            KernelError::NoEntry => 2,
            KernelError::Io => 5,
            KernelError::WouldBlock => 11,
            KernelError::NoMemory => 12,
            KernelError::PermissionDenied => 13,
            KernelError::SegmentationViolation => 14,
            KernelError::Busy => 16,
            KernelError::AlreadyExists => 17,
            KernelError::InvalidArgument => 22,
            KernelError::Deadlock => 35,
            KernelError::NotSupported => 38,
            KernelError::Timeout => 110,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (errno {})", self, self.errno())
    }
}
