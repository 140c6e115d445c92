use super::addr::Addr;
use crate::paging::{PAGE_SIZE_BITS, PFN};
use core::{
    fmt,
    ops::{Add, Sub},
};

/// An address in the modeled physical address space.
#[repr(transparent)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct PAddr(usize);

impl Addr for PAddr {
    fn addr(self) -> usize {
        self.0
    }
}

impl PAddr {
    pub const fn from_val(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<usize> for PAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<PAddr> for usize {
    fn from(addr: PAddr) -> Self {
        addr.0
    }
}

impl From<PFN> for PAddr {
    fn from(pfn: PFN) -> Self {
        Self(usize::from(pfn) << PAGE_SIZE_BITS)
    }
}

impl Add<usize> for PAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<usize> for PAddr {
    type Output = Self;

    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl Sub for PAddr {
    type Output = usize;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl fmt::Debug for PAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PAddr({:#x})", self.0)
    }
}
