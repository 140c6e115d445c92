use super::addr::Addr;
use core::{
    fmt,
    ops::{Add, Sub},
};

/// A virtual address inside some address space.
#[repr(transparent)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct VAddr(usize);

impl VAddr {
    pub const NULL: Self = Self(0);

    pub const fn from_val(addr: usize) -> Self {
        Self(addr)
    }
}

impl Addr for VAddr {
    fn addr(self) -> usize {
        self.0
    }
}

impl From<usize> for VAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<VAddr> for usize {
    fn from(addr: VAddr) -> Self {
        addr.0
    }
}

impl Add<usize> for VAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<usize> for VAddr {
    type Output = Self;

    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl Sub for VAddr {
    type Output = usize;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl fmt::Debug for VAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VAddr({:#x})", self.0)
    }
}
