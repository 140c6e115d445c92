#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

/// Upper bound on the number of CPUs a per-CPU table is ever sized for.
pub const MAX_CPUS: usize = 64;

/// Identifies one CPU. Per-CPU tables are indexed by it.
#[repr(transparent)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct CpuId(usize);

impl CpuId {
    pub const fn from_val(id: usize) -> Self {
        Self(id)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl From<usize> for CpuId {
    fn from(id: usize) -> Self {
        Self(id)
    }
}

impl From<CpuId> for usize {
    fn from(id: CpuId) -> Self {
        id.0
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU{}", self.0)
    }
}

/// One slot per possible CPU, sized at bring-up.
///
/// The slot type carries its own synchronization (atomics or a lock): a CPU
/// normally touches only its own slot, but cross-CPU paths (wake-up
/// targeting, shootdown posting) read and write remote slots as well.
pub struct PerCpu<T> {
    slots: Box<[T]>,
}

impl<T> PerCpu<T> {
    /// # Panics
    /// Panics if `nr_cpus` is zero or above [`MAX_CPUS`].
    pub fn new(nr_cpus: usize, mut init: impl FnMut(CpuId) -> T) -> Self {
        assert!(nr_cpus > 0 && nr_cpus <= MAX_CPUS, "bad CPU count");

        let slots = (0..nr_cpus)
            .map(|id| init(CpuId(id)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self { slots }
    }

    pub fn nr_cpus(&self) -> usize {
        self.slots.len()
    }

    /// # Panics
    /// Panics if `cpu` is out of range for this table.
    pub fn get(&self, cpu: CpuId) -> &T {
        &self.slots[cpu.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &T)> {
        self.slots.iter().enumerate().map(|(id, slot)| (CpuId(id), slot))
    }

    pub fn cpu_ids(&self) -> impl Iterator<Item = CpuId> {
        (0..self.slots.len()).map(CpuId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn slots_are_independent() {
        let table = PerCpu::new(4, |_| AtomicUsize::new(0));

        table.get(CpuId::from_val(2)).store(9, Ordering::Relaxed);

        assert_eq!(table.get(CpuId::from_val(2)).load(Ordering::Relaxed), 9);
        assert_eq!(table.get(CpuId::from_val(0)).load(Ordering::Relaxed), 0);
        assert_eq!(table.nr_cpus(), 4);
    }

    #[test]
    #[should_panic]
    fn out_of_range_access_panics() {
        let table = PerCpu::new(2, |_| 0usize);
        table.get(CpuId::from_val(2));
    }
}
