mod pte;

use alloc::collections::btree_map::BTreeMap;

use crate::address::{AddrOps as _, VAddr, VRange};
use crate::paging::PFN;

pub use pte::{PageAttribute, PTE};

/// The leaf level of one address space's translation structure, modeled as a
/// sorted map from page-aligned virtual addresses to [`PTE`]s.
///
/// The table carries no lock of its own: it lives inside the owning mm's
/// locked section, which is the only path that reaches it.
#[derive(Default)]
pub struct PageTable {
    entries: BTreeMap<VAddr, PTE>,
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, vaddr: VAddr, pfn: PFN, attr: PageAttribute) {
        assert!(vaddr.is_page_aligned());
        self.entries.insert(vaddr, PTE::new(pfn, attr));
    }

    pub fn get(&self, vaddr: VAddr) -> Option<&PTE> {
        self.entries.get(&vaddr.floor())
    }

    pub fn get_mut(&mut self, vaddr: VAddr) -> Option<&mut PTE> {
        self.entries.get_mut(&vaddr.floor())
    }

    /// Remove the entry, yielding the frame it pointed to.
    pub fn take(&mut self, vaddr: VAddr) -> Option<PTE> {
        self.entries.remove(&vaddr.floor())
    }

    pub fn iter_range(&self, range: VRange) -> impl Iterator<Item = (VAddr, &PTE)> {
        self.entries
            .range(range.start().floor()..range.end().ceil())
            .map(|(&vaddr, pte)| (vaddr, pte))
    }

    pub fn iter_range_mut(&mut self, range: VRange) -> impl Iterator<Item = (VAddr, &mut PTE)> {
        self.entries
            .range_mut(range.start().floor()..range.end().ceil())
            .map(|(&vaddr, pte)| (vaddr, pte))
    }

    /// Remove every entry in `range`, yielding what was mapped there.
    pub fn take_range(&mut self, range: VRange) -> impl Iterator<Item = (VAddr, PTE)> {
        let mut taken = self.entries.split_off(&range.start().floor());
        let mut rest = taken.split_off(&range.end().ceil());

        self.entries.append(&mut rest);
        taken.into_iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VAddr, &PTE)> {
        self.entries.iter().map(|(&vaddr, pte)| (vaddr, pte))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vaddr(addr: usize) -> VAddr {
        VAddr::from(addr)
    }

    #[test]
    fn set_get_take() {
        let mut table = PageTable::new();
        let attr = PageAttribute::PRESENT | PageAttribute::READ;

        table.set(vaddr(0x1000), PFN::from_val(7), attr);

        assert_eq!(table.get(vaddr(0x1234)).unwrap().pfn(), PFN::from_val(7));
        assert!(table.get(vaddr(0x2000)).is_none());

        let pte = table.take(vaddr(0x1000)).unwrap();
        assert_eq!(pte.pfn(), PFN::from_val(7));
        assert!(table.is_empty());
    }

    #[test]
    fn take_range_leaves_the_rest() {
        let mut table = PageTable::new();
        let attr = PageAttribute::PRESENT;

        for page in 0..8 {
            table.set(vaddr(page * 0x1000), PFN::from_val(page), attr);
        }

        let taken: alloc::vec::Vec<_> = table
            .take_range(VRange::new(vaddr(0x2000), vaddr(0x5000)))
            .collect();

        assert_eq!(taken.len(), 3);
        assert_eq!(table.len(), 5);
        assert!(table.get(vaddr(0x2000)).is_none());
        assert!(table.get(vaddr(0x5000)).is_some());
    }
}
