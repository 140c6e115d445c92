use alloc::collections::btree_set::BTreeSet;

use zenith_mm::paging::{FrameTable, PageFlags, PFN};

/// One order's free list: the set of head PFNs free at that order.
pub struct FreeArea {
    pages: BTreeSet<PFN>,
}

impl FreeArea {
    pub const fn new() -> Self {
        Self {
            pages: BTreeSet::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.pages.len()
    }

    pub fn get_free_pages(&mut self, frames: &FrameTable) -> Option<PFN> {
        self.pages.pop_first().inspect(|&pfn| {
            frames.frame(pfn).flags.clear(PageFlags::BUDDY);
        })
    }

    pub fn add_pages(&mut self, frames: &FrameTable, pfn: PFN) {
        frames.frame(pfn).flags.set(PageFlags::BUDDY);
        let inserted = self.pages.insert(pfn);
        assert!(inserted, "frame freed twice at the same order");
    }

    pub fn del_pages(&mut self, frames: &FrameTable, pfn: PFN) {
        let removed = self.pages.remove(&pfn);
        assert!(
            removed && frames.frame(pfn).flags.has(PageFlags::BUDDY),
            "removing a frame that is not on this free list"
        );
        frames.frame(pfn).flags.clear(PageFlags::BUDDY);
    }

    pub fn contains(&self, pfn: PFN) -> bool {
        self.pages.contains(&pfn)
    }

    pub fn iter(&self) -> impl Iterator<Item = PFN> + '_ {
        self.pages.iter().copied()
    }
}
