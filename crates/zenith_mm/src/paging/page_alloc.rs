use bitflags::bitflags;

use super::PFN;

bitflags! {
    /// Allocation modifiers. The zone bits select where the run may come
    /// from; no bit set means the normal zone with fallback.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Restrict to the DMA zone.
        const DMA = 1 << 0;
        /// Allow the high-memory zone. Never set for kernel-internal
        /// allocations.
        const HIGHMEM = 1 << 1;
        /// Zero the run before returning it.
        const ZERO = 1 << 2;
    }
}

/// The page-allocation seam between the buddy system and its consumers.
/// Allocation never sleeps; exhaustion is `None`.
pub trait PageAlloc: Send + Sync {
    /// Allocate a naturally aligned run of `1 << order` frames and return
    /// its head, with one reference taken on the head frame.
    fn alloc_pages(&self, order: u32, flags: AllocFlags) -> Option<PFN>;

    fn alloc_page(&self, flags: AllocFlags) -> Option<PFN> {
        self.alloc_pages(0, flags)
    }

    /// Return a run previously obtained from `alloc_pages`. The frame must
    /// be an order-`order` buddy head; anything else is fatal.
    fn free_pages(&self, pfn: PFN, order: u32);
}
