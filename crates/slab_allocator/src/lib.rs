#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod slab_cache;

use alloc::sync::Arc;

use zenith_mm::address::PAddr;
use zenith_mm::paging::{FrameTable, PageAlloc};

pub use slab_cache::{ObjectCtor, ObjectDtor, SlabCache, SlabFlags};

/// Number of power-of-two general-purpose caches.
pub const KMALLOC_CACHES: usize = 13;
/// Smallest general-purpose object size.
pub const KMALLOC_MIN: usize = 32;
/// Largest size served from the caches; bigger requests go straight to the
/// page allocator.
pub const KMALLOC_MAX: usize = KMALLOC_MIN << (KMALLOC_CACHES - 1);

static KMALLOC_NAMES: [&str; KMALLOC_CACHES] = [
    "kmalloc-32",
    "kmalloc-64",
    "kmalloc-128",
    "kmalloc-256",
    "kmalloc-512",
    "kmalloc-1k",
    "kmalloc-2k",
    "kmalloc-4k",
    "kmalloc-8k",
    "kmalloc-16k",
    "kmalloc-32k",
    "kmalloc-64k",
    "kmalloc-128k",
];

/// The general-purpose allocator: a ladder of power-of-two caches.
pub struct SlabAllocator<A>
where
    A: PageAlloc + Clone,
{
    slabs: [SlabCache<A>; KMALLOC_CACHES],
}

impl<A> SlabAllocator<A>
where
    A: PageAlloc + Clone,
{
    pub fn new_in(frames: Arc<FrameTable>, alloc: A) -> Self {
        Self {
            slabs: core::array::from_fn(|i| {
                SlabCache::new_in(
                    KMALLOC_NAMES[i],
                    KMALLOC_MIN << i,
                    8,
                    None,
                    None,
                    SlabFlags::empty(),
                    frames.clone(),
                    alloc.clone(),
                )
            }),
        }
    }

    fn cache_index(size: usize) -> usize {
        let size = size.max(KMALLOC_MIN).next_power_of_two();
        (size.trailing_zeros() - KMALLOC_MIN.trailing_zeros()) as usize
    }

    pub fn alloc(&self, size: usize) -> Option<PAddr> {
        assert!(size <= KMALLOC_MAX, "size beyond the kmalloc ladder");
        self.slabs[Self::cache_index(size)].alloc()
    }

    pub fn dealloc(&self, object: PAddr, size: usize) {
        assert!(size <= KMALLOC_MAX, "size beyond the kmalloc ladder");
        self.slabs[Self::cache_index(size)].free(object);
    }

    /// Return empty slabs from every ladder cache; yields freed page count.
    pub fn shrink(&self) -> usize {
        self.slabs.iter().map(|cache| cache.shrink()).sum()
    }

    pub fn caches(&self) -> impl Iterator<Item = &SlabCache<A>> {
        self.slabs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buddy_allocator::Zone;
    use zenith_mm::paging::{AllocFlags, PAGE_SIZE, PFN};
    use zenith_sync::Spin;

    pub(crate) struct TestAlloc {
        pub frames: Arc<FrameTable>,
        pub zone: Arc<Spin<Zone>>,
    }

    impl Clone for TestAlloc {
        fn clone(&self) -> Self {
            Self {
                frames: self.frames.clone(),
                zone: self.zone.clone(),
            }
        }
    }

    impl TestAlloc {
        pub fn new(pages: usize) -> Self {
            let frames = Arc::new(FrameTable::new(PFN::from_val(0), pages));
            let mut zone = Zone::new(PFN::from_val(0), PFN::from_val(pages));
            zone.create_pages(&frames, PFN::from_val(0), PFN::from_val(pages));

            Self {
                frames,
                zone: Arc::new(Spin::new(zone)),
            }
        }
    }

    impl PageAlloc for TestAlloc {
        fn alloc_pages(&self, order: u32, _flags: AllocFlags) -> Option<PFN> {
            let pfn = self.zone.lock().get_free_pages(&self.frames, order)?;
            self.frames.frame(pfn).get();
            Some(pfn)
        }

        fn free_pages(&self, pfn: PFN, order: u32) {
            self.zone.lock().free_pages(&self.frames, pfn, order);
        }
    }

    #[test]
    fn ladder_indexing() {
        assert_eq!(SlabAllocator::<TestAlloc>::cache_index(1), 0);
        assert_eq!(SlabAllocator::<TestAlloc>::cache_index(32), 0);
        assert_eq!(SlabAllocator::<TestAlloc>::cache_index(33), 1);
        assert_eq!(SlabAllocator::<TestAlloc>::cache_index(4096), 7);
        assert_eq!(SlabAllocator::<TestAlloc>::cache_index(KMALLOC_MAX), 12);
    }

    #[test]
    fn alloc_roundtrip_through_the_ladder() {
        let backing = TestAlloc::new(256);
        let ladder = SlabAllocator::new_in(backing.frames.clone(), backing.clone());

        let small = ladder.alloc(48).unwrap();
        let large = ladder.alloc(3 * PAGE_SIZE).unwrap();
        assert_ne!(small, large);

        // Objects are cleared on allocation.
        assert!(backing.frames.check_pattern(small, 48, 0));
        assert!(backing.frames.check_pattern(large, 3 * PAGE_SIZE, 0));

        ladder.dealloc(small, 48);
        ladder.dealloc(large, 3 * PAGE_SIZE);

        let freed = ladder.shrink();
        assert!(freed > 0);
    }
}
