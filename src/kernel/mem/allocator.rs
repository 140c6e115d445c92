use alloc::sync::Arc;
use alloc::vec::Vec;

use slab_allocator::{ObjectCtor, ObjectDtor, SlabAllocator, SlabCache, SlabFlags, KMALLOC_MAX};
use zenith_mm::address::PAddr;
use zenith_mm::paging::{AllocFlags, PAGE_SIZE, PFN};
use zenith_sync::Spin;

use crate::kernel::mem::page_alloc::{BuddyPageAlloc, PageAllocator};
use crate::prelude::*;

pub type KernelSlabCache = SlabCache<BuddyPageAlloc>;

/// `kmalloc`/`kfree` plus the registry of every named object cache, so the
/// fault path's shrink sweep can reach them all.
pub struct Kmalloc {
    pmm: Arc<PageAllocator>,
    ladder: SlabAllocator<BuddyPageAlloc>,
    caches: Spin<Vec<Arc<KernelSlabCache>>>,
}

impl Kmalloc {
    pub fn new(pmm: Arc<PageAllocator>) -> Self {
        Self {
            ladder: SlabAllocator::new_in(pmm.frames().clone(), BuddyPageAlloc(pmm.clone())),
            pmm,
            caches: Spin::new(Vec::new()),
        }
    }

    fn large_order(size: usize) -> u32 {
        size.div_ceil(PAGE_SIZE).next_power_of_two().trailing_zeros()
    }

    /// Sizes within the ladder come from the power-of-two caches; anything
    /// larger is a direct page-allocator run.
    pub fn kmalloc(&self, size: usize) -> Option<PAddr> {
        if size == 0 {
            return None;
        }

        if size <= KMALLOC_MAX {
            self.ladder.alloc(size)
        } else {
            self.pmm
                .alloc_pages(Self::large_order(size), AllocFlags::ZERO)
                .map(PAddr::from)
        }
    }

    pub fn kfree(&self, object: PAddr, size: usize) {
        assert_ne!(size, 0, "kfree of a zero-sized object");

        if size <= KMALLOC_MAX {
            self.ladder.dealloc(object, size);
        } else {
            let pfn = PFN::from(object);
            self.pmm.frames().frame(pfn).put();
            self.pmm.free_pages(pfn, Self::large_order(size));
        }
    }

    pub fn cache_create(
        &self,
        name: &'static str,
        size: usize,
        align: usize,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
        flags: SlabFlags,
    ) -> KResult<Arc<KernelSlabCache>> {
        if size == 0 || (align != 0 && !align.is_power_of_two()) {
            return Err(KernelError::InvalidArgument);
        }

        let cache = Arc::new(SlabCache::new_in(
            name,
            size,
            align,
            ctor,
            dtor,
            flags,
            self.pmm.frames().clone(),
            BuddyPageAlloc(self.pmm.clone()),
        ));

        self.caches.lock().push(cache.clone());
        Ok(cache)
    }

    /// Release every empty slab in the system. Returns freed page count;
    /// the fault path retries a failed allocation once after this.
    pub fn cache_shrink_all(&self) -> usize {
        let mut freed = self.ladder.shrink();

        let caches = self.caches.lock().clone();
        for cache in caches {
            freed += cache.shrink();
        }

        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mem::page_alloc::tests::small_pmm;

    #[test]
    fn large_sizes_bypass_the_ladder() {
        let pmm = small_pmm(512);
        let kmalloc = Kmalloc::new(pmm.clone());

        let object = kmalloc.kmalloc(KMALLOC_MAX + 1).unwrap();
        assert_eq!(usize::from(object) % PAGE_SIZE, 0);

        let free_before = pmm.free_page_count();
        kmalloc.kfree(object, KMALLOC_MAX + 1);
        assert!(pmm.free_page_count() > free_before);
    }

    #[test]
    fn shrink_reaches_registered_caches() {
        let pmm = small_pmm(128);
        let kmalloc = Kmalloc::new(pmm.clone());

        let cache = kmalloc
            .cache_create("vma-objects", 192, 8, None, None, SlabFlags::empty())
            .unwrap();

        let object = cache.alloc().unwrap();
        cache.free(object);

        assert!(kmalloc.cache_shrink_all() > 0);
    }

    #[test]
    fn zero_size_is_rejected() {
        let pmm = small_pmm(64);
        let kmalloc = Kmalloc::new(pmm.clone());

        assert!(kmalloc.kmalloc(0).is_none());
        assert_eq!(
            kmalloc
                .cache_create("bad", 0, 8, None, None, SlabFlags::empty())
                .err(),
            Some(KernelError::InvalidArgument)
        );
    }
}
