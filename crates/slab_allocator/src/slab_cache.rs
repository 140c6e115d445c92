use alloc::collections::{btree_map::BTreeMap, btree_set::BTreeSet};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use zenith_mm::address::PAddr;
use zenith_mm::paging::{AllocFlags, FrameTable, PageAlloc, PageFlags, PAGE_SIZE, PFN};
use zenith_sync::Spin;

pub const CACHE_LINE_SIZE: usize = 64;

const POISON_BYTE: u8 = 0x6b;
const RED_ZONE_BYTE: u8 = 0xbb;
const RED_ZONE_SIZE: usize = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlabFlags: u32 {
        /// Round the alignment up to the cache-line size.
        const HWCACHE_ALIGN = 1 << 0;
        /// Back the cache with DMA-zone frames only.
        const CACHE_DMA = 1 << 1;
        /// Fill freed objects with a pattern and check it on reallocation.
        const POISON = 1 << 2;
        /// Keep canaries around every object and check them on free.
        const RED_ZONE = 1 << 3;
    }
}

pub type ObjectCtor = fn(&mut [u8]) -> Result<(), ()>;
pub type ObjectDtor = fn(&mut [u8]);

/// Per-slab occupancy. The slab itself is the frame run headed by the PFN
/// this record is keyed under; tail frames point back at the head through
/// their private cookie.
struct Slab {
    free: Vec<u16>,
    allocated: BTreeSet<u16>,
}

struct SlabLists {
    empty_list: BTreeSet<PFN>,
    partial_list: BTreeSet<PFN>,
    full_list: BTreeSet<PFN>,
    slabs: BTreeMap<PFN, Slab>,
}

/// A named pool of fixed-size objects carved out of page runs.
pub struct SlabCache<A>
where
    A: PageAlloc,
{
    name: &'static str,
    object_size: usize,
    /// Slot pitch: object plus red zones, rounded up to the alignment.
    stride: usize,
    /// Byte offset of the object within its slot.
    object_offset: usize,
    slab_order: u32,
    objects_per_slab: usize,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectDtor>,
    flags: SlabFlags,
    frames: Arc<FrameTable>,
    alloc: A,
    lists: Spin<SlabLists>,
}

impl<A> SlabCache<A>
where
    A: PageAlloc,
{
    pub fn new_in(
        name: &'static str,
        object_size: usize,
        align: usize,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
        flags: SlabFlags,
        frames: Arc<FrameTable>,
        alloc: A,
    ) -> Self {
        assert!(object_size > 0);
        assert!(align == 0 || align.is_power_of_two());

        let mut align = align.max(core::mem::size_of::<usize>());
        if flags.contains(SlabFlags::HWCACHE_ALIGN) {
            align = align.max(CACHE_LINE_SIZE);
        }

        let object_offset = if flags.contains(SlabFlags::RED_ZONE) {
            RED_ZONE_SIZE
        } else {
            0
        };
        let slot = object_offset * 2 + object_size;
        let stride = slot.div_ceil(align) * align;

        let slab_order = (0u32..)
            .find(|&order| (PAGE_SIZE << order) >= stride)
            .unwrap();

        Self {
            name,
            object_size,
            stride,
            object_offset,
            slab_order,
            objects_per_slab: (PAGE_SIZE << slab_order) / stride,
            ctor,
            dtor,
            flags,
            frames,
            alloc,
            lists: Spin::new(SlabLists {
                empty_list: BTreeSet::new(),
                partial_list: BTreeSet::new(),
                full_list: BTreeSet::new(),
                slabs: BTreeMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// (empty, partial, full) slab counts.
    pub fn slab_counts(&self) -> (usize, usize, usize) {
        let lists = self.lists.lock();
        (
            lists.empty_list.len(),
            lists.partial_list.len(),
            lists.full_list.len(),
        )
    }

    fn object_addr(&self, head: PFN, slot: u16) -> PAddr {
        PAddr::from(head) + slot as usize * self.stride + self.object_offset
    }

    pub fn alloc(&self) -> Option<PAddr> {
        let mut lists = self.lists.lock();

        let head = if let Some(&head) = lists.partial_list.first() {
            head
        } else if let Some(head) = lists.empty_list.pop_first() {
            lists.partial_list.insert(head);
            head
        } else {
            self.grow(&mut lists)?
        };

        let slab = lists.slabs.get_mut(&head).expect("slab record must exist");
        let slot = *slab.free.last().expect("a non-full slab has a free slot");
        let object = self.object_addr(head, slot);

        if self.flags.contains(SlabFlags::POISON)
            && !self.frames.check_pattern(object, self.object_size, POISON_BYTE)
        {
            panic!("slab cache {}: poison overwritten in a free object", self.name);
        }

        // Every object handed out is cleared or constructor-initialized.
        if let Some(ctor) = self.ctor {
            let mut buf = vec![0u8; self.object_size];
            if ctor(&mut buf).is_err() {
                return None;
            }
            self.frames.write(object, &buf);
        } else {
            self.frames.fill(object, self.object_size, 0);
        }

        slab.free.pop();
        slab.allocated.insert(slot);

        if slab.free.is_empty() {
            lists.partial_list.remove(&head);
            lists.full_list.insert(head);
        }

        Some(object)
    }

    pub fn free(&self, object: PAddr) {
        let pfn = PFN::from(object);
        let frame = self
            .frames
            .get_frame(pfn)
            .unwrap_or_else(|| panic!("slab cache {}: freeing a wild pointer", self.name));
        assert!(
            frame.flags.has(PageFlags::SLAB),
            "slab cache {}: freeing an object on a non-slab frame",
            self.name
        );

        let head = PFN::from_val(frame.private());
        let offset = object - PAddr::from(head);
        assert!(
            offset >= self.object_offset && (offset - self.object_offset) % self.stride == 0,
            "slab cache {}: freeing a misaligned object",
            self.name
        );
        let slot = ((offset - self.object_offset) / self.stride) as u16;
        assert!((slot as usize) < self.objects_per_slab);

        let mut lists = self.lists.lock();
        let slab = lists
            .slabs
            .get_mut(&head)
            .unwrap_or_else(|| panic!("slab cache {}: freeing into a foreign cache", self.name));

        assert!(
            slab.allocated.remove(&slot),
            "slab cache {}: double free of slot {}",
            self.name,
            slot
        );

        if let Some(dtor) = self.dtor {
            let mut buf = vec![0u8; self.object_size];
            self.frames.read(object, &mut buf);
            dtor(&mut buf);
            self.frames.write(object, &buf);
        }

        if self.flags.contains(SlabFlags::RED_ZONE) {
            let slot_start = object - self.object_offset;
            let object_end = object + self.object_size;
            if !self
                .frames
                .check_pattern(slot_start, RED_ZONE_SIZE, RED_ZONE_BYTE)
                || !self
                    .frames
                    .check_pattern(object_end, RED_ZONE_SIZE, RED_ZONE_BYTE)
            {
                panic!("slab cache {}: red zone overwritten", self.name);
            }
        }

        if self.flags.contains(SlabFlags::POISON) {
            self.frames.fill(object, self.object_size, POISON_BYTE);
        }

        let was_full = slab.free.is_empty();
        slab.free.push(slot);
        let now_empty = slab.allocated.is_empty();

        if was_full {
            lists.full_list.remove(&head);
            lists.partial_list.insert(head);
        }
        if now_empty {
            lists.partial_list.remove(&head);
            lists.empty_list.insert(head);
        }
    }

    /// Allocate and prepare one more slab. Inserted into the partial list;
    /// the caller takes the first object from it.
    fn grow(&self, lists: &mut SlabLists) -> Option<PFN> {
        let alloc_flags = if self.flags.contains(SlabFlags::CACHE_DMA) {
            AllocFlags::DMA
        } else {
            AllocFlags::empty()
        };

        let head = self.alloc.alloc_pages(self.slab_order, alloc_flags)?;

        for i in 0..(1usize << self.slab_order) {
            let frame = self.frames.frame(head + i);
            frame.flags.set(PageFlags::SLAB);
            frame.set_private(usize::from(head));
        }

        for slot in 0..self.objects_per_slab as u16 {
            let object = self.object_addr(head, slot);

            if self.flags.contains(SlabFlags::POISON) {
                self.frames.fill(object, self.object_size, POISON_BYTE);
            }
            if self.flags.contains(SlabFlags::RED_ZONE) {
                self.frames
                    .fill(object - self.object_offset, RED_ZONE_SIZE, RED_ZONE_BYTE);
                self.frames
                    .fill(object + self.object_size, RED_ZONE_SIZE, RED_ZONE_BYTE);
            }
        }

        lists.slabs.insert(
            head,
            Slab {
                free: (0..self.objects_per_slab as u16).rev().collect(),
                allocated: BTreeSet::new(),
            },
        );
        lists.partial_list.insert(head);

        Some(head)
    }

    /// Hand every empty slab back to the page allocator. Returns the number
    /// of pages released.
    pub fn shrink(&self) -> usize {
        let mut lists = self.lists.lock();
        let mut freed = 0;

        while let Some(head) = lists.empty_list.pop_first() {
            lists.slabs.remove(&head);

            for i in 0..(1usize << self.slab_order) {
                let frame = self.frames.frame(head + i);
                frame.flags.clear(PageFlags::SLAB);
                frame.set_private(0);
            }

            self.frames.frame(head).put();
            self.alloc.free_pages(head, self.slab_order);
            freed += 1usize << self.slab_order;
        }

        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestAlloc;

    fn cache_with(flags: SlabFlags, size: usize) -> (TestAlloc, SlabCache<TestAlloc>) {
        let backing = TestAlloc::new(128);
        let cache = SlabCache::new_in(
            "test-objects",
            size,
            8,
            None,
            None,
            flags,
            backing.frames.clone(),
            backing.clone(),
        );
        (backing, cache)
    }

    #[test]
    fn objects_are_distinct_and_cleared() {
        let (backing, cache) = cache_with(SlabFlags::empty(), 96);

        let a = cache.alloc().unwrap();
        let b = cache.alloc().unwrap();
        assert_ne!(a, b);

        backing.frames.fill(a, 96, 0xff);
        cache.free(a);
        let again = cache.alloc().unwrap();
        assert!(backing.frames.check_pattern(again, 96, 0));
    }

    #[test]
    fn slabs_move_between_lists() {
        let (_backing, cache) = cache_with(SlabFlags::empty(), 2048);
        // 2048-byte objects: two per page-sized slab.
        assert_eq!(cache.objects_per_slab, 2);

        let a = cache.alloc().unwrap();
        assert_eq!(cache.slab_counts(), (0, 1, 0));

        let b = cache.alloc().unwrap();
        assert_eq!(cache.slab_counts(), (0, 0, 1));

        cache.free(a);
        assert_eq!(cache.slab_counts(), (0, 1, 0));

        cache.free(b);
        assert_eq!(cache.slab_counts(), (1, 0, 0));

        assert_eq!(cache.shrink(), 1);
        assert_eq!(cache.slab_counts(), (0, 0, 0));
    }

    #[test]
    #[should_panic]
    fn double_free_dies() {
        let (_backing, cache) = cache_with(SlabFlags::empty(), 64);

        let object = cache.alloc().unwrap();
        cache.free(object);
        cache.free(object);
    }

    #[test]
    #[should_panic]
    fn poison_detects_use_after_free() {
        let (backing, cache) = cache_with(SlabFlags::POISON, 64);

        let object = cache.alloc().unwrap();
        cache.free(object);

        // A write through a stale pointer breaks the poison pattern.
        backing.frames.fill(object, 8, 0x00);
        let _ = cache.alloc();
    }

    #[test]
    #[should_panic]
    fn red_zone_detects_overflow() {
        let (backing, cache) = cache_with(SlabFlags::RED_ZONE, 64);

        let object = cache.alloc().unwrap();
        backing.frames.fill(object + 64, 1, 0x00);
        cache.free(object);
    }

    #[test]
    fn hwcache_align_rounds_the_stride() {
        let backing = TestAlloc::new(64);
        let cache = SlabCache::new_in(
            "aligned",
            40,
            8,
            None,
            None,
            SlabFlags::HWCACHE_ALIGN,
            backing.frames.clone(),
            backing.clone(),
        );

        let object = cache.alloc().unwrap();
        assert_eq!(usize::from(object) % CACHE_LINE_SIZE, 0);
    }

    #[test]
    fn constructor_failure_aborts_the_allocation() {
        let backing = TestAlloc::new(64);

        fn failing_ctor(_obj: &mut [u8]) -> Result<(), ()> {
            Err(())
        }

        let cache = SlabCache::new_in(
            "never-constructs",
            64,
            8,
            Some(failing_ctor),
            None,
            SlabFlags::empty(),
            backing.frames.clone(),
            backing.clone(),
        );

        assert!(cache.alloc().is_none());
        // The slot was not leaked.
        let slab_counts = cache.slab_counts();
        assert_eq!(slab_counts.2, 0);
    }

    #[test]
    fn constructor_initializes_objects() {
        let backing = TestAlloc::new(64);

        fn ctor(obj: &mut [u8]) -> Result<(), ()> {
            obj.fill(0x11);
            Ok(())
        }

        let cache = SlabCache::new_in(
            "constructed",
            32,
            8,
            Some(ctor),
            None,
            SlabFlags::empty(),
            backing.frames.clone(),
            backing.clone(),
        );

        let object = cache.alloc().unwrap();
        assert!(backing.frames.check_pattern(object, 32, 0x11));
    }
}
