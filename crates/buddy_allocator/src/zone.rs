use crate::free_area::FreeArea;
use crate::{BuddyPFNOps as _, MAX_ORDER, ZONE_AREAS};

use zenith_mm::paging::{FrameTable, PageFlags, PFN};

/// A contiguous PFN range with its own buddy free lists. A frame belongs to
/// exactly one zone, determined by its PFN.
pub struct Zone {
    start: PFN,
    end: PFN,
    free_areas: [FreeArea; ZONE_AREAS],
    /// Pages handed to the buddy system via `create_pages`.
    managed: usize,
}

impl Zone {
    pub const fn new(start: PFN, end: PFN) -> Self {
        Self {
            start,
            end,
            free_areas: [const { FreeArea::new() }; ZONE_AREAS],
            managed: 0,
        }
    }

    pub fn start(&self) -> PFN {
        self.start
    }

    pub fn end(&self) -> PFN {
        self.end
    }

    pub fn contains(&self, pfn: PFN) -> bool {
        self.start <= pfn && pfn < self.end
    }

    fn contains_run(&self, pfn: PFN, order: u32) -> bool {
        self.contains(pfn) && usize::from(pfn) + (1usize << order) <= usize::from(self.end)
    }

    /// Pages currently sitting on the free lists.
    pub fn free_count(&self) -> usize {
        self.free_areas
            .iter()
            .enumerate()
            .map(|(order, area)| area.count() << order)
            .sum()
    }

    /// Pages this zone manages in total.
    pub fn managed(&self) -> usize {
        self.managed
    }

    pub fn area_counts(&self) -> [usize; ZONE_AREAS] {
        core::array::from_fn(|order| self.free_areas[order].count())
    }

    pub fn get_free_pages(&mut self, frames: &FrameTable, order: u32) -> Option<PFN> {
        for current_order in order..ZONE_AREAS as u32 {
            let Some(pfn) = self.free_areas[current_order as usize].get_free_pages(frames) else {
                continue;
            };

            frames.frame(pfn).set_order(order);

            if current_order > order {
                self.expand(frames, pfn, current_order, order);
            }
            assert!(frames.frame(pfn).flags.has(PageFlags::PRESENT));

            return Some(pfn);
        }
        None
    }

    /// Give back the unused upper halves of a block taken at a higher order.
    fn expand(&mut self, frames: &FrameTable, pfn: PFN, order: u32, target_order: u32) {
        let mut offset = 1usize << order;

        for order in (target_order..order).rev() {
            offset >>= 1;
            let split_pfn = pfn + offset;
            frames.frame(split_pfn).set_order(order);
            self.free_areas[order as usize].add_pages(frames, split_pfn);
        }
    }

    pub fn free_pages(&mut self, frames: &FrameTable, pfn: PFN, order: u32) {
        let frame = frames.frame(pfn);

        // A bad free is fatal, not recoverable.
        assert!(
            self.contains_run(pfn, order),
            "freeing a run outside the zone"
        );
        assert!(
            pfn.is_aligned_to_order(order),
            "freeing a frame that cannot head a run of this order"
        );
        assert_eq!(frame.order(), order, "freeing a run at the wrong order");
        assert!(
            !frame.flags.has(PageFlags::BUDDY)
                && !frame.flags.has(PageFlags::RESERVED)
                && !frame.flags.has(PageFlags::SLAB),
            "freeing a frame the buddy system does not own"
        );
        assert_eq!(frame.get_refcount(), 0, "freeing a referenced frame");

        let mut pfn = pfn;
        let mut current_order = order;

        while current_order < MAX_ORDER {
            let buddy_pfn = pfn.buddy_pfn(current_order);

            if !self.buddy_check(frames, buddy_pfn, current_order) {
                break;
            }

            self.free_areas[current_order as usize].del_pages(frames, buddy_pfn);
            pfn = pfn.combined_pfn(buddy_pfn);
            current_order += 1;
        }

        frames.frame(pfn).set_order(current_order);
        self.free_areas[current_order as usize].add_pages(frames, pfn);
    }

    /// Whether a page can coalesce with its buddy:
    /// - the buddy is present and inside this zone,
    /// - the buddy is right now on a free list,
    /// - the page and its buddy have the same order.
    fn buddy_check(&self, frames: &FrameTable, pfn: PFN, order: u32) -> bool {
        if !self.contains_run(pfn, order) {
            return false;
        }

        let frame = frames.frame(pfn);
        if !frame.flags.has(PageFlags::PRESENT) {
            return false;
        }
        if !frame.flags.has(PageFlags::BUDDY) {
            return false;
        }
        if frame.order() != order {
            return false;
        }

        assert_eq!(frame.get_refcount(), 0);
        true
    }

    /// Only used on buddy initialization. Feeds `[start, end)` to the free
    /// lists in maximal naturally aligned blocks.
    pub fn create_pages(&mut self, frames: &FrameTable, start: PFN, end: PFN) {
        let mut start = start.max(self.start);
        let end = end.min(self.end);

        while start < end {
            let mut order = usize::from(start)
                .trailing_zeros()
                .min(MAX_ORDER);

            while (1usize << order) > end - start {
                order -= 1;
            }

            frames.frame(start).set_order(order);
            frames.frame(start).flags.set(PageFlags::PRESENT);
            for offset in 1..(1usize << order) {
                frames.frame(start + offset).flags.set(PageFlags::PRESENT);
            }
            self.free_areas[order as usize].add_pages(frames, start);

            self.managed += 1 << order;
            start = start + (1usize << order);
        }
    }

    /// Walk every free list and check the per-order invariants: a frame on
    /// free list `k` heads a `2^k`-aligned run, carries the buddy flag, and
    /// records order `k`.
    pub fn check_free_lists(&self, frames: &FrameTable) {
        for (order, area) in self.free_areas.iter().enumerate() {
            for pfn in area.iter() {
                assert!(pfn.is_aligned_to_order(order as u32));
                assert!(frames.frame(pfn).flags.has(PageFlags::BUDDY));
                assert_eq!(frames.frame(pfn).order(), order as u32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_zone(pages: usize) -> (FrameTable, Zone) {
        let frames = FrameTable::new(PFN::from_val(0), pages);
        let mut zone = Zone::new(PFN::from_val(0), PFN::from_val(pages));
        zone.create_pages(&frames, PFN::from_val(0), PFN::from_val(pages));
        (frames, zone)
    }

    #[test]
    fn split_then_merge_restores_the_block() {
        // One order-10 block in an otherwise empty zone.
        let (frames, mut zone) = fresh_zone(1024);
        assert_eq!(zone.area_counts()[10], 1);

        let first = zone.get_free_pages(&frames, 0).unwrap();
        let second = zone.get_free_pages(&frames, 0).unwrap();
        assert_ne!(first, second);

        zone.free_pages(&frames, first, 0);
        zone.free_pages(&frames, second, 0);

        let counts = zone.area_counts();
        assert_eq!(counts[10], 1);
        assert!(counts[..10].iter().all(|&count| count == 0));
        zone.check_free_lists(&frames);
    }

    #[test]
    fn alloc_free_is_idempotent_on_zone_state() {
        let (frames, mut zone) = fresh_zone(256);

        let before = zone.area_counts();
        for _ in 0..3 {
            let pfn = zone.get_free_pages(&frames, 3).unwrap();
            zone.free_pages(&frames, pfn, 3);
            assert_eq!(zone.area_counts(), before);
        }
    }

    #[test]
    fn free_lists_hold_aligned_heads() {
        let (frames, mut zone) = fresh_zone(512);

        // Chop the zone up a bit first.
        let a = zone.get_free_pages(&frames, 0).unwrap();
        let b = zone.get_free_pages(&frames, 2).unwrap();
        let c = zone.get_free_pages(&frames, 5).unwrap();
        zone.check_free_lists(&frames);

        zone.free_pages(&frames, b, 2);
        zone.free_pages(&frames, a, 0);
        zone.free_pages(&frames, c, 5);
        zone.check_free_lists(&frames);

        assert_eq!(zone.free_count(), 512);
    }

    #[test]
    #[should_panic]
    fn freeing_at_the_wrong_order_dies() {
        let (frames, mut zone) = fresh_zone(64);

        let pfn = zone.get_free_pages(&frames, 2).unwrap();
        zone.free_pages(&frames, pfn, 3);
    }

    #[test]
    #[should_panic]
    fn double_free_dies() {
        let (frames, mut zone) = fresh_zone(64);

        let pfn = zone.get_free_pages(&frames, 0).unwrap();
        zone.free_pages(&frames, pfn, 0);
        zone.free_pages(&frames, pfn, 0);
    }

    #[test]
    fn fallback_scans_higher_orders() {
        let (frames, mut zone) = fresh_zone(8);

        // Only an order-3 block exists; order-1 must split it.
        assert_eq!(zone.area_counts()[3], 1);
        let pfn = zone.get_free_pages(&frames, 1).unwrap();
        assert!(pfn.is_aligned_to_order(1));

        let counts = zone.area_counts();
        assert_eq!((counts[1], counts[2]), (1, 1));
    }
}
