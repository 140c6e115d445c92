use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use buddy_allocator::Zone;
use zenith_mm::address::{Addr as _, PRange};
use zenith_mm::paging::{AllocFlags, FrameTable, PageAlloc, PageFlags, PAGE_SIZE_BITS, PFN};
use zenith_sync::Spin;

use crate::kernel::constants::{DMA_PFN_LIMIT, NORMAL_PFN_LIMIT};
use crate::kernel::mem::memory_map::{MemoryMap, RegionKind};
use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    Dma,
    Normal,
    HighMem,
}

impl ZoneKind {
    pub const ALL: [ZoneKind; 3] = [ZoneKind::Dma, ZoneKind::Normal, ZoneKind::HighMem];

    pub fn of_pfn(pfn: PFN) -> Self {
        let pfn = usize::from(pfn);
        if pfn < DMA_PFN_LIMIT {
            ZoneKind::Dma
        } else if pfn < NORMAL_PFN_LIMIT {
            ZoneKind::Normal
        } else {
            ZoneKind::HighMem
        }
    }

    pub fn pfn_bounds(self) -> (usize, usize) {
        match self {
            ZoneKind::Dma => (0, DMA_PFN_LIMIT),
            ZoneKind::Normal => (DMA_PFN_LIMIT, NORMAL_PFN_LIMIT),
            ZoneKind::HighMem => (NORMAL_PFN_LIMIT, usize::MAX),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ZoneKind::Dma => "DMA",
            ZoneKind::Normal => "Normal",
            ZoneKind::HighMem => "HighMem",
        }
    }
}

/// Node-aware placement for new allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumaPolicy {
    /// Allocate from the calling CPU's preferred node.
    Local,
    /// Rotate over the nodes allocation by allocation.
    Interleave,
    /// Always start from the given node.
    Preferred(usize),
}

struct NodeZone {
    kind: ZoneKind,
    reserved: usize,
    zone: Spin<Zone>,
}

pub struct NumaNode {
    id: usize,
    range: (PFN, PFN),
    zones: Vec<NodeZone>,
}

impl NumaNode {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn contains(&self, pfn: PFN) -> bool {
        self.range.0 <= pfn && pfn < self.range.1
    }

    fn zone(&self, kind: ZoneKind) -> Option<&NodeZone> {
        self.zones.iter().find(|node_zone| node_zone.kind == kind)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZoneStats {
    pub node: usize,
    pub kind: ZoneKind,
    pub total: usize,
    pub free: usize,
    pub reserved: usize,
}

impl ZoneStats {
    pub fn allocated(&self) -> usize {
        self.total - self.free - self.reserved
    }
}

/// The physical memory manager: per-node zones fed from the boot memory
/// map, with the multiboot-reserved regions and the kernel image withheld
/// from the buddy lists.
pub struct PageAllocator {
    frames: Arc<FrameTable>,
    nodes: Vec<NumaNode>,
    policy: Spin<NumaPolicy>,
    interleave_next: AtomicUsize,
}

fn subtract_range(
    range: (usize, usize),
    cut: Option<(usize, usize)>,
) -> impl Iterator<Item = (usize, usize)> {
    let (start, end) = range;
    let (left, right) = match cut {
        Some((cut_start, cut_end)) if cut_start < end && cut_end > start => (
            (start, cut_start.max(start)),
            (cut_end.min(end), end),
        ),
        _ => ((start, end), (end, end)),
    };

    [left, right].into_iter().filter(|(s, e)| s < e)
}

impl PageAllocator {
    /// Build the allocator from the boot memory map. Reservation of the
    /// non-available regions and the kernel image happens here, before any
    /// frame reaches a free list.
    pub fn new(
        frames: Arc<FrameTable>,
        map: &MemoryMap,
        kernel_image: Option<PRange>,
        node_ranges: Option<Vec<(PFN, PFN)>>,
    ) -> Self {
        let node_ranges =
            node_ranges.unwrap_or_else(|| vec![(frames.base(), frames.end())]);

        let image_pfns = kernel_image.map(|image| {
            (
                usize::from(image.start().addr()) >> PAGE_SIZE_BITS,
                usize::from(image.end().addr()).div_ceil(1 << PAGE_SIZE_BITS),
            )
        });

        // Everything the map knows about exists; everything not available
        // is reserved.
        for region in map.regions() {
            if region.kind == RegionKind::Available {
                continue;
            }
            let start = usize::from(PFN::from(region.base));
            let end = usize::from(PFN::from(region.base + region.length));
            for pfn in start..end {
                let pfn = PFN::from_val(pfn);
                if frames.contains(pfn) {
                    let frame = frames.frame(pfn);
                    frame.flags.set(PageFlags::PRESENT | PageFlags::RESERVED);
                }
            }
        }
        if let Some((start, end)) = image_pfns {
            for pfn in start..end {
                let pfn = PFN::from_val(pfn);
                if frames.contains(pfn) {
                    let frame = frames.frame(pfn);
                    frame.flags.set(PageFlags::PRESENT | PageFlags::RESERVED);
                }
            }
        }

        let nodes = node_ranges
            .into_iter()
            .enumerate()
            .map(|(id, node_range)| {
                let zones = ZoneKind::ALL
                    .into_iter()
                    .filter_map(|kind| {
                        let (kind_start, kind_end) = kind.pfn_bounds();
                        let start = kind_start.max(usize::from(node_range.0));
                        let end = kind_end.min(usize::from(node_range.1));
                        if start >= end {
                            return None;
                        }

                        let mut zone = Zone::new(PFN::from_val(start), PFN::from_val(end));
                        for (avail_start, avail_end) in map.available_ranges() {
                            let clipped = (
                                start.max(usize::from(avail_start)),
                                end.min(usize::from(avail_end)),
                            );
                            if clipped.0 >= clipped.1 {
                                continue;
                            }

                            for (sub_start, sub_end) in subtract_range(clipped, image_pfns) {
                                zone.create_pages(
                                    &frames,
                                    PFN::from_val(sub_start),
                                    PFN::from_val(sub_end),
                                );
                            }
                        }

                        let reserved = (start..end)
                            .filter(|&pfn| {
                                frames
                                    .get_frame(PFN::from_val(pfn))
                                    .is_some_and(|frame| frame.flags.has(PageFlags::RESERVED))
                            })
                            .count();

                        Some(NodeZone {
                            kind,
                            reserved,
                            zone: Spin::new(zone),
                        })
                    })
                    .collect();

                NumaNode {
                    id,
                    range: node_range,
                    zones,
                }
            })
            .collect();

        Self {
            frames,
            nodes,
            policy: Spin::new(NumaPolicy::Local),
            interleave_next: AtomicUsize::new(0),
        }
    }

    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_of(&self, pfn: PFN) -> Option<usize> {
        self.nodes.iter().find(|node| node.contains(pfn)).map(|node| node.id)
    }

    pub fn policy(&self) -> NumaPolicy {
        *self.policy.lock()
    }

    pub fn set_policy(&self, policy: NumaPolicy) -> KResult<()> {
        if let NumaPolicy::Preferred(node) = policy {
            if node >= self.nodes.len() {
                return Err(KernelError::InvalidArgument);
            }
        }
        *self.policy.lock() = policy;
        Ok(())
    }

    fn zone_order(flags: AllocFlags) -> &'static [ZoneKind] {
        if flags.contains(AllocFlags::DMA) {
            &[ZoneKind::Dma]
        } else if flags.contains(AllocFlags::HIGHMEM) {
            &[ZoneKind::HighMem, ZoneKind::Normal, ZoneKind::Dma]
        } else {
            // Kernel-internal allocations are never promoted to HighMem.
            &[ZoneKind::Normal, ZoneKind::Dma]
        }
    }

    fn first_node(&self, hint: Option<usize>) -> usize {
        match *self.policy.lock() {
            NumaPolicy::Local => hint.unwrap_or(0).min(self.nodes.len() - 1),
            NumaPolicy::Preferred(node) => node.min(self.nodes.len() - 1),
            NumaPolicy::Interleave => {
                self.interleave_next.fetch_add(1, Ordering::Relaxed) % self.nodes.len()
            }
        }
    }

    /// Allocate with an explicit node preference, falling back over the
    /// remaining nodes in id order.
    pub fn alloc_pages_on(
        &self,
        hint: Option<usize>,
        order: u32,
        flags: AllocFlags,
    ) -> Option<PFN> {
        let first = self.first_node(hint);

        for offset in 0..self.nodes.len() {
            let node = &self.nodes[(first + offset) % self.nodes.len()];

            for &kind in Self::zone_order(flags) {
                let Some(node_zone) = node.zone(kind) else {
                    continue;
                };

                if let Some(pfn) = node_zone.zone.lock().get_free_pages(&self.frames, order) {
                    self.finish_alloc(pfn, order, flags);
                    return Some(pfn);
                }
            }
        }

        None
    }

    /// Allocate from one specific node only; migration uses this.
    pub fn alloc_pages_exact_node(
        &self,
        node: usize,
        order: u32,
        flags: AllocFlags,
    ) -> Option<PFN> {
        let node = self.nodes.get(node)?;

        for &kind in Self::zone_order(flags) {
            let Some(node_zone) = node.zone(kind) else {
                continue;
            };

            if let Some(pfn) = node_zone.zone.lock().get_free_pages(&self.frames, order) {
                self.finish_alloc(pfn, order, flags);
                return Some(pfn);
            }
        }

        None
    }

    fn finish_alloc(&self, pfn: PFN, order: u32, flags: AllocFlags) {
        let head = self.frames.frame(pfn);
        assert_eq!(head.get_refcount(), 0);
        head.get();

        if flags.contains(AllocFlags::ZERO) {
            for offset in 0..(1usize << order) {
                self.frames.zero_page(pfn + offset);
            }
        }
    }

    pub fn alloc_pages(&self, order: u32, flags: AllocFlags) -> Option<PFN> {
        self.alloc_pages_on(None, order, flags)
    }

    pub fn free_pages(&self, pfn: PFN, order: u32) {
        let frame = self.frames.frame(pfn);
        frame.set_mapping(None);
        frame.flags.clear(
            PageFlags::LRU | PageFlags::DIRTY | PageFlags::LOCKED | PageFlags::DIRTY_FAILED,
        );

        let node = self
            .nodes
            .iter()
            .find(|node| node.contains(pfn))
            .expect("freeing a frame outside every node");
        let node_zone = node
            .zone(ZoneKind::of_pfn(pfn))
            .expect("freeing a frame outside every zone");

        node_zone.zone.lock().free_pages(&self.frames, pfn, order);
    }

    pub fn zone_stats(&self) -> Vec<ZoneStats> {
        self.nodes
            .iter()
            .flat_map(|node| {
                node.zones.iter().map(move |node_zone| {
                    let zone = node_zone.zone.lock();
                    ZoneStats {
                        node: node.id,
                        kind: node_zone.kind,
                        total: zone.managed() + node_zone.reserved,
                        free: zone.free_count(),
                        reserved: node_zone.reserved,
                    }
                })
            })
            .collect()
    }

    pub fn total_pages(&self) -> usize {
        self.zone_stats().iter().map(|stats| stats.total).sum()
    }

    pub fn free_page_count(&self) -> usize {
        self.zone_stats().iter().map(|stats| stats.free).sum()
    }

    pub fn reserved_pages(&self) -> usize {
        self.zone_stats().iter().map(|stats| stats.reserved).sum()
    }

    /// Walk every free list and re-check the buddy invariants.
    pub fn check_invariants(&self) {
        for node in &self.nodes {
            for node_zone in &node.zones {
                node_zone.zone.lock().check_free_lists(&self.frames);
            }
        }
    }
}

/// Cloneable allocation handle for the slab layer.
#[derive(Clone)]
pub struct BuddyPageAlloc(pub Arc<PageAllocator>);

impl PageAlloc for BuddyPageAlloc {
    fn alloc_pages(&self, order: u32, flags: AllocFlags) -> Option<PFN> {
        self.0.alloc_pages(order, flags)
    }

    fn free_pages(&self, pfn: PFN, order: u32) {
        self.0.free_pages(pfn, order);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kernel::mem::memory_map::MemoryRegion;
    use zenith_mm::address::PAddr;
    use zenith_mm::paging::PAGE_SIZE;

    pub(crate) fn small_pmm(pages: usize) -> Arc<PageAllocator> {
        let frames = Arc::new(FrameTable::new(PFN::from_val(0), pages));
        Arc::new(PageAllocator::new(
            frames,
            &MemoryMap::flat(pages),
            None,
            None,
        ))
    }

    #[test]
    fn accounting_balances_at_quiescence() {
        let map = MemoryMap::new(vec![
            MemoryRegion {
                base: PAddr::from(0),
                length: 256 * PAGE_SIZE,
                kind: RegionKind::Available,
            },
            MemoryRegion {
                base: PAddr::from(256 * PAGE_SIZE),
                length: 64 * PAGE_SIZE,
                kind: RegionKind::Reserved,
            },
        ]);
        let frames = Arc::new(FrameTable::new(PFN::from_val(0), 320));
        let image = PRange::new(PAddr::from(0x4000), PAddr::from(0x8000));
        let pmm = Arc::new(PageAllocator::new(frames, &map, Some(image), None));

        assert_eq!(pmm.reserved_pages(), 64 + 4);
        assert_eq!(pmm.total_pages(), 320);
        assert_eq!(pmm.free_page_count(), 256 - 4);

        let run = pmm.alloc_pages(3, AllocFlags::empty()).unwrap();
        for stats in pmm.zone_stats() {
            assert_eq!(stats.total, stats.free + stats.reserved + stats.allocated());
        }
        assert_eq!(pmm.free_page_count(), 256 - 4 - 8);

        pmm.frames().frame(run).put();
        pmm.free_pages(run, 3);
        assert_eq!(pmm.free_page_count(), 256 - 4);
        pmm.check_invariants();
    }

    #[test]
    fn kernel_image_is_never_handed_out() {
        let frames = Arc::new(FrameTable::new(PFN::from_val(0), 64));
        let image = PRange::new(PAddr::from(16 * PAGE_SIZE), PAddr::from(20 * PAGE_SIZE));
        let pmm = Arc::new(PageAllocator::new(
            frames.clone(),
            &MemoryMap::flat(64),
            Some(image),
            None,
        ));

        let mut seen = alloc::collections::btree_set::BTreeSet::new();
        while let Some(pfn) = pmm.alloc_pages(0, AllocFlags::empty()) {
            assert!(!(16..20).contains(&usize::from(pfn)));
            seen.insert(pfn);
        }
        assert_eq!(seen.len(), 60);
    }

    #[test]
    fn zero_flag_clears_the_run() {
        let pmm = small_pmm(32);

        let pfn = pmm.alloc_pages(1, AllocFlags::empty()).unwrap();
        pmm.frames().fill(PAddr::from(usize::from(pfn) * PAGE_SIZE), 2 * PAGE_SIZE, 0xcd);
        pmm.frames().frame(pfn).put();
        pmm.free_pages(pfn, 1);

        let pfn = pmm.alloc_pages(1, AllocFlags::ZERO).unwrap();
        assert!(pmm.frames().check_pattern(
            PAddr::from(usize::from(pfn) * PAGE_SIZE),
            2 * PAGE_SIZE,
            0
        ));
    }

    #[test]
    fn dma_requests_never_leave_the_dma_zone() {
        // A map straddling the 16 MiB boundary gets both a DMA and a
        // Normal zone.
        let frames = Arc::new(FrameTable::new(PFN::from_val(DMA_PFN_LIMIT - 128), 256));
        let map = MemoryMap::new(vec![MemoryRegion {
            base: PAddr::from((DMA_PFN_LIMIT - 128) * PAGE_SIZE),
            length: 256 * PAGE_SIZE,
            kind: RegionKind::Available,
        }]);
        let pmm = Arc::new(PageAllocator::new(frames, &map, None, None));

        for _ in 0..8 {
            let pfn = pmm.alloc_pages(0, AllocFlags::DMA).unwrap();
            assert_eq!(ZoneKind::of_pfn(pfn), ZoneKind::Dma);
        }

        // Plain requests prefer Normal and fall back to DMA when Normal
        // runs dry.
        let mut normal_seen = 0;
        let mut dma_fallback = 0;
        while let Some(pfn) = pmm.alloc_pages(0, AllocFlags::empty()) {
            match ZoneKind::of_pfn(pfn) {
                ZoneKind::Normal => {
                    assert_eq!(dma_fallback, 0, "Normal after falling back");
                    normal_seen += 1;
                }
                ZoneKind::Dma => dma_fallback += 1,
                ZoneKind::HighMem => unreachable!(),
            }
        }
        assert_eq!(normal_seen, 128);
        assert_eq!(dma_fallback, 128 - 8);
    }

    #[test]
    fn interleave_rotates_nodes() {
        let frames = Arc::new(FrameTable::new(PFN::from_val(0), 128));
        let pmm = Arc::new(PageAllocator::new(
            frames,
            &MemoryMap::flat(128),
            None,
            Some(vec![
                (PFN::from_val(0), PFN::from_val(64)),
                (PFN::from_val(64), PFN::from_val(128)),
            ]),
        ));

        pmm.set_policy(NumaPolicy::Interleave).unwrap();
        let nodes: Vec<_> = (0..4)
            .map(|_| {
                let pfn = pmm.alloc_pages(0, AllocFlags::empty()).unwrap();
                pmm.node_of(pfn).unwrap()
            })
            .collect();
        assert_eq!(nodes, vec![0, 1, 0, 1]);

        pmm.set_policy(NumaPolicy::Preferred(1)).unwrap();
        let pfn = pmm.alloc_pages(0, AllocFlags::empty()).unwrap();
        assert_eq!(pmm.node_of(pfn), Some(1));

        assert_eq!(
            pmm.set_policy(NumaPolicy::Preferred(7)),
            Err(KernelError::InvalidArgument)
        );
    }
}
