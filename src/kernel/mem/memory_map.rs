use align_ext::AlignExt;

use zenith_mm::address::{Addr as _, PAddr, PRange};
use zenith_mm::paging::{PAGE_SIZE, PFN};

use crate::prelude::*;

/// Region types of the multiboot memory map. Only `Available` memory ever
/// reaches the buddy system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Available,
    Reserved,
    AcpiReclaim,
    AcpiNvs,
    BadRam,
}

impl RegionKind {
    pub fn from_multiboot(kind: u32) -> Self {
        match kind {
            1 => RegionKind::Available,
            3 => RegionKind::AcpiReclaim,
            4 => RegionKind::AcpiNvs,
            5 => RegionKind::BadRam,
            _ => RegionKind::Reserved,
        }
    }
}

/// One entry of the firmware-provided map, as handed over by the boot
/// protocol.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MultibootMmapEntry {
    pub size: u32,
    pub base: u64,
    pub length: u64,
    pub kind: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: PAddr,
    pub length: usize,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub fn range(&self) -> PRange {
        PRange::new(self.base, self.base + self.length)
    }
}

/// The physical memory layout the PMM is built from.
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    pub fn new(regions: Vec<MemoryRegion>) -> Self {
        Self { regions }
    }

    pub fn from_multiboot(entries: &[MultibootMmapEntry]) -> Self {
        let regions = entries
            .iter()
            .map(|entry| MemoryRegion {
                base: PAddr::from(entry.base as usize),
                length: entry.length as usize,
                kind: RegionKind::from_multiboot(entry.kind),
            })
            .collect();

        Self { regions }
    }

    /// A map with a single available region of `pages` pages, the shape the
    /// simplest machines hand us.
    pub fn flat(pages: usize) -> Self {
        Self::new(vec![MemoryRegion {
            base: PAddr::from(0),
            length: pages * PAGE_SIZE,
            kind: RegionKind::Available,
        }])
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Available regions trimmed inward to whole pages.
    pub fn available_ranges(&self) -> impl Iterator<Item = (PFN, PFN)> + '_ {
        self.regions
            .iter()
            .filter(|region| region.kind == RegionKind::Available)
            .filter_map(|region| {
                let start = region.base.addr().align_up(PAGE_SIZE);
                let end = (region.base.addr() + region.length).align_down(PAGE_SIZE);

                (start < end).then(|| {
                    (
                        PFN::from(PAddr::from(start)),
                        PFN::from(PAddr::from(end)),
                    )
                })
            })
    }

    /// The PFN span covering every region, whatever its type. The frame
    /// table is sized to this.
    pub fn span(&self) -> Option<(PFN, PFN)> {
        let mut span: Option<(usize, usize)> = None;

        for region in &self.regions {
            let start = region.base.addr().align_down(PAGE_SIZE);
            let end = (region.base.addr() + region.length).align_up(PAGE_SIZE);

            span = Some(match span {
                None => (start, end),
                Some((lo, hi)) => (lo.min(start), hi.max(end)),
            });
        }

        span.map(|(lo, hi)| (PFN::from(PAddr::from(lo)), PFN::from(PAddr::from(hi))))
    }
}
