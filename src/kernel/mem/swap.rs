pub mod area;
pub mod compress;
pub mod monitor;
pub mod policy;

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::sync::Arc;

use zenith_mm::address::{AddrOps as _, VAddr};
use zenith_mm::paging::{AllocFlags, FrameTable, PageFlags, PAGE_SIZE, PFN};
use zenith_mm::page_table::PageAttribute;
use zenith_sync::Spin;

use crate::kernel::constants::KernelConfig;
use crate::kernel::mem::allocator::Kmalloc;
use crate::kernel::mem::mm_list::{MmList, MmListInner, VmaInfo};
use crate::kernel::mem::page_alloc::PageAllocator;
use crate::kernel::timer::Timer;
use crate::prelude::*;

pub use area::{MemSwapStore, SwapArea, SwapEntry, SwapStore, SWAP_SLOT_SIZE};
pub use compress::CompressionAlgorithm;
pub use monitor::{PressureSample, SwapMonitor};
pub use policy::{
    ClassifierKind, PageStats, PolicyState, PriorityClassifier, ReplacementPolicy,
    VictimCandidate,
};

/// How many forward neighbors a swap-in opportunistically pulls along.
const SWAP_PREFETCH_PAGES: usize = 4;

/// The swap path: slot management over the external block stores,
/// compression, victim selection, and the pressure monitor.
pub struct SwapSubsystem {
    frames: Arc<FrameTable>,
    pmm: Arc<PageAllocator>,
    kmalloc: Arc<Kmalloc>,
    timer: Arc<Timer>,
    config: Arc<KernelConfig>,
    areas: Spin<Vec<Arc<SwapArea>>>,
    next_area: AtomicUsize,
    compression: Spin<CompressionAlgorithm>,
    replacement: Spin<ReplacementPolicy>,
    policy_state: Spin<PolicyState>,
    classifier: Spin<PriorityClassifier>,
    pub monitor: SwapMonitor,
}

impl SwapSubsystem {
    pub fn new(
        frames: Arc<FrameTable>,
        pmm: Arc<PageAllocator>,
        kmalloc: Arc<Kmalloc>,
        timer: Arc<Timer>,
        config: Arc<KernelConfig>,
    ) -> Self {
        Self {
            frames,
            pmm,
            kmalloc,
            timer,
            config,
            areas: Spin::new(Vec::new()),
            next_area: AtomicUsize::new(0),
            compression: Spin::new(CompressionAlgorithm::None),
            replacement: Spin::new(ReplacementPolicy::Lru),
            policy_state: Spin::new(PolicyState::new()),
            classifier: Spin::new(PriorityClassifier::new(ClassifierKind::AccessTime)),
            monitor: SwapMonitor::new(),
        }
    }

    pub fn add_area(&self, name: String, store: Arc<dyn SwapStore>) -> KResult<u8> {
        let mut areas = self.areas.lock();
        let index = u8::try_from(areas.len()).map_err(|_| KernelError::NoMemory)?;

        let area = Arc::new(SwapArea::new(index, name, store)?);
        println_info!(
            "swap: area {} online, {} slots",
            area.name(),
            area.pages() - 1
        );
        areas.push(area);
        Ok(index)
    }

    pub fn area(&self, index: u8) -> Option<Arc<SwapArea>> {
        self.areas.lock().get(index as usize).cloned()
    }

    pub fn config(&self) -> &Arc<KernelConfig> {
        &self.config
    }

    pub fn area_count(&self) -> usize {
        self.areas.lock().len()
    }

    pub fn compression(&self) -> CompressionAlgorithm {
        *self.compression.lock()
    }

    pub fn set_compression(&self, algo: CompressionAlgorithm) {
        *self.compression.lock() = algo;
    }

    pub fn replacement(&self) -> ReplacementPolicy {
        *self.replacement.lock()
    }

    pub fn set_replacement(&self, policy: ReplacementPolicy) {
        *self.replacement.lock() = policy;
    }

    pub fn set_classifier(&self, kind: ClassifierKind) {
        self.classifier.lock().set_kind(kind);
    }

    pub fn set_watermark(&self, watermark: u32) {
        self.classifier.lock().set_watermark(watermark);
    }

    pub fn watermark(&self) -> u32 {
        self.classifier.lock().watermark()
    }

    /// Round-robin slot allocation over every area with space left.
    fn alloc_entry(&self) -> Option<SwapEntry> {
        let areas = self.areas.lock();
        if areas.is_empty() {
            return None;
        }

        let start = self.next_area.fetch_add(1, Ordering::Relaxed) % areas.len();
        for offset in 0..areas.len() {
            if let Some(entry) = areas[(start + offset) % areas.len()].alloc_slot() {
                return Some(entry);
            }
        }
        None
    }

    /// Fork support: another swap map now references `entry`.
    pub(crate) fn duplicate(&self, entry: SwapEntry) {
        if let Some(area) = self.area(entry.area()) {
            area.dup_slot(entry.index());
        }
    }

    /// Unmap support: one swap-map reference to `entry` went away.
    pub(crate) fn release(&self, entry: SwapEntry) {
        if let Some(area) = self.area(entry.area()) {
            area.put_slot(entry.index());
        }
    }

    fn alloc_frame_with_retry(&self) -> KResult<PFN> {
        if let Some(pfn) = self.pmm.alloc_pages(0, AllocFlags::empty()) {
            return Ok(pfn);
        }

        // One shrink sweep, then a single retry, then give up.
        self.kmalloc.cache_shrink_all();
        self.pmm
            .alloc_pages(0, AllocFlags::empty())
            .ok_or(KernelError::NoMemory)
    }

    /// Push the page at `addr` out to a swap slot. The caller names the
    /// page; `swap_out_victim` picks one via the replacement policy.
    pub fn swap_out(&self, mm: &MmList, addr: VAddr) -> KResult<()> {
        let mut inner = mm.lock_inner();
        self.swap_out_locked(mm, &mut inner, addr)
    }

    pub(crate) fn swap_out_locked(
        &self,
        mm: &MmList,
        inner: &mut MmListInner,
        addr: VAddr,
    ) -> KResult<()> {
        let page = addr.floor();
        let info = inner.area_at(page).ok_or(KernelError::NoEntry)?;

        let (pfn, attr) = {
            let pte = inner.page_table.get(page).ok_or(KernelError::NoEntry)?;
            if !pte.is_present() {
                return Err(KernelError::NoEntry);
            }
            (pte.pfn(), pte.attr())
        };

        let frame = self.frames.frame(pfn);
        if frame.flags.has(PageFlags::LOCKED) || frame.flags.has(PageFlags::DIRTY_FAILED) {
            return Err(KernelError::Busy);
        }
        if frame.get_refcount() > 1 {
            // Shared or CoW frames stay resident.
            return Err(KernelError::WouldBlock);
        }

        let now = self.timer.now_ms();
        let stats = PageStats {
            age_ms: now.saturating_sub(frame.stamp()),
            executable: attr.contains(PageAttribute::EXECUTE),
            shared: info.is_shared,
            dirty: attr.contains(PageAttribute::DIRTY),
        };
        if !self.classifier.lock().allows(&stats) {
            // Hotter than the watermark; the caller may try another page.
            return Err(KernelError::WouldBlock);
        }

        let entry = self.alloc_entry().ok_or(KernelError::NoMemory)?;
        let area = self.area(entry.area()).expect("entry from a live area");

        frame.flags.set(PageFlags::LOCKED);

        let mut page_buf = [0u8; PAGE_SIZE];
        unsafe {
            // SAFETY: The mm lock is held and the frame is LOCKED, so
            //         nothing else touches the payload.
            self.frames.with_page(pfn, |bytes| page_buf.copy_from_slice(bytes));
        }

        let algo = self.compression();
        let compressed = compress::compress(algo, &page_buf);

        // Strict bound: a payload that does not fit the slot is stored
        // raw, never truncated, never overrunning.
        let (stored_algo, payload): (CompressionAlgorithm, &[u8]) =
            if algo != CompressionAlgorithm::None && compressed.len() < PAGE_SIZE {
                (algo, &compressed)
            } else {
                (CompressionAlgorithm::None, &page_buf)
            };

        let mut slot_buf = Vec::with_capacity(4 + payload.len());
        slot_buf.extend_from_slice(&(payload.len() as i32).to_le_bytes());
        slot_buf.extend_from_slice(payload);

        if let Err(err) = area
            .store()
            .write_at(SwapArea::slot_offset(entry.index()), &slot_buf)
        {
            frame.flags.set(PageFlags::DIRTY_FAILED);
            frame.flags.clear(PageFlags::LOCKED);
            area.put_slot(entry.index());
            return Err(err);
        }

        area.record_algo(entry.index(), stored_algo);

        inner.swap_map.insert(page, entry);
        inner.page_table.take(page);

        frame.mapcount.fetch_sub(1, Ordering::Relaxed);
        frame.set_mapping(None);
        frame.flags.clear(PageFlags::LOCKED | PageFlags::LRU);
        mm.note_unmapped(&info);
        mm.flush_tlb_page(page);

        self.monitor.count_out();

        assert!(frame.put(), "swapped-out frame still referenced");
        self.pmm.free_pages(pfn, 0);

        Ok(())
    }

    /// Resolve a fault on a swapped-out page, prefetching up to four
    /// forward neighbors whose entries are also present.
    pub fn swap_in(&self, mm: &MmList, addr: VAddr) -> KResult<()> {
        let mut inner = mm.lock_inner();
        self.swap_in_locked(mm, &mut inner, addr)
    }

    pub(crate) fn swap_in_locked(
        &self,
        mm: &MmList,
        inner: &mut MmListInner,
        addr: VAddr,
    ) -> KResult<()> {
        let page = addr.floor();
        self.do_swap_in(mm, inner, page)?;

        for neighbor in 1..=SWAP_PREFETCH_PAGES {
            let naddr = page + neighbor * PAGE_SIZE;
            if inner.swap_map.contains_key(&naddr) && inner.area_at(naddr).is_some() {
                // Prefetch is best-effort.
                let _ = self.do_swap_in(mm, inner, naddr);
            }
        }

        Ok(())
    }

    fn do_swap_in(&self, mm: &MmList, inner: &mut MmListInner, page: VAddr) -> KResult<()> {
        let entry = *inner.swap_map.get(&page).ok_or(KernelError::NoEntry)?;
        let info = inner
            .area_at(page)
            .ok_or(KernelError::SegmentationViolation)?;
        let area = self.area(entry.area()).ok_or(KernelError::Io)?;

        let slot_offset = SwapArea::slot_offset(entry.index());

        let mut header = [0u8; 4];
        area.store().read_at(slot_offset, &mut header)?;
        let compressed_size = i32::from_le_bytes(header);
        if compressed_size <= 0 || compressed_size as usize > PAGE_SIZE {
            return Err(KernelError::Io);
        }
        let compressed_size = compressed_size as usize;

        let mut payload = vec![0u8; compressed_size];
        area.store().read_at(slot_offset + 4, &mut payload)?;

        let pfn = self.alloc_frame_with_retry()?;
        let frame = self.frames.frame(pfn);

        let filled = if compressed_size == PAGE_SIZE {
            unsafe {
                // SAFETY: The frame was just allocated and is exclusively
                //         ours.
                self.frames
                    .with_page(pfn, |bytes| bytes.copy_from_slice(&payload));
            }
            Ok(())
        } else {
            let mut page_buf = [0u8; PAGE_SIZE];
            compress::decompress(area.algo_of(entry.index()), &payload, &mut page_buf).map(
                |()| unsafe {
                    // SAFETY: As above, the frame is exclusively ours.
                    self.frames
                        .with_page(pfn, |bytes| bytes.copy_from_slice(&page_buf));
                },
            )
        };

        if let Err(err) = filled {
            frame.put();
            self.pmm.free_pages(pfn, 0);
            return Err(err);
        }

        let mut attr = PageAttribute::PRESENT | PageAttribute::READ | PageAttribute::USER
            | PageAttribute::ACCESSED;
        if info.permission.write {
            attr |= PageAttribute::WRITE;
        }
        if info.permission.execute {
            attr |= PageAttribute::EXECUTE;
        }

        let now = self.timer.now_ms();
        frame.born(now);
        frame.mapcount.fetch_add(1, Ordering::Relaxed);
        frame.set_mapping(Some(zenith_mm::paging::MappingRef {
            owner: mm.id(),
            index: usize::from(page),
        }));

        inner.page_table.set(page, pfn, attr);
        inner.swap_map.remove(&page);
        mm.note_mapped(&info);

        area.put_slot(entry.index());
        self.monitor.count_in();

        Ok(())
    }

    /// Pick a victim in `mm` via the live replacement policy and push it
    /// out. Returns the chosen address.
    pub fn swap_out_victim(&self, mm: &MmList) -> KResult<VAddr> {
        let mut inner = mm.lock_inner();

        let victim = self
            .select_victim_locked(&mut inner)
            .ok_or(KernelError::NoEntry)?;
        self.swap_out_locked(mm, &mut inner, victim)?;
        Ok(victim)
    }

    pub fn select_victim(&self, mm: &MmList) -> Option<VAddr> {
        let mut inner = mm.lock_inner();
        self.select_victim_locked(&mut inner)
    }

    fn select_victim_locked(&self, inner: &mut MmListInner) -> Option<VAddr> {
        let candidates: Vec<VictimCandidate> = inner
            .page_table
            .iter()
            .filter(|(_, pte)| pte.is_present())
            .filter(|(addr, pte)| {
                let frame = self.frames.frame(pte.pfn());
                if frame.get_refcount() != 1 || frame.flags.has(PageFlags::LOCKED) {
                    return false;
                }
                inner
                    .area_at(*addr)
                    .is_some_and(|info| info.anonymous && !info.is_shared)
            })
            .map(|(addr, pte)| VictimCandidate {
                addr,
                pfn: pte.pfn(),
                accessed: pte.attr().contains(PageAttribute::ACCESSED),
            })
            .collect();

        let policy = self.replacement();
        let mut state = self.policy_state.lock();
        let page_table = &mut inner.page_table;

        policy::select_victim(policy, &mut state, &self.frames, &candidates, |addr| {
            if let Some(pte) = page_table.get_mut(addr) {
                let attr = pte.attr() & !PageAttribute::ACCESSED;
                pte.set_attr(attr);
            }
        })
    }

    /// Timer-driven sampling; escalates compression and re-tunes the
    /// classifier when pressure stays above the threshold and auto-adjust
    /// is on.
    pub fn monitor_tick(&self, now_ms: u64) {
        let Some(sample) = self
            .monitor
            .sample(now_ms, self.config.swap_monitor_interval_ms())
        else {
            return;
        };

        if sample.pressure_pct > self.config.swap_pressure_threshold()
            && self.config.swap_auto_adjust()
        {
            let mut compression = self.compression.lock();
            let escalated = compression.escalate();
            if escalated != *compression {
                println_info!(
                    "swap: pressure {}%, escalating {} -> {}",
                    sample.pressure_pct,
                    compression.name(),
                    escalated.name()
                );
                *compression = escalated;
            }

            self.classifier.lock().tighten();
        }
    }
}
