mod mapping;
mod page_fault;

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::collections::{btree_map::BTreeMap, btree_set::BTreeSet};
use alloc::sync::{Arc, Weak};

use zenith_mm::address::{AddrOps as _, VAddr, VRange};
use zenith_mm::page_table::{PageAttribute, PageTable};
use zenith_mm::paging::{AllocFlags, FrameTable, MappingRef, PAGE_SIZE, PFN};
use zenith_percpu::{CpuId, PerCpu};
use zenith_sync::{Spin, SpinGuard};

use crate::kernel::constants::USER_SPACE_TOP;
use crate::kernel::cpu::{Cpu, CpuSet};
use crate::kernel::interrupt::InterruptTable;
use crate::kernel::mem::allocator::Kmalloc;
use crate::kernel::mem::mm_area::{MmArea, Permission};
use crate::kernel::mem::page_alloc::PageAllocator;
use crate::kernel::mem::swap::{SwapEntry, SwapSubsystem};
use crate::kernel::timer::Timer;
use crate::prelude::*;

pub use mapping::{FaultRequest, FileMapping, MappedFile, Mapping, VmOperations};
pub use page_fault::PageFaultError;

/// Snapshot of one VMA, handed out instead of references so callers never
/// hold into the locked set.
#[derive(Clone)]
pub struct VmaInfo {
    pub range: VRange,
    pub permission: Permission,
    pub is_shared: bool,
    pub anonymous: bool,
    pub mapping: Mapping,
    pub ops: Option<Arc<VmOperations>>,
}

#[derive(Default)]
struct VmCounters {
    total: AtomicUsize,
    locked: AtomicUsize,
    shared: AtomicUsize,
    exec: AtomicUsize,
}

/// Everything the VMM needs a handle on, shared by every address space.
pub struct VmContext {
    pub frames: Arc<FrameTable>,
    pub pmm: Arc<PageAllocator>,
    pub kmalloc: Arc<Kmalloc>,
    pub irq: Arc<InterruptTable>,
    pub cpus: Arc<PerCpu<Cpu>>,
    pub timer: Arc<Timer>,
    pub swap: Arc<SwapSubsystem>,
    registry: Spin<BTreeMap<usize, Weak<MmList>>>,
    next_mm_id: AtomicUsize,
}

impl VmContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frames: Arc<FrameTable>,
        pmm: Arc<PageAllocator>,
        kmalloc: Arc<Kmalloc>,
        irq: Arc<InterruptTable>,
        cpus: Arc<PerCpu<Cpu>>,
        timer: Arc<Timer>,
        swap: Arc<SwapSubsystem>,
    ) -> Arc<Self> {
        Arc::new(Self {
            frames,
            pmm,
            kmalloc,
            irq,
            cpus,
            timer,
            swap,
            registry: Spin::new(BTreeMap::new()),
            // Root 0 names the kernel-only page table.
            next_mm_id: AtomicUsize::new(1),
        })
    }

    pub fn create_mm(self: &Arc<Self>) -> Arc<MmList> {
        let id = self.next_mm_id.fetch_add(1, Ordering::Relaxed);

        let mm = Arc::new(MmList {
            id,
            ctx: self.clone(),
            user_count: AtomicUsize::new(1),
            cpu_set: Spin::new(CpuSet::EMPTY),
            counters: VmCounters::default(),
            locked: Spin::new(MmListInner {
                areas: BTreeSet::new(),
                page_table: PageTable::new(),
                swap_map: BTreeMap::new(),
                break_start: None,
                break_pos: None,
            }),
        });

        self.registry.lock().insert(id, Arc::downgrade(&mm));
        mm
    }

    pub fn lookup_mm(&self, id: usize) -> Option<Arc<MmList>> {
        self.registry.lock().get(&id).and_then(Weak::upgrade)
    }

    fn unregister(&self, id: usize) {
        self.registry.lock().remove(&id);
    }

    /// User-page allocation with the single shrink-and-retry the fault
    /// path is allowed.
    pub fn alloc_user_page(&self) -> KResult<PFN> {
        if let Some(pfn) = self.pmm.alloc_pages(0, AllocFlags::ZERO) {
            return Ok(pfn);
        }

        self.kmalloc.cache_shrink_all();
        self.pmm
            .alloc_pages(0, AllocFlags::ZERO)
            .ok_or(KernelError::NoMemory)
    }
}

pub struct MmListInner {
    pub(crate) areas: BTreeSet<MmArea>,
    pub(crate) page_table: PageTable,
    pub(crate) swap_map: BTreeMap<VAddr, SwapEntry>,
    break_start: Option<VAddr>,
    break_pos: Option<VAddr>,
}

fn is_user(range: VRange) -> bool {
    usize::from(range.end()) <= USER_SPACE_TOP
}

impl MmListInner {
    pub(crate) fn area_at(&self, addr: VAddr) -> Option<VmaInfo> {
        self.areas.get(&VRange::from(addr)).map(MmArea::info)
    }

    fn overlapping_range(&self, range: VRange) -> impl DoubleEndedIterator<Item = &MmArea> {
        self.areas.range::<VRange, _>(range.into_bounds())
    }

    fn check_overlapping_range(&self, range: VRange) -> bool {
        is_user(range) && self.overlapping_range(range).next().is_none()
    }

    fn random_start(&self) -> VAddr {
        VAddr::from(0x1234000)
    }

    fn find_available(&self, mut hint: VAddr, len: usize) -> Option<VAddr> {
        let len = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;

        if hint == VAddr::NULL {
            hint = self.random_start();
        } else {
            hint = hint.floor();
        }

        let mut range = VRange::from(hint).grow(len);

        loop {
            if !is_user(range) {
                return None;
            }

            match self.overlapping_range(range).next_back() {
                None => return Some(range.start()),
                Some(area) => {
                    range = VRange::from(area.range().end().ceil()).grow(len);
                }
            }
        }
    }

    /// Insert a fresh area and coalesce it with compatible neighbors.
    fn insert_merged(&mut self, area: MmArea) {
        let mut area = area;

        let prev_range = self
            .areas
            .range::<VRange, _>(..VRange::from(area.range().start()))
            .next_back()
            .map(MmArea::range);
        if let Some(prev_range) = prev_range {
            let prev = self.areas.get(&prev_range).unwrap();
            if prev.can_merge_with(&area) {
                let prev = self.areas.take(&prev_range).unwrap();
                let merged_range = VRange::new(prev.range().start(), area.range().end());
                area = MmArea::new(
                    merged_range,
                    prev.mapping.clone(),
                    prev.permission,
                    prev.is_shared,
                    None,
                );
            }
        }

        let next_range = self
            .areas
            .get(&VRange::from(area.range().end()))
            .map(MmArea::range);
        if let Some(next_range) = next_range {
            if area.can_merge_with(self.areas.get(&next_range).unwrap()) {
                self.areas.take(&next_range);
                area = MmArea::new(
                    VRange::new(area.range().start(), next_range.end()),
                    area.mapping.clone(),
                    area.permission,
                    area.is_shared,
                    None,
                );
            }
        }

        self.areas.insert(area);
    }
}

/// One address space: the sorted VMA set, the page-table model, the swap
/// map, and the counters, shared across the threads of a group through a
/// user refcount.
pub struct MmList {
    id: usize,
    ctx: Arc<VmContext>,
    user_count: AtomicUsize,
    /// CPUs this address space is active on; the shootdown targets.
    cpu_set: Spin<CpuSet>,
    counters: VmCounters,
    locked: Spin<MmListInner>,
}

impl MmList {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn ctx(&self) -> &Arc<VmContext> {
        &self.ctx
    }

    pub(crate) fn lock_inner(&self) -> SpinGuard<'_, MmListInner> {
        self.locked.lock()
    }

    pub fn total_pages(&self) -> usize {
        self.counters.total.load(Ordering::Relaxed)
    }

    pub fn locked_pages(&self) -> usize {
        self.counters.locked.load(Ordering::Relaxed)
    }

    pub fn shared_pages(&self) -> usize {
        self.counters.shared.load(Ordering::Relaxed)
    }

    pub fn exec_pages(&self) -> usize {
        self.counters.exec.load(Ordering::Relaxed)
    }

    pub(crate) fn note_mapped(&self, info: &VmaInfo) {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        if info.is_shared {
            self.counters.shared.fetch_add(1, Ordering::Relaxed);
        }
        if info.permission.execute {
            self.counters.exec.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn note_unmapped(&self, info: &VmaInfo) {
        self.counters.total.fetch_sub(1, Ordering::Relaxed);
        if info.is_shared {
            self.counters.shared.fetch_sub(1, Ordering::Relaxed);
        }
        if info.permission.execute {
            self.counters.exec.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn get_user(&self) {
        self.user_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true when the caller dropped the last user.
    pub fn put_user(&self) -> bool {
        let old = self.user_count.fetch_sub(1, Ordering::Release);
        assert_ne!(old, 0, "mm user count underflow");
        old == 1
    }

    pub fn user_count(&self) -> usize {
        self.user_count.load(Ordering::Relaxed)
    }

    /// This mm becomes the active address space on `cpu`.
    pub fn activate(&self, cpu: CpuId) {
        self.cpu_set.lock().insert(cpu);
        self.ctx.cpus.get(cpu).set_active_root(self.id);
    }

    pub fn deactivate(&self, cpu: CpuId) {
        self.cpu_set.lock().remove(cpu);
    }

    pub fn cpu_set(&self) -> CpuSet {
        *self.cpu_set.lock()
    }

    /// Flush one translation locally and, when the mm is live on other
    /// CPUs, broadcast the invalidation with a completion barrier.
    pub(crate) fn flush_tlb_page(&self, addr: VAddr) {
        let set = self.cpu_set();
        let Some(initiator) = set.iter().next() else {
            return;
        };

        self.ctx.cpus.get(initiator).flush_tlb_page(addr);
        if set.count() > 1 {
            self.ctx.irq.tlb_shootdown(initiator, set, Some(addr));
        }
    }

    pub(crate) fn flush_tlb_all(&self) {
        let set = self.cpu_set();
        let Some(initiator) = set.iter().next() else {
            return;
        };

        self.ctx.cpus.get(initiator).flush_tlb();
        if set.count() > 1 {
            self.ctx.irq.tlb_shootdown(initiator, set, None);
        }
    }

    pub fn find_vma(&self, addr: VAddr) -> Option<VmaInfo> {
        self.lock_inner().area_at(addr)
    }

    pub fn create_vma(
        &self,
        start: VAddr,
        size: usize,
        permission: Permission,
        is_shared: bool,
    ) -> KResult<VmaInfo> {
        let at = self.mmap(start, size, Mapping::Anonymous, permission, is_shared, true)?;
        Ok(self.find_vma(at).expect("the area was just inserted"))
    }

    pub fn mmap(
        &self,
        hint: VAddr,
        len: usize,
        mapping: Mapping,
        permission: Permission,
        is_shared: bool,
        fixed: bool,
    ) -> KResult<VAddr> {
        if len == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let len = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let hint = hint.floor();

        let mut inner = self.lock_inner();

        let at = if fixed {
            let range = VRange::from(hint).grow(len);
            if !is_user(range) {
                return Err(KernelError::InvalidArgument);
            }
            if !inner.check_overlapping_range(range) {
                return Err(KernelError::AlreadyExists);
            }
            hint
        } else {
            let mut at = None;
            if hint != VAddr::NULL {
                let range = VRange::from(hint).grow(len);
                if inner.check_overlapping_range(range) {
                    at = Some(hint);
                }
            }
            match at {
                Some(at) => at,
                None => inner
                    .find_available(hint, len)
                    .ok_or(KernelError::NoMemory)?,
            }
        };

        let range = VRange::from(at).grow(len);
        let area = MmArea::new(range, mapping.clone(), permission, is_shared, None);

        if let Mapping::File(file_mapping) = &mapping {
            file_mapping.file.mmap_get();
        }

        inner.insert_merged(area);
        Ok(at)
    }

    /// Attach a capability set to the area containing `addr`. Separate from
    /// `mmap` because most mappings never carry one.
    pub fn set_vma_ops(&self, addr: VAddr, ops: Arc<VmOperations>) -> KResult<()> {
        let mut inner = self.lock_inner();
        let range = inner
            .areas
            .get(&VRange::from(addr))
            .map(MmArea::range)
            .ok_or(KernelError::NoEntry)?;

        let mut area = inner.areas.take(&range).unwrap();
        if let Some(open) = ops.open {
            open(range);
        }
        area.ops = Some(ops);
        inner.areas.insert(area);
        Ok(())
    }

    pub fn munmap(&self, start: VAddr, len: usize) -> KResult<()> {
        if start.floor() != start || len == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let end = (start + len).ceil();
        let range_to_unmap = VRange::new(start, end);
        if !is_user(range_to_unmap) {
            return Err(KernelError::InvalidArgument);
        }

        let mut inner = self.lock_inner();
        self.unmap_range_locked(&mut inner, range_to_unmap);
        drop(inner);

        self.flush_tlb_all();
        Ok(())
    }

    fn unmap_range_locked(&self, inner: &mut MmListInner, range_to_unmap: VRange) {
        loop {
            let Some(victim_range) = inner
                .overlapping_range(range_to_unmap)
                .next()
                .map(MmArea::range)
            else {
                break;
            };

            let area = inner.areas.take(&victim_range).unwrap();
            let info = area.info();
            let Some((left, mid, right)) = victim_range.mask_with_checked(&range_to_unmap) else {
                inner.areas.insert(area);
                break;
            };

            // Drop what is mapped in the middle part.
            for (_, pte) in inner.page_table.take_range(mid) {
                if !pte.is_present() {
                    continue;
                }
                self.drop_frame_ref(pte.pfn(), &info);
            }

            // And any swapped-out pages there.
            let swapped: Vec<VAddr> = inner
                .swap_map
                .range(mid.start()..mid.end())
                .map(|(&addr, _)| addr)
                .collect();
            for addr in swapped {
                let entry = inner.swap_map.remove(&addr).unwrap();
                self.ctx.swap.release(entry);
            }

            if let Some(close) = area.ops.as_ref().and_then(|ops| ops.close) {
                close(mid);
            }
            if let (Mapping::File(file_mapping), None, None) = (&area.mapping, left, right) {
                file_mapping.file.mmap_put();
            }

            match (left, right) {
                (None, None) => {}
                (Some(left), None) => {
                    let (Some(left_area), _) = area.split(left.end()) else {
                        unreachable!("`left.end()` is within the area");
                    };
                    inner.areas.insert(left_area);
                }
                (None, Some(right)) => {
                    let (_, Some(right_area)) = area.split(right.start()) else {
                        unreachable!("`right.start()` is within the area");
                    };
                    inner.areas.insert(right_area);
                }
                (Some(left), Some(right)) => {
                    let (Some(left_area), Some(rest)) = area.split(left.end()) else {
                        unreachable!("`left.end()` is within the area");
                    };
                    let (_, Some(right_area)) = rest.split(right.start()) else {
                        unreachable!("`right.start()` is within the area");
                    };
                    inner.areas.insert(left_area);
                    inner.areas.insert(right_area);
                }
            }
        }
    }

    fn drop_frame_ref(&self, pfn: PFN, info: &VmaInfo) {
        let frame = self.ctx.frames.frame(pfn);
        frame.mapcount.fetch_sub(1, Ordering::Relaxed);
        self.note_unmapped(info);

        if frame.put() {
            frame.set_mapping(None);
            self.ctx.pmm.free_pages(pfn, 0);
        }
    }

    pub fn mprotect(&self, start: VAddr, len: usize, permission: Permission) -> KResult<()> {
        if start.floor() != start || len == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let end = (start + len).ceil();
        let range_to_protect = VRange::new(start, end);
        if !is_user(range_to_protect) {
            return Err(KernelError::InvalidArgument);
        }

        let mut inner = self.lock_inner();
        let mut found = false;

        let old_areas = core::mem::take(&mut inner.areas);
        for mut area in old_areas {
            let Some((left, mid, right)) = area.range().mask_with_checked(&range_to_protect)
            else {
                inner.areas.insert(area);
                continue;
            };

            found = true;

            if let Some(left) = left {
                let (Some(left_area), Some(rest)) = area.split(left.end()) else {
                    unreachable!("`left.end()` is within the area");
                };
                inner.areas.insert(left_area);
                area = rest;
            }

            if let Some(right) = right {
                let (Some(rest), Some(right_area)) = area.split(right.start()) else {
                    unreachable!("`right.start()` is within the area");
                };
                inner.areas.insert(right_area);
                area = rest;
            }

            for (_, pte) in inner.page_table.iter_range_mut(mid) {
                let mut attr = pte.attr();

                attr.set(PageAttribute::READ, permission.read);
                if !attr.contains(PageAttribute::COPY_ON_WRITE) {
                    attr.set(PageAttribute::WRITE, permission.write);
                }
                attr.set(PageAttribute::EXECUTE, permission.execute);

                if !permission.read && !permission.write && !permission.execute {
                    attr.remove(PageAttribute::PRESENT);
                }

                pte.set_attr(attr);
            }

            area.permission = permission;
            inner.areas.insert(area);
        }

        drop(inner);

        if !found {
            return Err(KernelError::NoMemory);
        }

        self.flush_tlb_all();
        Ok(())
    }

    pub fn mremap(
        &self,
        old_start: VAddr,
        old_len: usize,
        new_len: usize,
        may_move: bool,
    ) -> KResult<VAddr> {
        if old_start.floor() != old_start || old_len == 0 || new_len == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let old_len = old_len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let new_len = new_len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let old_range = VRange::from(old_start).grow(old_len);

        if new_len == old_len {
            return Ok(old_start);
        }

        if new_len < old_len {
            self.munmap(old_start + new_len, old_len - new_len)?;
            return Ok(old_start);
        }

        let mut inner = self.lock_inner();

        // The whole old range must live in one area.
        let area_range = inner
            .areas
            .get(&VRange::from(old_start))
            .map(MmArea::range)
            .ok_or(KernelError::NoEntry)?;
        if area_range.end() < old_range.end() {
            return Err(KernelError::InvalidArgument);
        }

        let tail = VRange::from(old_start + old_len).grow(new_len - old_len);
        let grow_in_place =
            area_range.end() == old_range.end() && inner.check_overlapping_range(tail);

        if grow_in_place {
            let area = inner.areas.take(&area_range).unwrap();
            unsafe {
                // SAFETY: The tail was just checked to be unoccupied.
                area.grow(new_len - old_len);
            }
            inner.areas.insert(area);
            return Ok(old_start);
        }

        if !may_move {
            return Err(KernelError::NoMemory);
        }

        let new_start = inner
            .find_available(VAddr::NULL, new_len)
            .ok_or(KernelError::NoMemory)?;

        // Carve the old range out of its area, then transplant mappings.
        let area = inner.areas.take(&area_range).unwrap();
        let info = area.info();
        let (left, rest) = area.split(old_start);
        if let Some(left) = left {
            inner.areas.insert(left);
        }
        let (moved, right) = rest.expect("the old range is within the area").split(
            old_range.end(),
        );
        if let Some(right) = right {
            inner.areas.insert(right);
        }
        let moved = moved.expect("the old range is within the area");

        inner.areas.insert(MmArea::new(
            VRange::from(new_start).grow(new_len),
            moved.mapping.clone(),
            info.permission,
            info.is_shared,
            info.ops.clone(),
        ));

        let moved_ptes: Vec<(VAddr, _)> = inner.page_table.take_range(old_range).collect();
        for (addr, pte) in moved_ptes {
            let new_addr = new_start + (addr - old_start);
            let frame = self.ctx.frames.frame(pte.pfn());
            frame.set_mapping(Some(MappingRef {
                owner: self.id,
                index: usize::from(new_addr),
            }));
            inner.page_table.set(new_addr, pte.pfn(), pte.attr());
        }

        let moved_swaps: Vec<VAddr> = inner
            .swap_map
            .range(old_range.start()..old_range.end())
            .map(|(&addr, _)| addr)
            .collect();
        for addr in moved_swaps {
            let entry = inner.swap_map.remove(&addr).unwrap();
            inner.swap_map.insert(new_start + (addr - old_start), entry);
        }

        drop(inner);
        self.flush_tlb_all();
        Ok(new_start)
    }

    /// This should be called only **once** for every address space.
    pub fn register_break(&self, start: VAddr) {
        let mut inner = self.lock_inner();
        assert!(inner.break_start.is_none() && inner.break_pos.is_none());

        inner.break_start = Some(start);
        inner.break_pos = Some(start);
    }

    pub fn set_break(&self, pos: Option<VAddr>) -> VAddr {
        let mut inner = self.lock_inner();

        let current_break = inner.break_pos.expect("break was never registered");
        let pos = match pos {
            None => return current_break,
            Some(pos) => pos.ceil(),
        };

        if pos <= current_break {
            return current_break;
        }

        let range = VRange::new(current_break, pos);
        if !inner.check_overlapping_range(range) {
            return current_break;
        }

        inner.insert_merged(MmArea::new(
            range,
            Mapping::Anonymous,
            Permission::rw(),
            false,
            None,
        ));
        inner.break_pos = Some(pos);

        pos
    }

    /// Install a frame directly, taking over the caller's reference.
    pub fn map_page(&self, addr: VAddr, pfn: PFN, permission: Permission) -> KResult<()> {
        let addr = addr.floor();
        let mut inner = self.lock_inner();

        let info = inner.area_at(addr).ok_or(KernelError::NoEntry)?;
        if inner.page_table.get(addr).is_some_and(|pte| pte.is_present()) {
            return Err(KernelError::AlreadyExists);
        }

        let mut attr = PageAttribute::PRESENT | PageAttribute::USER;
        attr.set(PageAttribute::READ, permission.read);
        attr.set(PageAttribute::WRITE, permission.write);
        attr.set(PageAttribute::EXECUTE, permission.execute);

        let frame = self.ctx.frames.frame(pfn);
        frame.born(self.ctx.timer.now_ms());
        frame.mapcount.fetch_add(1, Ordering::Relaxed);
        frame.set_mapping(Some(MappingRef {
            owner: self.id,
            index: usize::from(addr),
        }));

        inner.page_table.set(addr, pfn, attr);
        self.note_mapped(&info);
        Ok(())
    }

    pub fn unmap_page(&self, addr: VAddr) -> KResult<()> {
        let addr = addr.floor();
        let mut inner = self.lock_inner();

        let info = inner.area_at(addr).ok_or(KernelError::NoEntry)?;
        let pte = inner.page_table.take(addr).ok_or(KernelError::NoEntry)?;
        drop(inner);

        if pte.is_present() {
            self.drop_frame_ref(pte.pfn(), &info);
        }
        self.flush_tlb_page(addr);
        Ok(())
    }

    pub fn get_page(&self, addr: VAddr) -> Option<PFN> {
        self.lock_inner()
            .page_table
            .get(addr)
            .filter(|pte| pte.is_present())
            .map(|pte| pte.pfn())
    }

    /// Copy out of the address space, faulting pages in as needed.
    pub fn read_user(&self, addr: VAddr, buf: &mut [u8]) -> KResult<()> {
        self.access_user(addr, buf.len(), false, |frames, pfn, page_off, chunk, offset, buf| {
            unsafe {
                // SAFETY: The mm lock is held by the caller.
                frames.with_page(pfn, |bytes| {
                    buf[offset..offset + chunk].copy_from_slice(&bytes[page_off..page_off + chunk]);
                });
            }
        }, buf)
    }

    /// Copy into the address space, with write-fault semantics (CoW
    /// breaks, dirty marking).
    pub fn write_user(&self, addr: VAddr, data: &[u8]) -> KResult<()> {
        let mut data_copy = alloc::vec![0u8; data.len()];
        data_copy.copy_from_slice(data);
        self.access_user(addr, data.len(), true, |frames, pfn, page_off, chunk, offset, buf| {
            unsafe {
                // SAFETY: The mm lock is held by the caller.
                frames.with_page(pfn, |bytes| {
                    bytes[page_off..page_off + chunk].copy_from_slice(&buf[offset..offset + chunk]);
                });
            }
        }, &mut data_copy)
    }

    fn access_user(
        &self,
        start: VAddr,
        len: usize,
        write: bool,
        mut copy: impl FnMut(&FrameTable, PFN, usize, usize, usize, &mut [u8]),
        buf: &mut [u8],
    ) -> KResult<()> {
        let mut offset = 0;

        while offset < len {
            let current = start + offset;
            let page = current.floor();
            let page_off = current - page;
            let chunk = (PAGE_SIZE - page_off).min(len - offset);

            let mut error = PageFaultError::USER;
            if write {
                error |= PageFaultError::WRITE;
            }
            self.handle_fault(current, error)?;

            let inner = self.lock_inner();
            let pte = inner
                .page_table
                .get(page)
                .filter(|pte| pte.is_present())
                .ok_or(KernelError::SegmentationViolation)?;
            copy(&self.ctx.frames, pte.pfn(), page_off, chunk, offset, buf);
            drop(inner);

            offset += chunk;
        }

        Ok(())
    }

    /// Move one resident page to another node: allocate there, copy,
    /// switch the PTE, drop the old frame.
    pub fn migrate_page(&self, addr: VAddr, target_node: usize) -> KResult<()> {
        let page = addr.floor();
        let mut inner = self.lock_inner();

        let (old_pfn, attr) = {
            let pte = inner.page_table.get(page).ok_or(KernelError::NoEntry)?;
            if !pte.is_present() {
                return Err(KernelError::NoEntry);
            }
            (pte.pfn(), pte.attr())
        };

        if self.ctx.pmm.node_of(old_pfn) == Some(target_node) {
            return Ok(());
        }

        let old_frame = self.ctx.frames.frame(old_pfn);
        if old_frame.get_refcount() != 1 {
            return Err(KernelError::Busy);
        }

        let new_pfn = self
            .ctx
            .pmm
            .alloc_pages_exact_node(target_node, 0, AllocFlags::empty())
            .ok_or(KernelError::NoMemory)?;

        self.ctx.frames.copy_page(old_pfn, new_pfn);

        let new_frame = self.ctx.frames.frame(new_pfn);
        new_frame.born(self.ctx.timer.now_ms());
        new_frame.mapcount.fetch_add(1, Ordering::Relaxed);
        new_frame.set_mapping(old_frame.mapping());

        inner.page_table.set(page, new_pfn, attr);
        drop(inner);

        old_frame.mapcount.fetch_sub(1, Ordering::Relaxed);
        old_frame.set_mapping(None);
        assert!(old_frame.put(), "migrated frame still referenced");
        self.ctx.pmm.free_pages(old_pfn, 0);

        self.flush_tlb_page(page);
        Ok(())
    }

    /// The VMA ranges in address order.
    pub fn vma_ranges(&self) -> Vec<VRange> {
        self.lock_inner().areas.iter().map(MmArea::range).collect()
    }

    /// Every swapped-out page with its slot.
    pub fn swapped_out(&self) -> Vec<(VAddr, SwapEntry)> {
        self.lock_inner()
            .swap_map
            .iter()
            .map(|(&addr, &entry)| (addr, entry))
            .collect()
    }

    /// The VMA list must stay strictly sorted, pairwise non-overlapping,
    /// and page-aligned.
    pub fn check_vma_invariants(&self) {
        let ranges = self.vma_ranges();

        for range in &ranges {
            assert!(range.start() < range.end());
            assert!(range.start().is_page_aligned() && range.end().is_page_aligned());
        }
        for pair in ranges.windows(2) {
            assert!(
                pair[0].end() <= pair[1].start(),
                "VMAs {:?} and {:?} overlap or are unsorted",
                pair[0],
                pair[1]
            );
        }
    }

    /// Fork-style duplication: the areas are copied, private resident
    /// pages become copy-on-write in both spaces, swap entries gain a
    /// reference.
    pub fn new_cloned(&self) -> Arc<MmList> {
        let new_mm = self.ctx.create_mm();

        let mut inner = self.lock_inner();
        let mut new_inner = new_mm.lock_inner();

        new_inner.break_start = inner.break_start;
        new_inner.break_pos = inner.break_pos;

        for area in &inner.areas {
            new_inner.areas.insert(area.clone());
            if let Mapping::File(file_mapping) = &area.mapping {
                file_mapping.file.mmap_get();
            }
        }

        let resident: Vec<(VAddr, PFN, PageAttribute)> = inner
            .page_table
            .iter()
            .filter(|(_, pte)| pte.is_present())
            .map(|(addr, pte)| (addr, pte.pfn(), pte.attr()))
            .collect();

        for (addr, pfn, mut attr) in resident {
            let info = inner.area_at(addr).expect("resident page outside any VMA");
            let frame = self.ctx.frames.frame(pfn);

            if !info.is_shared {
                attr.remove(PageAttribute::WRITE);
                attr.insert(PageAttribute::COPY_ON_WRITE);

                // The parent's PTE turns read-only as well.
                inner
                    .page_table
                    .get_mut(addr)
                    .expect("the entry exists")
                    .set_attr(attr & !PageAttribute::ACCESSED);
            }

            frame.get();
            frame.mapcount.fetch_add(1, Ordering::Relaxed);
            new_inner.page_table.set(addr, pfn, attr);
            new_mm.note_mapped(&info);
        }

        let duplicated: Vec<(VAddr, SwapEntry)> = inner
            .swap_map
            .iter()
            .map(|(&addr, &entry)| (addr, entry))
            .collect();
        for (addr, entry) in duplicated {
            self.ctx.swap.duplicate(entry);
            new_inner.swap_map.insert(addr, entry);
        }

        drop(new_inner);
        drop(inner);

        // The parent's write permissions just changed under its users.
        self.flush_tlb_all();
        new_mm
    }
}

impl Drop for MmList {
    fn drop(&mut self) {
        let (areas, resident, swapped) = {
            let inner = self.locked.get_mut();

            let areas: Vec<VmaInfo> = inner.areas.iter().map(MmArea::info).collect();
            let resident: Vec<(VAddr, PFN)> = inner
                .page_table
                .take_range(VRange::new(VAddr::NULL, VAddr::from(USER_SPACE_TOP)))
                .filter(|(_, pte)| pte.is_present())
                .map(|(addr, pte)| (addr, pte.pfn()))
                .collect();
            let swapped: Vec<SwapEntry> =
                core::mem::take(&mut inner.swap_map).into_values().collect();

            (areas, resident, swapped)
        };

        for (addr, pfn) in resident {
            let info = areas
                .iter()
                .find(|info| info.range.contains(addr))
                .cloned()
                .expect("resident page outside any VMA");
            self.drop_frame_ref(pfn, &info);
        }

        for entry in swapped {
            self.ctx.swap.release(entry);
        }

        for info in &areas {
            if let Some(close) = info.ops.as_ref().and_then(|ops| ops.close) {
                close(info.range);
            }
            if let Mapping::File(file_mapping) = &info.mapping {
                file_mapping.file.mmap_put();
            }
        }

        self.ctx.unregister(self.id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kernel::constants::KernelConfig;
    use crate::kernel::mem::memory_map::MemoryMap;
    use crate::kernel::mem::Permission;
    use zenith_mm::paging::PAGE_SIZE;

    pub(crate) fn test_ctx_with(
        pages: usize,
        nr_cpus: usize,
        node_ranges: Option<Vec<(PFN, PFN)>>,
    ) -> Arc<VmContext> {
        let frames = Arc::new(FrameTable::new(PFN::from_val(0), pages));
        let pmm = Arc::new(PageAllocator::new(
            frames.clone(),
            &MemoryMap::flat(pages),
            None,
            node_ranges,
        ));
        let kmalloc = Arc::new(Kmalloc::new(pmm.clone()));
        let cpus = Arc::new(PerCpu::new(nr_cpus, Cpu::new));
        let irq = Arc::new(InterruptTable::new(cpus.clone()));
        let timer = Arc::new(Timer::new());
        let config = Arc::new(KernelConfig::new());
        let swap = Arc::new(SwapSubsystem::new(
            frames.clone(),
            pmm.clone(),
            kmalloc.clone(),
            timer.clone(),
            config,
        ));

        VmContext::new(frames, pmm, kmalloc, irq, cpus, timer, swap)
    }

    pub(crate) fn test_ctx() -> Arc<VmContext> {
        test_ctx_with(512, 2, None)
    }

    fn vaddr(addr: usize) -> VAddr {
        VAddr::from(addr)
    }

    #[test]
    fn vmas_stay_sorted_and_disjoint() {
        let ctx = test_ctx();
        let mm = ctx.create_mm();

        mm.mmap(vaddr(0x30000000), 2 * PAGE_SIZE, Mapping::Anonymous, Permission::rw(), false, true)
            .unwrap();
        mm.mmap(vaddr(0x10000000), PAGE_SIZE, Mapping::Anonymous, Permission::ro(), false, true)
            .unwrap();
        mm.mmap(vaddr(0x20000000), 3 * PAGE_SIZE, Mapping::Anonymous, Permission::rx(), false, true)
            .unwrap();

        mm.check_vma_invariants();
        assert_eq!(mm.vma_ranges().len(), 3);

        // Overlap with an existing area is refused.
        assert_eq!(
            mm.mmap(
                vaddr(0x20001000),
                PAGE_SIZE,
                Mapping::Anonymous,
                Permission::rw(),
                false,
                true
            ),
            Err(KernelError::AlreadyExists)
        );

        // Without `fixed`, the request slides to a free hole instead.
        let at = mm
            .mmap(
                vaddr(0x20001000),
                PAGE_SIZE,
                Mapping::Anonymous,
                Permission::rw(),
                false,
                false,
            )
            .unwrap();
        assert_ne!(at, vaddr(0x20001000));
        mm.check_vma_invariants();
    }

    #[test]
    fn adjacent_compatible_areas_merge() {
        let ctx = test_ctx();
        let mm = ctx.create_mm();

        mm.mmap(vaddr(0x10000000), 2 * PAGE_SIZE, Mapping::Anonymous, Permission::rw(), false, true)
            .unwrap();
        mm.mmap(vaddr(0x10002000), 2 * PAGE_SIZE, Mapping::Anonymous, Permission::rw(), false, true)
            .unwrap();

        let ranges = mm.vma_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0], VRange::new(vaddr(0x10000000), vaddr(0x10004000)));

        // Different protection blocks the merge.
        mm.mmap(vaddr(0x10004000), PAGE_SIZE, Mapping::Anonymous, Permission::ro(), false, true)
            .unwrap();
        assert_eq!(mm.vma_ranges().len(), 2);
    }

    #[test]
    fn munmap_splits_into_at_most_two() {
        let ctx = test_ctx();
        let mm = ctx.create_mm();

        mm.mmap(vaddr(0x10000000), 8 * PAGE_SIZE, Mapping::Anonymous, Permission::rw(), false, true)
            .unwrap();
        mm.write_user(vaddr(0x10003000), &[7u8; 8]).unwrap();
        assert_eq!(mm.total_pages(), 1);

        mm.munmap(vaddr(0x10002000), 3 * PAGE_SIZE).unwrap();

        let ranges = mm.vma_ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], VRange::new(vaddr(0x10000000), vaddr(0x10002000)));
        assert_eq!(ranges[1], VRange::new(vaddr(0x10005000), vaddr(0x10008000)));
        // The resident page inside the hole was freed.
        assert_eq!(mm.total_pages(), 0);
        mm.check_vma_invariants();
    }

    #[test]
    fn mprotect_splits_into_at_most_three() {
        let ctx = test_ctx();
        let mm = ctx.create_mm();

        mm.mmap(vaddr(0x10000000), 6 * PAGE_SIZE, Mapping::Anonymous, Permission::rw(), false, true)
            .unwrap();
        mm.mprotect(vaddr(0x10002000), 2 * PAGE_SIZE, Permission::ro())
            .unwrap();

        let ranges = mm.vma_ranges();
        assert_eq!(ranges.len(), 3);
        assert_eq!(mm.find_vma(vaddr(0x10002000)).unwrap().permission, Permission::ro());
        assert_eq!(mm.find_vma(vaddr(0x10000000)).unwrap().permission, Permission::rw());

        // Writes into the read-only window now violate.
        assert_eq!(
            mm.handle_fault(vaddr(0x10002000), PageFaultError::USER | PageFaultError::WRITE),
            Err(KernelError::SegmentationViolation)
        );
        mm.check_vma_invariants();
    }

    #[test]
    fn fault_outside_every_vma_is_a_violation() {
        let ctx = test_ctx();
        let mm = ctx.create_mm();

        assert_eq!(
            mm.handle_fault(vaddr(0x66660000), PageFaultError::USER),
            Err(KernelError::SegmentationViolation)
        );
    }

    #[test]
    fn instruction_fetch_needs_execute() {
        let ctx = test_ctx();
        let mm = ctx.create_mm();

        mm.mmap(vaddr(0x10000000), PAGE_SIZE, Mapping::Anonymous, Permission::rw(), false, true)
            .unwrap();

        assert_eq!(
            mm.handle_fault(
                vaddr(0x10000000),
                PageFaultError::USER | PageFaultError::INSTRUCTION_FETCH
            ),
            Err(KernelError::SegmentationViolation)
        );
    }

    #[test]
    fn cow_fork_copies_on_first_write() {
        let ctx = test_ctx();
        let parent = ctx.create_mm();
        let at = vaddr(0x10000000);

        parent
            .mmap(at, PAGE_SIZE, Mapping::Anonymous, Permission::rw(), false, true)
            .unwrap();
        parent.write_user(at, b"original").unwrap();

        let child = parent.new_cloned();
        let shared_pfn = parent.get_page(at).unwrap();
        assert_eq!(child.get_page(at), Some(shared_pfn));
        assert_eq!(ctx.frames.frame(shared_pfn).get_refcount(), 2);

        // The writer gets a private copy; the reader keeps the original.
        parent.write_user(at, b"rewritten").unwrap();

        let writer_pfn = parent.get_page(at).unwrap();
        assert_ne!(writer_pfn, shared_pfn);
        assert_eq!(ctx.frames.frame(shared_pfn).get_refcount(), 1);

        let mut seen = [0u8; 9];
        parent.read_user(at, &mut seen).unwrap();
        assert_eq!(&seen, b"rewritten");

        let mut seen = [0u8; 8];
        child.read_user(at, &mut seen).unwrap();
        assert_eq!(&seen, b"original");
    }

    #[test]
    fn cow_sole_owner_writes_in_place() {
        let ctx = test_ctx();
        let parent = ctx.create_mm();
        let at = vaddr(0x10000000);

        parent
            .mmap(at, PAGE_SIZE, Mapping::Anonymous, Permission::rw(), false, true)
            .unwrap();
        parent.write_user(at, b"data").unwrap();

        let pfn = parent.get_page(at).unwrap();
        let child = parent.new_cloned();
        drop(child);

        // Back to one reference: the write must not copy.
        parent.write_user(at, b"mine").unwrap();
        assert_eq!(parent.get_page(at), Some(pfn));
    }

    #[test]
    fn mremap_moves_contents() {
        let ctx = test_ctx();
        let mm = ctx.create_mm();
        let at = vaddr(0x10000000);

        mm.mmap(at, 2 * PAGE_SIZE, Mapping::Anonymous, Permission::rw(), false, true)
            .unwrap();
        mm.write_user(at, b"movable").unwrap();

        // Block in-place growth, forcing a move.
        mm.mmap(vaddr(0x10002000), PAGE_SIZE, Mapping::Anonymous, Permission::ro(), false, true)
            .unwrap();

        let new_at = mm.mremap(at, 2 * PAGE_SIZE, 4 * PAGE_SIZE, true).unwrap();
        assert_ne!(new_at, at);

        let mut seen = [0u8; 7];
        mm.read_user(new_at, &mut seen).unwrap();
        assert_eq!(&seen, b"movable");

        assert!(mm.find_vma(at).is_none());
        mm.check_vma_invariants();
    }

    #[test]
    fn brk_grows_the_heap() {
        let ctx = test_ctx();
        let mm = ctx.create_mm();

        mm.register_break(vaddr(0x20000000));
        assert_eq!(mm.set_break(None), vaddr(0x20000000));

        let new_break = mm.set_break(Some(vaddr(0x20003000)));
        assert_eq!(new_break, vaddr(0x20003000));
        assert!(mm.find_vma(vaddr(0x20001000)).is_some());

        // Shrinking below the current break is refused.
        assert_eq!(mm.set_break(Some(vaddr(0x20001000))), vaddr(0x20003000));
    }

    #[test]
    fn map_and_unmap_page_balance_the_counters() {
        let ctx = test_ctx();
        let mm = ctx.create_mm();
        let at = vaddr(0x10000000);

        mm.create_vma(at, 4 * PAGE_SIZE, Permission::rw(), false).unwrap();

        let pfn = ctx.pmm.alloc_pages(0, AllocFlags::ZERO).unwrap();
        mm.map_page(at, pfn, Permission::rw()).unwrap();
        assert_eq!(mm.total_pages(), 1);
        assert_eq!(mm.get_page(at), Some(pfn));

        let free_before = ctx.pmm.free_page_count();
        mm.unmap_page(at).unwrap();
        assert_eq!(mm.total_pages(), 0);
        assert!(mm.get_page(at).is_none());
        assert_eq!(ctx.pmm.free_page_count(), free_before + 1);
    }

    #[test]
    fn migration_honors_the_target_node() {
        let ctx = test_ctx_with(
            256,
            2,
            Some(vec![
                (PFN::from_val(0), PFN::from_val(128)),
                (PFN::from_val(128), PFN::from_val(256)),
            ]),
        );
        let mm = ctx.create_mm();
        let at = vaddr(0x10000000);

        mm.mmap(at, PAGE_SIZE, Mapping::Anonymous, Permission::rw(), false, true)
            .unwrap();
        mm.write_user(at, b"mobile").unwrap();

        let old_pfn = mm.get_page(at).unwrap();
        let old_node = ctx.pmm.node_of(old_pfn).unwrap();
        let target = 1 - old_node;

        mm.migrate_page(at, target).unwrap();

        let new_pfn = mm.get_page(at).unwrap();
        assert_eq!(ctx.pmm.node_of(new_pfn), Some(target));
        assert_ne!(new_pfn, old_pfn);

        let mut seen = [0u8; 6];
        mm.read_user(at, &mut seen).unwrap();
        assert_eq!(&seen, b"mobile");
    }

    #[test]
    fn destroying_the_mm_returns_every_frame() {
        let ctx = test_ctx();
        let free_before = ctx.pmm.free_page_count();

        {
            let mm = ctx.create_mm();
            mm.mmap(vaddr(0x10000000), 8 * PAGE_SIZE, Mapping::Anonymous, Permission::rw(), false, true)
                .unwrap();
            for page in 0..8 {
                mm.write_user(vaddr(0x10000000 + page * PAGE_SIZE), &[1u8]).unwrap();
            }
            assert_eq!(mm.total_pages(), 8);
            assert!(ctx.lookup_mm(mm.id()).is_some());
        }

        assert_eq!(ctx.pmm.free_page_count(), free_before);
    }
}
