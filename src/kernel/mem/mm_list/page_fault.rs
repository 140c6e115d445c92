use core::sync::atomic::Ordering;

use bitflags::bitflags;

use zenith_mm::address::{AddrOps as _, VAddr};
use zenith_mm::page_table::PageAttribute;
use zenith_mm::paging::{MappingRef, PAGE_SIZE};

use super::{FaultRequest, Mapping, MmList, MmListInner, VmaInfo};
use crate::prelude::*;

bitflags! {
    /// Error-code bits as delivered by the fault vector.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultError: u32 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

impl MmList {
    /// Resolve a fault at `addr`. `SegmentationViolation` goes back to the
    /// caller: user mode turns it into a signal, kernel mode dies on it.
    pub fn handle_fault(&self, addr: VAddr, error: PageFaultError) -> KResult<()> {
        let mut inner = self.lock_inner();
        let page = addr.floor();

        let info = inner
            .area_at(addr)
            .ok_or(KernelError::SegmentationViolation)?;

        // Access checked against the VMA, not the PTE.
        if !info.permission.read {
            return Err(KernelError::SegmentationViolation);
        }
        if error.contains(PageFaultError::WRITE) && !info.permission.write {
            return Err(KernelError::SegmentationViolation);
        }
        if error.contains(PageFaultError::INSTRUCTION_FETCH) && !info.permission.execute {
            return Err(KernelError::SegmentationViolation);
        }

        if inner.swap_map.contains_key(&page) {
            return self.ctx.swap.swap_in_locked(self, &mut inner, page);
        }

        let now = self.ctx.timer.now_ms();
        let existing = inner.page_table.get(page).copied();

        match existing {
            Some(pte) if pte.is_present() => {
                let attr = pte.attr();
                let is_write = error.contains(PageFaultError::WRITE);

                if is_write && attr.contains(PageAttribute::COPY_ON_WRITE) {
                    self.handle_cow(&mut inner, &info, page, now)?;
                } else if is_write && !attr.contains(PageAttribute::WRITE) {
                    // A shared page being written for the first time; ask
                    // the mapping before making it writable.
                    if let Some(mkwrite) = info.ops.as_ref().and_then(|ops| ops.page_mkwrite) {
                        mkwrite(info.range, page - info.range.start())?;
                    }

                    let pte = inner.page_table.get_mut(page).expect("checked above");
                    pte.set_attr(
                        attr | PageAttribute::WRITE
                            | PageAttribute::DIRTY
                            | PageAttribute::ACCESSED,
                    );
                    self.ctx.frames.frame(pte.pfn()).touch(now);
                    self.flush_tlb_page(page);
                } else {
                    // Spurious fault; refresh the reference bits.
                    let mut attr = attr | PageAttribute::ACCESSED;
                    if is_write {
                        attr |= PageAttribute::DIRTY;
                    }
                    let pte = inner.page_table.get_mut(page).expect("checked above");
                    pte.set_attr(attr);
                    self.ctx.frames.frame(pte.pfn()).touch(now);
                }

                Ok(())
            }
            _ => self.populate(&mut inner, &info, page, error, now),
        }
    }

    /// First touch of a page: a zeroed anonymous frame, or one filled by
    /// the VMA's fault op / backing file.
    fn populate(
        &self,
        inner: &mut MmListInner,
        info: &VmaInfo,
        page: VAddr,
        error: PageFaultError,
        now: u64,
    ) -> KResult<()> {
        let pfn = self.ctx.alloc_user_page()?;
        let offset = page - info.range.start();

        let filled: KResult<()> = if let Some(fault) = info.ops.as_ref().and_then(|ops| ops.fault)
        {
            let request = FaultRequest {
                mapping: &info.mapping,
                offset,
                write: error.contains(PageFaultError::WRITE),
            };
            unsafe {
                // SAFETY: The frame was just allocated and is exclusively
                //         ours.
                self.ctx.frames.with_page(pfn, |bytes| fault(&request, bytes))
            }
        } else if let Mapping::File(file_mapping) = &info.mapping {
            if offset < file_mapping.length {
                let want = (file_mapping.length - offset).min(PAGE_SIZE);
                unsafe {
                    // SAFETY: As above.
                    self.ctx.frames.with_page(pfn, |bytes| {
                        file_mapping
                            .file
                            .read_at(file_mapping.offset + offset, &mut bytes[..want])
                            .map(|_| ())
                    })
                }
            } else {
                // Beyond the file: the page stays zero.
                Ok(())
            }
        } else {
            Ok(())
        };

        let is_write = error.contains(PageFaultError::WRITE);
        let mut writable = info.permission.write;

        // Shared file pages start clean: a read fault installs them
        // read-only so the first write goes through `page_mkwrite`.
        if info.is_shared && !info.anonymous {
            if is_write {
                if let Some(mkwrite) = info.ops.as_ref().and_then(|ops| ops.page_mkwrite) {
                    if let Err(err) = mkwrite(info.range, offset) {
                        let frame = self.ctx.frames.frame(pfn);
                        frame.put();
                        self.ctx.pmm.free_pages(pfn, 0);
                        return Err(err);
                    }
                }
            } else {
                writable = false;
            }
        }

        if let Err(err) = filled {
            let frame = self.ctx.frames.frame(pfn);
            frame.put();
            self.ctx.pmm.free_pages(pfn, 0);
            return Err(err);
        }

        let mut attr = PageAttribute::PRESENT | PageAttribute::USER | PageAttribute::ACCESSED;
        attr.set(PageAttribute::READ, info.permission.read);
        attr.set(PageAttribute::WRITE, writable);
        attr.set(PageAttribute::EXECUTE, info.permission.execute);
        if is_write {
            attr |= PageAttribute::DIRTY;
        }

        let frame = self.ctx.frames.frame(pfn);
        frame.born(now);
        frame.mapcount.fetch_add(1, Ordering::Relaxed);
        frame.set_mapping(Some(MappingRef {
            owner: self.id(),
            index: usize::from(page),
        }));

        inner.page_table.set(page, pfn, attr);
        self.note_mapped(info);
        Ok(())
    }

    /// Write to a copy-on-write page: the sole owner just regains write
    /// permission, a sharer gets a private copy and drops its reference to
    /// the old frame.
    fn handle_cow(
        &self,
        inner: &mut MmListInner,
        info: &VmaInfo,
        page: VAddr,
        now: u64,
    ) -> KResult<()> {
        let (old_pfn, mut attr) = {
            let pte = inner.page_table.get(page).expect("CoW entry exists");
            (pte.pfn(), pte.attr())
        };

        attr.remove(PageAttribute::COPY_ON_WRITE);
        attr.set(PageAttribute::WRITE, info.permission.write);
        attr |= PageAttribute::DIRTY | PageAttribute::ACCESSED;

        let old_frame = self.ctx.frames.frame(old_pfn);

        if old_frame.get_refcount() == 1 {
            // No one else holds the frame. If we read `1` here with the mm
            // lock held, no other space can be sharing it nor making it
            // CoW concurrently.
            old_frame.touch(now);
            inner
                .page_table
                .get_mut(page)
                .expect("CoW entry exists")
                .set_attr(attr);
        } else {
            let new_pfn = self.ctx.alloc_user_page()?;
            self.ctx.frames.copy_page(old_pfn, new_pfn);

            let new_frame = self.ctx.frames.frame(new_pfn);
            new_frame.born(now);
            new_frame.mapcount.fetch_add(1, Ordering::Relaxed);
            new_frame.set_mapping(Some(MappingRef {
                owner: self.id(),
                index: usize::from(page),
            }));

            inner
                .page_table
                .get_mut(page)
                .expect("CoW entry exists")
                .set(new_pfn, attr);

            old_frame.mapcount.fetch_sub(1, Ordering::Relaxed);
            if old_frame.put() {
                self.ctx.pmm.free_pages(old_pfn, 0);
            }
        }

        self.flush_tlb_page(page);
        Ok(())
    }
}
