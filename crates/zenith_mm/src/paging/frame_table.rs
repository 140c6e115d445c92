use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

use crate::address::{Addr as _, PAddr};

use super::{PageBlock, PageFrame, PAGE_SIZE, PAGE_SIZE_BITS, PFN};

/// The frame arena: one [`PageFrame`] record and one page of modeled
/// physical memory per PFN in `[base, base + len)`.
///
/// Frame records are indexed by PFN with bounds-checked access; the payload
/// is reached only through the accessors below, which stand in for the
/// kernel's direct map.
pub struct FrameTable {
    base: PFN,
    frames: Box<[PageFrame]>,
    payload: Box<[UnsafeCell<PageBlock>]>,
}

// SAFETY: Payload pages are only ever accessed by the current owner of the
//         frame (the zone lock for free frames, the cache lock for slab
//         frames, the mm lock or an exclusive reference for mapped ones).
unsafe impl Sync for FrameTable {}
unsafe impl Send for FrameTable {}

impl FrameTable {
    pub fn new(base: PFN, len: usize) -> Self {
        let frames = (0..len)
            .map(|_| PageFrame::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let payload = (0..len)
            .map(|_| UnsafeCell::new(PageBlock::zeroed()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            base,
            frames,
            payload,
        }
    }

    pub fn base(&self) -> PFN {
        self.base
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn end(&self) -> PFN {
        self.base + self.frames.len()
    }

    pub fn contains(&self, pfn: PFN) -> bool {
        self.base <= pfn && pfn < self.end()
    }

    /// # Panics
    /// Panics if `pfn` is outside the table.
    pub fn frame(&self, pfn: PFN) -> &PageFrame {
        &self.frames[pfn - self.base]
    }

    pub fn get_frame(&self, pfn: PFN) -> Option<&PageFrame> {
        self.contains(pfn).then(|| self.frame(pfn))
    }

    pub fn pfns(&self) -> impl Iterator<Item = PFN> + '_ {
        (0..self.frames.len()).map(move |i| self.base + i)
    }

    fn page_ptr(&self, pfn: PFN) -> *mut u8 {
        self.payload[pfn - self.base].get().cast()
    }

    /// Run `func` on the page's bytes.
    ///
    /// # Safety
    /// The caller MUST own the frame exclusively for the duration of the
    /// call: freshly allocated, locked, or guarded by the lock of the
    /// subsystem the frame belongs to.
    pub unsafe fn with_page<R>(&self, pfn: PFN, func: impl FnOnce(&mut [u8]) -> R) -> R {
        // SAFETY: Exclusivity is guaranteed by the caller.
        let bytes = unsafe { core::slice::from_raw_parts_mut(self.page_ptr(pfn), PAGE_SIZE) };
        func(bytes)
    }

    pub fn zero_page(&self, pfn: PFN) {
        unsafe {
            // SAFETY: See the write path below.
            core::ptr::write_bytes(self.page_ptr(pfn), 0, PAGE_SIZE);
        }
    }

    pub fn copy_page(&self, src: PFN, dst: PFN) {
        assert_ne!(src, dst);
        unsafe {
            // SAFETY: The two pages are distinct; the caller owns `dst` and
            //         no one is writing `src` (it is shared read-only).
            core::ptr::copy_nonoverlapping(self.page_ptr(src), self.page_ptr(dst), PAGE_SIZE);
        }
    }

    /// Copy out of modeled physical memory, crossing page boundaries.
    pub fn read(&self, addr: PAddr, buf: &mut [u8]) {
        self.for_each_chunk(addr, buf.len(), |offset, pfn, page_off, len| unsafe {
            // SAFETY: Reads race with nothing; the caller owns the range.
            core::ptr::copy_nonoverlapping(
                self.page_ptr(pfn).add(page_off),
                buf.as_mut_ptr().add(offset),
                len,
            );
        });
    }

    /// Copy into modeled physical memory, crossing page boundaries.
    pub fn write(&self, addr: PAddr, data: &[u8]) {
        self.for_each_chunk(addr, data.len(), |offset, pfn, page_off, len| unsafe {
            // SAFETY: The caller owns the range, so no one else accesses it.
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(offset),
                self.page_ptr(pfn).add(page_off),
                len,
            );
        });
    }

    pub fn fill(&self, addr: PAddr, len: usize, byte: u8) {
        self.for_each_chunk(addr, len, |_, pfn, page_off, len| unsafe {
            // SAFETY: The caller owns the range, so no one else accesses it.
            core::ptr::write_bytes(self.page_ptr(pfn).add(page_off), byte, len);
        });
    }

    pub fn check_pattern(&self, addr: PAddr, len: usize, byte: u8) -> bool {
        let mut clean = true;
        self.for_each_chunk(addr, len, |_, pfn, page_off, len| {
            let bytes =
                unsafe { core::slice::from_raw_parts(self.page_ptr(pfn).add(page_off), len) };
            clean &= bytes.iter().all(|&b| b == byte);
        });
        clean
    }

    fn for_each_chunk(&self, addr: PAddr, len: usize, mut func: impl FnMut(usize, PFN, usize, usize)) {
        let mut offset = 0;

        while offset < len {
            let current = addr + offset;
            let pfn = PFN::from_val(current.addr() >> PAGE_SIZE_BITS);
            let page_off = current.addr() & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - page_off).min(len - offset);

            assert!(self.contains(pfn), "physical access outside the frame table");
            func(offset, pfn, page_off, chunk);

            offset += chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_pfn_indexed() {
        let table = FrameTable::new(PFN::from_val(16), 8);

        assert!(table.contains(PFN::from_val(16)));
        assert!(table.contains(PFN::from_val(23)));
        assert!(!table.contains(PFN::from_val(24)));
        assert!(!table.contains(PFN::from_val(15)));

        table.frame(PFN::from_val(20)).set_order(3);
        assert_eq!(table.frame(PFN::from_val(20)).order(), 3);
        assert_eq!(table.frame(PFN::from_val(21)).order(), 0);
    }

    #[test]
    fn rw_crosses_page_boundaries() {
        let table = FrameTable::new(PFN::from_val(0), 4);

        let data = (0..PAGE_SIZE + 100)
            .map(|i| (i % 251) as u8)
            .collect::<Vec<_>>();

        let addr = PAddr::from(PAGE_SIZE / 2);
        table.write(addr, &data);

        let mut back = alloc::vec![0u8; data.len()];
        table.read(addr, &mut back);
        assert_eq!(back, data);
    }

    #[test]
    fn copy_and_zero() {
        let table = FrameTable::new(PFN::from_val(0), 2);

        table.fill(PAddr::from(0), PAGE_SIZE, 0xab);
        table.copy_page(PFN::from_val(0), PFN::from_val(1));
        assert!(table.check_pattern(PAddr::from(PAGE_SIZE), PAGE_SIZE, 0xab));

        table.zero_page(PFN::from_val(1));
        assert!(table.check_pattern(PAddr::from(PAGE_SIZE), PAGE_SIZE, 0));
    }
}
