use bitflags::bitflags;

use crate::paging::PFN;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAttribute: u32 {
        const PRESENT = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// Shared frame to be copied on the first write fault.
        const COPY_ON_WRITE = 1 << 7;
    }
}

/// One leaf translation: a frame plus its protection.
#[derive(Debug, Clone, Copy)]
pub struct PTE {
    pfn: PFN,
    attr: PageAttribute,
}

impl PTE {
    pub const fn new(pfn: PFN, attr: PageAttribute) -> Self {
        Self { pfn, attr }
    }

    pub fn pfn(&self) -> PFN {
        self.pfn
    }

    pub fn attr(&self) -> PageAttribute {
        self.attr
    }

    pub fn set(&mut self, pfn: PFN, attr: PageAttribute) {
        self.pfn = pfn;
        self.attr = attr;
    }

    pub fn set_attr(&mut self, attr: PageAttribute) {
        self.attr = attr;
    }

    /// Clear the entry, returning what it held.
    pub fn take(&mut self) -> (PFN, PageAttribute) {
        let held = (self.pfn, self.attr);
        self.attr = PageAttribute::empty();
        held
    }

    pub fn is_present(&self) -> bool {
        self.attr.contains(PageAttribute::PRESENT)
    }
}
