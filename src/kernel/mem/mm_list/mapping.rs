use alloc::sync::Arc;

use zenith_mm::address::VRange;

use crate::prelude::*;

/// The file seam of the VMM. The VFS behind it is an external collaborator;
/// the core only reads page-sized extents and pins the mapping count.
pub trait MappedFile: Send + Sync {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> KResult<usize>;

    fn len(&self) -> usize;

    /// A VMA started referencing this file; keeps the backing storage from
    /// being unmapped underneath it.
    fn mmap_get(&self) {}

    fn mmap_put(&self) {}
}

#[derive(Clone)]
pub struct FileMapping {
    pub file: Arc<dyn MappedFile>,
    pub offset: usize,
    pub length: usize,
}

impl FileMapping {
    /// The mapping shifted forward by `diff` bytes, for VMA splits.
    pub fn offset(&self, diff: usize) -> Self {
        assert!(diff <= self.length);
        Self {
            file: self.file.clone(),
            offset: self.offset + diff,
            length: self.length - diff,
        }
    }
}

#[derive(Clone)]
pub enum Mapping {
    Anonymous,
    File(FileMapping),
}

impl Mapping {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Mapping::Anonymous)
    }

    /// Whether `next` continues this mapping if its VMA starts `gap` bytes
    /// after ours.
    pub fn continues_into(&self, next: &Mapping, gap: usize) -> bool {
        match (self, next) {
            (Mapping::Anonymous, Mapping::Anonymous) => true,
            (Mapping::File(ours), Mapping::File(theirs)) => {
                Arc::ptr_eq(&ours.file, &theirs.file)
                    && ours.offset + gap == theirs.offset
            }
            _ => false,
        }
    }
}

/// What a custom fault handler sees.
pub struct FaultRequest<'a> {
    pub mapping: &'a Mapping,
    /// Page-aligned byte offset of the faulting page within the VMA.
    pub offset: usize,
    pub write: bool,
}

pub type VmFault = fn(&FaultRequest, &mut [u8]) -> KResult<()>;
pub type VmAreaHook = fn(VRange);
pub type VmMkwrite = fn(VRange, usize) -> KResult<()>;

/// Per-VMA capability set. An absent operation means "not supported" and
/// the core takes its default path (or refuses) instead of dispatching.
#[derive(Default, Clone, Copy)]
pub struct VmOperations {
    /// Fill the freshly allocated page's contents. Replaces the default
    /// file read for special mappings.
    pub fault: Option<VmFault>,
    pub open: Option<VmAreaHook>,
    pub close: Option<VmAreaHook>,
    /// Consulted before a shared page is made writable.
    pub page_mkwrite: Option<VmMkwrite>,
}
