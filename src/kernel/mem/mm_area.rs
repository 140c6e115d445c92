use core::borrow::Borrow;
use core::cell::UnsafeCell;
use core::cmp;

use alloc::sync::Arc;

use zenith_mm::address::{AddrOps as _, VAddr, VRange};

use super::mm_list::{Mapping, VmOperations, VmaInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permission {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permission {
    pub const fn rw() -> Self {
        Self {
            read: true,
            write: true,
            execute: false,
        }
    }

    pub const fn ro() -> Self {
        Self {
            read: true,
            write: false,
            execute: false,
        }
    }

    pub const fn rx() -> Self {
        Self {
            read: true,
            write: false,
            execute: true,
        }
    }
}

/// One virtual memory area. Sits in the mm's `BTreeSet` keyed by its range;
/// the range cell is only ever rewritten under the mm lock (splits and
/// in-place growth), which is why lookups stay coherent.
pub struct MmArea {
    range: UnsafeCell<VRange>,
    pub(crate) mapping: Mapping,
    pub(crate) permission: Permission,
    pub is_shared: bool,
    pub(crate) ops: Option<Arc<VmOperations>>,
}

// SAFETY: The range cell is only accessed with the owning mm's lock held.
unsafe impl Send for MmArea {}
unsafe impl Sync for MmArea {}

impl Clone for MmArea {
    fn clone(&self) -> Self {
        Self {
            range: UnsafeCell::new(self.range()),
            mapping: self.mapping.clone(),
            permission: self.permission,
            is_shared: self.is_shared,
            ops: self.ops.clone(),
        }
    }
}

impl MmArea {
    pub fn new(
        range: VRange,
        mapping: Mapping,
        permission: Permission,
        is_shared: bool,
        ops: Option<Arc<VmOperations>>,
    ) -> Self {
        Self {
            range: range.into(),
            mapping,
            permission,
            is_shared,
            ops,
        }
    }

    fn range_borrow(&self) -> &VRange {
        // SAFETY: The only way to reach an `MmArea` is through the owning
        //         mm's locked section.
        unsafe { self.range.get().as_ref().unwrap() }
    }

    pub fn range(&self) -> VRange {
        *self.range_borrow()
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    /// # Safety
    /// The caller must guarantee that the grown range does not overlap any
    /// other area in the set.
    pub unsafe fn grow(&self, count: usize) {
        let range = unsafe { self.range.get().as_mut().unwrap() };
        *range = range.grow(count);
    }

    pub fn split(mut self, at: VAddr) -> (Option<Self>, Option<Self>) {
        assert!(at.is_page_aligned());

        match self.range_borrow().cmp(&VRange::from(at)) {
            cmp::Ordering::Less => (Some(self), None),
            cmp::Ordering::Greater => (None, Some(self)),
            cmp::Ordering::Equal => {
                let diff = at - self.range_borrow().start();
                if diff == 0 {
                    return (None, Some(self));
                }

                let right = Self {
                    range: VRange::new(at, self.range_borrow().end()).into(),
                    permission: self.permission,
                    mapping: match &self.mapping {
                        Mapping::Anonymous => Mapping::Anonymous,
                        Mapping::File(mapping) => Mapping::File(mapping.offset(diff)),
                    },
                    is_shared: self.is_shared,
                    ops: self.ops.clone(),
                };

                let new_range = self.range_borrow().shrink(self.range_borrow().end() - at);
                *self.range.get_mut() = new_range;

                (Some(self), Some(right))
            }
        }
    }

    /// Whether `next`, starting exactly at our end, can be folded into us.
    pub fn can_merge_with(&self, next: &MmArea) -> bool {
        self.range().end() == next.range().start()
            && self.permission == next.permission
            && self.is_shared == next.is_shared
            && self.ops.is_none()
            && next.ops.is_none()
            && self
                .mapping
                .continues_into(&next.mapping, self.range().len())
    }

    pub(crate) fn info(&self) -> VmaInfo {
        VmaInfo {
            range: self.range(),
            permission: self.permission,
            is_shared: self.is_shared,
            anonymous: self.mapping.is_anonymous(),
            mapping: self.mapping.clone(),
            ops: self.ops.clone(),
        }
    }
}

impl Eq for MmArea {}
impl PartialEq for MmArea {
    fn eq(&self, other: &Self) -> bool {
        self.range_borrow().eq(other.range_borrow())
    }
}
impl PartialOrd for MmArea {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        self.range_borrow().partial_cmp(other.range_borrow())
    }
}
impl Ord for MmArea {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.range_borrow().cmp(other.range_borrow())
    }
}

impl Borrow<VRange> for MmArea {
    fn borrow(&self) -> &VRange {
        self.range_borrow()
    }
}
