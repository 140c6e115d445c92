use super::addr::Addr;
use core::{cmp::Ordering, fmt, ops::RangeBounds};

/// A half-open range of addresses, inclusive on the start and exclusive on
/// the end.
///
/// # Comparison
/// Two ranges where one **contains** the other compare as equal; otherwise
/// the one with the smaller start is less. This makes a `BTreeSet` keyed by
/// ranges answer "which range contains this address" with a plain `get` on a
/// zero-length probe range. Use `overlap_with` for a genuine overlap check,
/// never `==`.
pub struct AddrRange<A: Addr> {
    start: A,
    end: A,
}

impl<A: Addr> Clone for AddrRange<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: Addr> Copy for AddrRange<A> {}

impl<A: Addr> Eq for AddrRange<A> {}

impl<A: Addr> PartialEq for AddrRange<A> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<A: Addr> PartialOrd for AddrRange<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A: Addr> Ord for AddrRange<A> {
    fn cmp(&self, other: &Self) -> Ordering {
        // A zero-length probe sitting exactly on a boundary belongs to the
        // range starting there, not the one ending there.
        if self.start == other.start {
            return Ordering::Equal;
        }

        if self.end == other.end {
            if self.start == self.end {
                return Ordering::Greater;
            }
            if other.start == other.end {
                return Ordering::Less;
            }
            return Ordering::Equal;
        }

        if self.start < other.start {
            if other.end < self.end {
                Ordering::Equal
            } else {
                Ordering::Less
            }
        } else {
            if self.end < other.end {
                Ordering::Equal
            } else {
                Ordering::Greater
            }
        }
    }
}

impl<A: Addr> From<A> for AddrRange<A> {
    fn from(addr: A) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }
}

impl<A: Addr> AddrRange<A> {
    /// # Panics
    /// Panics if the start address is greater than the end address.
    pub fn new(start: A, end: A) -> Self {
        assert!(start <= end);
        Self { start, end }
    }

    pub const fn start(&self) -> A {
        self.start
    }

    pub const fn end(&self) -> A {
        self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn shrink(&self, size: usize) -> Self {
        assert!(size <= self.len());
        Self::new(self.start, self.end - size)
    }

    pub fn grow(&self, count: usize) -> Self {
        Self::new(self.start, self.end + count)
    }

    pub fn contains(&self, addr: A) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn into_bounds(&self) -> impl RangeBounds<Self> {
        if self.len() == 0 {
            Self::from(self.start())..=Self::from(self.start())
        } else {
            Self::from(self.start())..=Self::from(self.end() - 1)
        }
    }

    pub fn overlap_with(&self, other: &Self) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn split_at_checked(&self, at: A) -> (Option<Self>, Option<Self>) {
        if self.end <= at {
            (Some(*self), None)
        } else if at <= self.start {
            (None, Some(*self))
        } else {
            (
                Some(Self::new(self.start, at)),
                Some(Self::new(at, self.end)),
            )
        }
    }

    pub fn split_at(&self, at: A) -> (Self, Self) {
        let (left, right) = self.split_at_checked(at);
        (
            left.expect("`at` is too large"),
            right.expect("`at` is too small"),
        )
    }

    /// Cuts `mask` out of `self`, yielding the untouched left part, the
    /// masked middle, and the untouched right part.
    pub fn mask_with_checked(&self, mask: &Self) -> Option<(Option<Self>, Self, Option<Self>)> {
        if mask.len() == 0 || !self.overlap_with(mask) {
            return None;
        }

        let left;
        let mut mid;
        let right;

        if self.start < mask.start && mask.start < self.end {
            let (l, r) = self.split_at(mask.start);
            left = Some(l);
            mid = r;
        } else {
            left = None;
            mid = *self;
        }

        if mask.end < self.end {
            let (l, r) = mid.split_at(mask.end);
            mid = l;
            right = Some(r);
        } else {
            right = None;
        }

        Some((left, mid, right))
    }
}

impl<A: Addr + fmt::Debug> fmt::Debug for AddrRange<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use crate::address::{VAddr, VRange};

    fn range(start: usize, end: usize) -> VRange {
        VRange::new(VAddr::from(start), VAddr::from(end))
    }

    #[test]
    fn containment_compares_equal() {
        let outer = range(0x1000, 0x5000);

        assert_eq!(outer, range(0x2000, 0x3000));
        assert_eq!(outer, VRange::from(VAddr::from(0x1000)));
        assert!(range(0x0, 0x1000) < outer);
        assert!(range(0x5000, 0x6000) > outer);
    }

    #[test]
    fn boundary_probe_belongs_to_the_next_range() {
        let probe = VRange::from(VAddr::from(0x2000));

        assert!(range(0x1000, 0x2000) < probe);
        assert_eq!(range(0x2000, 0x3000), probe);
    }

    #[test]
    fn mask_splits_into_three() {
        let (left, mid, right) = range(0x1000, 0x5000)
            .mask_with_checked(&range(0x2000, 0x3000))
            .unwrap();

        assert_eq!(left.unwrap(), range(0x1000, 0x2000));
        assert_eq!(mid, range(0x2000, 0x3000));
        assert_eq!(right.unwrap(), range(0x3000, 0x5000));
    }

    #[test]
    fn mask_with_disjoint_range_is_none() {
        assert!(range(0x1000, 0x2000)
            .mask_with_checked(&range(0x3000, 0x4000))
            .is_none());
    }
}
