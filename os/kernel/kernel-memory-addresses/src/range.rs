use crate::{PAGE_SIZE, VirtualAddress, VirtualPage};
use core::fmt;

/// Half-open range `[start, end)` of virtual memory.
///
/// `start <= end` always holds; an empty range has `start == end`.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct VirtualRange {
    start: VirtualAddress,
    end: VirtualAddress,
}

impl VirtualRange {
    /// Creates `[start, end)`. Returns `None` if `end < start`.
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Option<Self> {
        if end.as_u64() < start.as_u64() {
            None
        } else {
            Some(Self { start, end })
        }
    }

    /// Creates `[start, start + len)`. Returns `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn with_len(start: VirtualAddress, len: u64) -> Option<Self> {
        match start.checked_add(len) {
            Some(end) => Some(Self { start, end }),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        self.start.as_u64() <= va.as_u64() && va.as_u64() < self.end.as_u64()
    }

    /// True if the two ranges share at least one byte.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start.as_u64() < other.end.as_u64() && other.start.as_u64() < self.end.as_u64()
    }

    /// Intersection of two ranges, if non-empty.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(&self) -> bool {
        self.start.is_page_aligned() && self.end.is_page_aligned()
    }

    /// Iterates the pages whose base lies within the range.
    pub fn pages(&self) -> impl Iterator<Item = VirtualPage> + use<> {
        let first = self.start.page().base().as_u64();
        let end = self.end.as_u64();
        (first..end)
            .step_by(usize::try_from(PAGE_SIZE).unwrap_or(4096))
            .map(|va| VirtualPage::containing(VirtualAddress::new(va)))
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#010x}, {:#010x})", self.start.as_u64(), self.end.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(a: u64, b: u64) -> VirtualRange {
        VirtualRange::new(VirtualAddress::new(a), VirtualAddress::new(b)).unwrap()
    }

    #[test]
    fn touching_ranges_do_not_overlap() {
        assert!(!r(0x1000, 0x2000).overlaps(&r(0x2000, 0x3000)));
        assert!(r(0x1000, 0x2001).overlaps(&r(0x2000, 0x3000)));
    }

    #[test]
    fn pages_covers_partial_last_page() {
        let pages: Vec<_> = r(0x1000, 0x2001).pages().collect();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].base().as_u64(), 0x2000);
    }

    #[test]
    fn reversed_range_is_rejected() {
        assert!(VirtualRange::new(VirtualAddress::new(2), VirtualAddress::new(1)).is_none());
    }
}
