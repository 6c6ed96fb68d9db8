use crate::{PageFrameNumber, PhysicalAddress};
use core::fmt;

/// A non-empty physical interval `[start, end]` with an **inclusive** end.
///
/// Inclusive ends let a range reach the very top of the address space and
/// match the way reserved resources and crash memory ranges are recorded.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let r = PhysicalRange::from_start_len(PhysicalAddress::new(0x1000), 0x2000).unwrap();
/// assert_eq!(r.end().as_u64(), 0x2FFF);
/// assert_eq!(r.len(), 0x2000);
/// assert!(r.contains(PhysicalAddress::new(0x2FFF)));
/// assert!(!r.contains(PhysicalAddress::new(0x3000)));
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalRange {
    start: PhysicalAddress,
    end: PhysicalAddress,
}

impl PhysicalRange {
    /// Build from inclusive bounds; `None` if `end < start`.
    #[inline]
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Option<Self> {
        if end.as_u64() < start.as_u64() {
            None
        } else {
            Some(Self { start, end })
        }
    }

    /// Build from a start address and a byte length; `None` for empty or overflowing ranges.
    #[inline]
    #[must_use]
    pub const fn from_start_len(start: PhysicalAddress, len: u64) -> Option<Self> {
        if len == 0 {
            return None;
        }
        match start.checked_add(len - 1) {
            Some(end) => Some(Self { start, end }),
            None => None,
        }
    }

    /// Build from a half-open `[start, end)` pair as produced by memory-range enumeration.
    #[inline]
    #[must_use]
    pub const fn from_exclusive(start: u64, end: u64) -> Option<Self> {
        if end <= start {
            None
        } else {
            Some(Self {
                start: PhysicalAddress::new(start),
                end: PhysicalAddress::new(end - 1),
            })
        }
    }

    #[inline]
    #[must_use]
    pub const fn start(self) -> PhysicalAddress {
        self.start
    }

    /// Inclusive end address.
    #[inline]
    #[must_use]
    pub const fn end(self) -> PhysicalAddress {
        self.end
    }

    /// Size in bytes. A range covering the whole 64-bit space saturates at `u64::MAX`.
    #[inline]
    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub const fn len(self) -> u64 {
        (self.end.as_u64() - self.start.as_u64()).saturating_add(1)
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, addr: PhysicalAddress) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() <= self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn contains_pfn(self, pfn: PageFrameNumber) -> bool {
        self.contains(pfn.base())
    }

    /// `true` if `other` lies entirely within `self`.
    #[inline]
    #[must_use]
    pub const fn encloses(self, other: Self) -> bool {
        other.start.as_u64() >= self.start.as_u64() && other.end.as_u64() <= self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.start.as_u64() <= other.end.as_u64() && other.start.as_u64() <= self.end.as_u64()
    }
}

impl fmt::Debug for PhysicalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysicalRange({:#018x}..={:#018x})",
            self.start.as_u64(),
            self.end.as_u64()
        )
    }
}

impl fmt::Display for PhysicalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:016x}-{:016x}]",
            self.start.as_u64(),
            self.end.as_u64()
        )
    }
}
