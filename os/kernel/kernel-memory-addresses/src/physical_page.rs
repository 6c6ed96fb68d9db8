use crate::{PageFrameNumber, PageSize, PhysicalAddress};
use core::fmt;
use core::marker::PhantomData;

/// Physical memory page base for size `S`.
///
/// A `PhysicalPage<S>` represents the **page-aligned base** of a physical page
/// of size `S` (`S::SIZE` bytes).
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pp = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x4000_1234));
/// assert_eq!(pp.base().as_u64(), 0x4000_1000);
/// assert_eq!(pp.next().map(|p| p.base().as_u64()), Some(0x4000_2000));
/// assert!(PhysicalPage::<Size4K>::try_from_addr(PhysicalAddress::new(0x4000_1234)).is_none());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// The page containing `p` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(p: PhysicalAddress) -> Self {
        Self {
            base: p.as_u64() & !(S::SIZE - 1),
            _size: PhantomData,
        }
    }

    /// The page starting exactly at `p`, or `None` if `p` is not aligned.
    #[inline]
    #[must_use]
    pub const fn try_from_addr(p: PhysicalAddress) -> Option<Self> {
        if p.is_aligned::<S>() {
            Some(Self::from_addr(p))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// Last byte address covered by this page.
    #[inline]
    #[must_use]
    pub const fn last(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base + (S::SIZE - 1))
    }

    /// The page directly following this one; `None` at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.base.checked_add(S::SIZE) {
            Some(base) => Some(Self {
                base,
                _size: PhantomData,
            }),
            None => None,
        }
    }

    /// Page frame number (4 KiB granule) of the page base.
    #[inline]
    #[must_use]
    pub const fn pfn(self) -> PageFrameNumber {
        self.base().pfn()
    }
}

impl<S> fmt::Display for PhysicalPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/{}", self.base, S::LABEL)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>({:#018X})", S::LABEL, self.base)
    }
}
