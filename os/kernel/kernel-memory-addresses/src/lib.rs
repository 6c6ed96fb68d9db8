//! # Physical Memory Address Types
//!
//! Strongly typed wrappers for physical addresses, page bases, frame numbers
//! and inclusive ranges used by the kexec loader and the crash governor.
//!
//! ## Overview
//!
//! | Type | Generic | Description |
//! |----------|----------|-------------|
//! | [`PhysicalAddress`] | – | A raw 64-bit physical address. |
//! | [`PhysicalPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base of a page of size `S`. |
//! | [`PageFrameNumber`] | – | A 4 KiB frame index, as used by hibernation and page protection. |
//! | [`PhysicalRange`] | – | A non-empty interval with an inclusive end. |
//!
//! ## Page Sizes
//!
//! The granules the arm64 boot protocol cares about are provided as marker
//! types that implement [`PageSize`]:
//!
//! - [`Size4K`] for the base page
//! - [`Size64K`] for the largest translation granule
//! - [`Size2M`] for kernel image and device tree alignment
//! - [`Size1G`] for the ramdisk window
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
//! let page = pa.page::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0x0000_0010_2000_0000);
//! assert_eq!(pa.offset::<Size4K>(), 0x42);
//!
//! let range = PhysicalRange::from_start_len(page.base(), Size2M::SIZE).unwrap();
//! assert!(range.contains(pa));
//! ```
//!
//! All types are `#[repr(transparent)]` (where they wrap a single word), `Copy`,
//! and their arithmetic is `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_frame;
mod page_size;
mod physical_address;
mod physical_page;
mod physical_range;

pub use page_frame::PageFrameNumber;
pub use page_size::{PageSize, Size1G, Size2M, Size4K, Size64K};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use physical_range::PhysicalRange;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        let pa = PhysicalAddress::new(0x4020_1234);
        assert_eq!(pa.align_down::<Size2M>().as_u64(), 0x4020_0000);
        assert_eq!(
            pa.align_up::<Size2M>().map(PhysicalAddress::as_u64),
            Some(0x4040_0000)
        );
        assert!(!pa.is_aligned::<Size4K>());
        assert!(PhysicalAddress::new(0x4020_0000).is_aligned::<Size2M>());
        assert_eq!(PhysicalAddress::MAX.align_up::<Size4K>(), None);
    }

    #[test]
    fn page_and_frame_agree() {
        let pa = PhysicalAddress::new(0x8_0000_3FFF);
        let page = pa.page::<Size4K>();
        assert_eq!(page.base().as_u64(), 0x8_0000_3000);
        assert_eq!(page.last().as_u64(), 0x8_0000_3FFF);
        assert_eq!(page.pfn(), pa.pfn());
        assert_eq!(pa.pfn().base(), page.base());
        assert_eq!(pa.pfn().page(), page);
    }

    #[test]
    fn page_next_stops_at_top() {
        let top = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::MAX);
        assert_eq!(top.next(), None);
        let low = PhysicalPage::<Size64K>::from_addr(PhysicalAddress::zero());
        assert_eq!(low.next().map(|p| p.base().as_u64()), Some(0x1_0000));
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let r = PhysicalRange::new(PhysicalAddress::new(0x1000), PhysicalAddress::new(0x1FFF))
            .unwrap();
        assert_eq!(r.len(), 0x1000);
        assert!(r.contains(PhysicalAddress::new(0x1000)));
        assert!(r.contains(PhysicalAddress::new(0x1FFF)));
        assert!(!r.contains(PhysicalAddress::new(0x2000)));
        assert!(PhysicalRange::new(PhysicalAddress::new(2), PhysicalAddress::new(1)).is_none());
        assert!(PhysicalRange::from_start_len(PhysicalAddress::new(1), 0).is_none());
        assert!(PhysicalRange::from_start_len(PhysicalAddress::MAX, 2).is_none());
    }

    #[test]
    fn range_from_exclusive() {
        let r = PhysicalRange::from_exclusive(0x4000_0000, 0x8000_0000).unwrap();
        assert_eq!(r.end().as_u64(), 0x7FFF_FFFF);
        assert!(PhysicalRange::from_exclusive(5, 5).is_none());
    }

    #[test]
    fn range_relations() {
        let outer = PhysicalRange::from_exclusive(0x1000, 0x9000).unwrap();
        let inner = PhysicalRange::from_exclusive(0x2000, 0x3000).unwrap();
        let tail = PhysicalRange::from_exclusive(0x8FFF, 0xA000).unwrap();
        let apart = PhysicalRange::from_exclusive(0x9000, 0xA000).unwrap();
        assert!(outer.encloses(inner));
        assert!(!inner.encloses(outer));
        assert!(outer.overlaps(tail));
        assert!(!outer.encloses(tail));
        assert!(!outer.overlaps(apart));
        assert!(outer.contains_pfn(PageFrameNumber::new(0x8)));
        assert!(!outer.contains_pfn(PageFrameNumber::new(0x9)));
    }

    #[test]
    fn formatting() {
        let pa = PhysicalAddress::new(0xABCD);
        assert_eq!(format!("{pa}"), "0x000000000000ABCD");
        assert_eq!(format!("{pa:?}"), "PA(0x000000000000ABCD)");
        assert_eq!(format!("{pa:x}"), "abcd");
        let r = PhysicalRange::from_exclusive(0x1000, 0x2000).unwrap();
        assert_eq!(format!("{r}"), "[0000000000001000-0000000000001fff]");
        let p = PhysicalPage::<Size2M>::from_addr(PhysicalAddress::new(0x20_0001));
        assert_eq!(format!("{p}"), "0x0000000000200000/2M");
    }
}
