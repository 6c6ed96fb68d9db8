//! # Crash Image Governor
//!
//! Owns the reserved crash kernel region for the lifetime of the running
//! kernel: it describes the memory outside the region to the crash kernel,
//! knows which pages a loaded crash image occupies, and hides those pages
//! from the linear map while nothing should touch them.

use crate::elf_core::{CoreSources, build_core_header};
use crate::platform::{CacheMaintenance, MemoryProtection};
use crate::{KexecError, RangeError};
use alloc::vec::Vec;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};
use log::{debug, info};

#[cfg(feature = "hibernation")]
use crate::platform::PageAllocator;
#[cfg(feature = "hibernation")]
use kernel_memory_addresses::PageFrameNumber;

/// Ordered, bounded list of memory ranges the crash kernel may dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashMemoryRanges {
    ranges: Vec<PhysicalRange>,
    capacity: usize,
}

impl CrashMemoryRanges {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ranges: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Collect the live RAM ranges, leaving room for one split.
    pub fn from_live(live: impl IntoIterator<Item = PhysicalRange>) -> Self {
        let mut ranges: Vec<_> = live.into_iter().collect();
        ranges.sort_unstable();
        let capacity = ranges.len() + 1;
        Self { ranges, capacity }
    }

    /// Append a range.
    ///
    /// # Errors
    /// [`RangeError::CapacityExceeded`] if the table is full.
    pub fn push(&mut self, range: PhysicalRange) -> Result<(), RangeError> {
        if self.ranges.len() >= self.capacity {
            return Err(RangeError::CapacityExceeded(self.capacity));
        }
        self.ranges.push(range);
        Ok(())
    }

    /// Remove `hole` from every range it touches.
    ///
    /// A range is dropped when covered, truncated when overlapped at one
    /// end, and split in two when `hole` lies strictly inside it.
    ///
    /// # Errors
    /// [`RangeError::CapacityExceeded`] if a split does not fit. The table
    /// is left as it was before the failing split.
    pub fn exclude(&mut self, hole: PhysicalRange) -> Result<(), RangeError> {
        let mut i = 0;
        while i < self.ranges.len() {
            let r = self.ranges[i];
            if !r.overlaps(hole) {
                i += 1;
                continue;
            }

            let below = if r.start() < hole.start() {
                PhysicalRange::new(r.start(), PhysicalAddress::new(hole.start().as_u64() - 1))
            } else {
                None
            };
            let above = if hole.end() < r.end() {
                PhysicalRange::new(PhysicalAddress::new(hole.end().as_u64() + 1), r.end())
            } else {
                None
            };

            match (below, above) {
                (None, None) => {
                    self.ranges.remove(i);
                }
                (Some(part), None) | (None, Some(part)) => {
                    self.ranges[i] = part;
                    i += 1;
                }
                (Some(low), Some(high)) => {
                    if self.ranges.len() >= self.capacity {
                        return Err(RangeError::CapacityExceeded(self.capacity));
                    }
                    self.ranges[i] = low;
                    self.ranges.insert(i + 1, high);
                    i += 2;
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = PhysicalRange> + '_ {
        self.ranges.iter().copied()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[PhysicalRange] {
        &self.ranges
    }
}

/// How a page relates to the crash region.
#[cfg(feature = "hibernation")]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageClass {
    /// Ordinary memory.
    OutsideRegion,
    /// Inside the region and backing a loaded crash image segment.
    HoldsImageData,
    /// Inside the region but not used by any segment.
    ReservedButFree,
}

/// State of the reserved crash region and the crash image loaded into it.
#[derive(Debug, Default)]
pub struct CrashGovernor {
    region: Option<PhysicalRange>,
    image: Option<Vec<PhysicalRange>>,
    protected: bool,
}

impl CrashGovernor {
    /// Take ownership of the region reserved at boot, if any.
    #[must_use]
    pub const fn new(region: Option<PhysicalRange>) -> Self {
        Self {
            region,
            image: None,
            protected: false,
        }
    }

    #[must_use]
    pub const fn region(&self) -> Option<PhysicalRange> {
        self.region
    }

    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.image.is_some()
    }

    #[must_use]
    pub const fn is_protected(&self) -> bool {
        self.protected
    }

    /// Segments of the loaded crash image.
    #[must_use]
    pub fn segments(&self) -> &[PhysicalRange] {
        self.image.as_deref().unwrap_or(&[])
    }

    /// Build the ELF core header describing `live` RAM minus the region.
    ///
    /// # Errors
    /// [`KexecError::NoCrashRegion`] without a region and
    /// [`KexecError::Ranges`] if excluding the region overflows the table,
    /// [`KexecError::Overflow`] with more program headers than ELF allows.
    pub fn build_dump_header(
        &self,
        live: impl IntoIterator<Item = PhysicalRange>,
        sources: &CoreSources,
    ) -> Result<Vec<u8>, KexecError> {
        let region = self.region.ok_or(KexecError::NoCrashRegion)?;
        let mut ranges = CrashMemoryRanges::from_live(live);
        ranges.exclude(region)?;

        for range in ranges.iter() {
            debug!("Crash PT_LOAD ELF header. {range}");
        }
        build_core_header(sources, ranges.as_slice())
    }

    /// Record a freshly loaded crash image.
    ///
    /// # Errors
    /// [`KexecError::NoCrashRegion`] without a region and
    /// [`KexecError::SegmentOutsideCrashRegion`] for any segment not
    /// entirely inside it.
    pub fn install(
        &mut self,
        segments: impl IntoIterator<Item = PhysicalRange>,
    ) -> Result<(), KexecError> {
        let region = self.region.ok_or(KexecError::NoCrashRegion)?;
        let segments: Vec<_> = segments.into_iter().collect();
        if let Some(outside) = segments.iter().find(|s| !region.encloses(**s)) {
            return Err(KexecError::SegmentOutsideCrashRegion(*outside));
        }
        self.image = Some(segments);
        self.protected = false;
        Ok(())
    }

    /// Forget the loaded crash image, making its pages accessible again.
    pub fn unload(&mut self, prot: &mut impl MemoryProtection) {
        if self.protected {
            self.unprotect(prot);
        }
        self.image = None;
    }

    /// Write back the image segments and remove them from the linear map.
    pub fn protect(&mut self, cache: &mut impl CacheMaintenance, prot: &mut impl MemoryProtection) {
        let Some(segments) = &self.image else {
            return;
        };
        for s in segments {
            cache.clean_dcache_to_poc(s.start(), s.len());
            prot.set_memory_valid(s.start(), s.len().div_ceil(PAGE_SIZE), false);
        }
        self.protected = true;
    }

    pub fn unprotect(&mut self, prot: &mut impl MemoryProtection) {
        let Some(segments) = &self.image else {
            return;
        };
        for s in segments {
            prot.set_memory_valid(s.start(), s.len().div_ceil(PAGE_SIZE), true);
        }
        self.protected = false;
    }

    /// Give up the region.
    ///
    /// # Errors
    /// [`KexecError::CrashImageLoaded`] while an image still occupies it and
    /// [`KexecError::NoCrashRegion`] if there is none.
    pub fn release(&mut self) -> Result<PhysicalRange, KexecError> {
        if self.is_loaded() {
            return Err(KexecError::CrashImageLoaded);
        }
        let region = self.region.take().ok_or(KexecError::NoCrashRegion)?;
        info!("crash kernel region {region} released");
        Ok(region)
    }
}

#[cfg(feature = "hibernation")]
impl CrashGovernor {
    /// The hibernation image must be able to read the crash image pages.
    pub fn prepare_suspend(&mut self, prot: &mut impl MemoryProtection) {
        if self.is_loaded() {
            self.unprotect(prot);
        }
    }

    pub fn post_resume(
        &mut self,
        cache: &mut impl CacheMaintenance,
        prot: &mut impl MemoryProtection,
    ) {
        if self.is_loaded() {
            self.protect(cache, prot);
        }
    }

    #[must_use]
    pub fn classify_page(&self, pfn: PageFrameNumber) -> PageClass {
        let Some(region) = self.region else {
            return PageClass::OutsideRegion;
        };
        if !region.contains_pfn(pfn) {
            return PageClass::OutsideRegion;
        }
        if self.segments().iter().any(|s| s.contains_pfn(pfn)) {
            PageClass::HoldsImageData
        } else {
            PageClass::ReservedButFree
        }
    }

    /// Pages the hibernation image may skip: reserved but not holding image data.
    #[must_use]
    pub fn is_nosave(&self, pfn: PageFrameNumber) -> bool {
        self.classify_page(pfn) == PageClass::ReservedButFree
    }

    /// Return the tail `[begin, end)` of the region to the page allocator and
    /// shrink the region accordingly. Returns the number of pages freed.
    ///
    /// # Errors
    /// [`KexecError::NoCrashRegion`] without a region,
    /// [`KexecError::InvalidRange`] unless `[begin, end)` is a page aligned
    /// tail of the region, and [`KexecError::CrashImageLoaded`] if a loaded
    /// segment lies in it.
    pub fn free_reserved_range(
        &mut self,
        begin: PhysicalAddress,
        end: PhysicalAddress,
        pages: &mut impl PageAllocator,
    ) -> Result<u64, KexecError> {
        let region = self.region.ok_or(KexecError::NoCrashRegion)?;
        let range = PhysicalRange::from_exclusive(begin.as_u64(), end.as_u64())
            .ok_or(KexecError::Overflow)?;
        if !region.encloses(range)
            || range.end() != region.end()
            || !begin.as_u64().is_multiple_of(PAGE_SIZE)
            || !range.len().is_multiple_of(PAGE_SIZE)
        {
            return Err(KexecError::InvalidRange(range));
        }
        if self.segments().iter().any(|s| s.overlaps(range)) {
            return Err(KexecError::CrashImageLoaded);
        }

        let mut freed = 0;
        let mut addr = begin;
        while addr < end {
            pages.free_page(addr.page());
            freed += 1;
            addr += PAGE_SIZE;
        }

        self.region = begin
            .checked_sub(1)
            .and_then(|last| PhysicalRange::new(region.start(), last))
            .filter(|_| begin > region.start());
        info!("freed {freed} pages of the crash kernel region");
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn r(start: u64, end_exclusive: u64) -> PhysicalRange {
        PhysicalRange::from_exclusive(start, end_exclusive).unwrap()
    }

    #[test]
    fn exclude_splits_inner_hole() {
        let mut ranges = CrashMemoryRanges::from_live([r(0, 1000), r(2000, 3000)]);
        assert_eq!(ranges.capacity(), 3);
        ranges.exclude(r(500, 700)).unwrap();
        assert_eq!(ranges.as_slice(), &[r(0, 500), r(700, 1000), r(2000, 3000)]);
    }

    #[test]
    fn exclude_truncates_and_removes() {
        let mut ranges = CrashMemoryRanges::from_live([r(0, 1000), r(2000, 3000), r(4000, 5000)]);
        ranges.exclude(r(800, 2500)).unwrap();
        assert_eq!(ranges.as_slice(), &[r(0, 800), r(2500, 3000), r(4000, 5000)]);
        ranges.exclude(r(3500, 6000)).unwrap();
        assert_eq!(ranges.as_slice(), &[r(0, 800), r(2500, 3000)]);
        ranges.exclude(r(0, 800)).unwrap();
        assert_eq!(ranges.as_slice(), &[r(2500, 3000)]);
    }

    #[test]
    fn split_beyond_capacity_fails_unchanged() {
        let mut ranges = CrashMemoryRanges::with_capacity(1);
        ranges.push(r(0, 1000)).unwrap();
        assert_eq!(ranges.push(r(2000, 3000)), Err(RangeError::CapacityExceeded(1)));
        assert_eq!(ranges.exclude(r(100, 200)), Err(RangeError::CapacityExceeded(1)));
        assert_eq!(ranges.as_slice(), &[r(0, 1000)]);
    }

    #[test]
    fn segments_must_stay_in_region() {
        let mut gov = CrashGovernor::new(Some(r(0x8000_0000, 0x9000_0000)));
        let outside = r(0x8ff0_0000, 0x9010_0000);
        assert!(matches!(
            gov.install([r(0x8000_0000, 0x8100_0000), outside]),
            Err(KexecError::SegmentOutsideCrashRegion(s)) if s == outside
        ));
        assert!(!gov.is_loaded());
        gov.install([r(0x8000_0000, 0x8100_0000)]).unwrap();
        assert!(gov.is_loaded());
        assert!(matches!(gov.release(), Err(KexecError::CrashImageLoaded)));
    }

    #[test]
    fn dump_header_needs_region() {
        let gov = CrashGovernor::new(None);
        assert!(matches!(
            gov.build_dump_header([r(0, 0x1000)], &CoreSources::default()),
            Err(KexecError::NoCrashRegion)
        ));
    }

    #[test]
    fn dump_header_excludes_region() {
        let gov = CrashGovernor::new(Some(r(0x4800_0000, 0x5000_0000)));
        let blob = gov
            .build_dump_header([r(0x4000_0000, 0x8000_0000)], &CoreSources::default())
            .unwrap();
        // two PT_LOADs around the region
        assert_eq!(u16::from_le_bytes([blob[56], blob[57]]), 2);
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<(u64, u64, bool)>,
        cleaned: Vec<(u64, u64)>,
    }

    impl MemoryProtection for Recorder {
        fn set_memory_valid(&mut self, start: PhysicalAddress, pages: u64, valid: bool) {
            self.calls.push((start.as_u64(), pages, valid));
        }
    }

    impl CacheMaintenance for Recorder {
        fn clean_dcache_to_poc(&mut self, addr: PhysicalAddress, len: u64) {
            self.cleaned.push((addr.as_u64(), len));
        }

        fn invalidate_icache(&mut self, _addr: PhysicalAddress, _len: u64) {}
    }

    #[test]
    fn protect_flushes_then_invalidates() {
        let mut gov = CrashGovernor::new(Some(r(0x8000_0000, 0x9000_0000)));
        let mut cache = Recorder::default();
        let mut prot = Recorder::default();

        gov.protect(&mut cache, &mut prot);
        assert!(prot.calls.is_empty());

        gov.install([r(0x8000_0000, 0x8000_3000)]).unwrap();
        gov.protect(&mut cache, &mut prot);
        assert!(gov.is_protected());
        assert_eq!(cache.cleaned, vec![(0x8000_0000, 0x3000)]);
        assert_eq!(prot.calls, vec![(0x8000_0000, 3, false)]);

        gov.unload(&mut prot);
        assert_eq!(prot.calls.last(), Some(&(0x8000_0000, 3, true)));
        assert!(!gov.is_loaded());
        assert!(gov.release().is_ok());
        assert!(gov.region().is_none());
    }

    #[cfg(feature = "hibernation")]
    mod hibernation {
        use super::*;
        use kernel_memory_addresses::{PhysicalPage, Size4K};

        #[derive(Default)]
        struct Freed(Vec<u64>);

        impl PageAllocator for Freed {
            fn alloc_page(&mut self) -> Option<PhysicalPage<Size4K>> {
                None
            }

            fn free_page(&mut self, page: PhysicalPage<Size4K>) {
                self.0.push(page.base().as_u64());
            }
        }

        fn pfn(addr: u64) -> PageFrameNumber {
            PhysicalAddress::new(addr).pfn()
        }

        #[test]
        fn classification() {
            let mut gov = CrashGovernor::new(Some(r(0x8000_0000, 0x8010_0000)));
            assert_eq!(gov.classify_page(pfn(0x7fff_f000)), PageClass::OutsideRegion);
            assert_eq!(gov.classify_page(pfn(0x8000_0000)), PageClass::ReservedButFree);
            assert!(gov.is_nosave(pfn(0x8000_0000)));

            gov.install([r(0x8000_0000, 0x8000_2000)]).unwrap();
            assert_eq!(gov.classify_page(pfn(0x8000_1000)), PageClass::HoldsImageData);
            assert!(!gov.is_nosave(pfn(0x8000_1000)));
            assert_eq!(gov.classify_page(pfn(0x8000_2000)), PageClass::ReservedButFree);

            let no_region = CrashGovernor::new(None);
            assert!(!no_region.is_nosave(pfn(0x8000_0000)));
        }

        #[test]
        fn suspend_hooks_only_act_with_an_image() {
            let mut gov = CrashGovernor::new(Some(r(0x8000_0000, 0x8010_0000)));
            let mut rec = Recorder::default();
            let mut cache = Recorder::default();
            gov.prepare_suspend(&mut rec);
            gov.post_resume(&mut cache, &mut rec);
            assert!(rec.calls.is_empty());

            gov.install([r(0x8000_0000, 0x8000_1000)]).unwrap();
            gov.prepare_suspend(&mut rec);
            gov.post_resume(&mut cache, &mut rec);
            assert_eq!(
                rec.calls,
                vec![(0x8000_0000, 1, true), (0x8000_0000, 1, false)]
            );
        }

        #[test]
        fn freeing_the_tail_shrinks_the_region() {
            let mut gov = CrashGovernor::new(Some(r(0x8000_0000, 0x8000_4000)));
            let mut freed = Freed::default();
            assert!(matches!(
                gov.free_reserved_range(
                    PhysicalAddress::new(0x8000_1000),
                    PhysicalAddress::new(0x8000_2000),
                    &mut freed
                ),
                Err(KexecError::InvalidRange(_))
            ));

            let n = gov
                .free_reserved_range(
                    PhysicalAddress::new(0x8000_2000),
                    PhysicalAddress::new(0x8000_4000),
                    &mut freed,
                )
                .unwrap();
            assert_eq!(n, 2);
            assert_eq!(freed.0, vec![0x8000_2000, 0x8000_3000]);
            assert_eq!(gov.region(), Some(r(0x8000_0000, 0x8000_2000)));

            gov.free_reserved_range(
                PhysicalAddress::new(0x8000_0000),
                PhysicalAddress::new(0x8000_2000),
                &mut freed,
            )
            .unwrap();
            assert_eq!(gov.region(), None);
        }
    }
}
