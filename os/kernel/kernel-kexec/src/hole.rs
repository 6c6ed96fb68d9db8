//! # Memory Hole Finder
//!
//! A [`BufferAllocator`] over a list of usable RAM ranges. Every block it
//! hands out is remembered, so consecutive segments of one image never
//! overlap.

use crate::OutOfMemory;
use crate::planner::{BufferAllocator, Direction, PlacementRequest};
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};
use log::trace;

#[derive(Debug, Clone, Default)]
pub struct MemoryHoleFinder {
    ram: Vec<PhysicalRange>,
    reserved: Vec<PhysicalRange>,
}

impl MemoryHoleFinder {
    /// Search the given usable RAM ranges.
    pub fn new(ram: impl IntoIterator<Item = PhysicalRange>) -> Self {
        let mut ram: Vec<_> = ram.into_iter().collect();
        ram.sort_unstable();
        Self {
            ram,
            reserved: Vec::new(),
        }
    }

    /// Search only the reserved crash kernel region.
    #[must_use]
    pub fn for_crash(region: PhysicalRange) -> Self {
        Self::new([region])
    }

    /// Mark `range` as taken, e.g. memory in use by the running kernel.
    pub fn exclude(&mut self, range: PhysicalRange) {
        self.reserved.push(range);
    }

    /// Blocks handed out or excluded so far.
    #[must_use]
    pub fn reserved(&self) -> &[PhysicalRange] {
        &self.reserved
    }

    fn collision(&self, candidate: PhysicalRange) -> Option<PhysicalRange> {
        self.reserved
            .iter()
            .copied()
            .find(|r| r.overlaps(candidate))
    }

    fn bottom_up(&self, window: PhysicalRange, req: &PlacementRequest) -> Option<PhysicalAddress> {
        let mut base = align_up(window.start().as_u64(), req.align())?;
        loop {
            let candidate = PhysicalRange::from_start_len(PhysicalAddress::new(base), req.size())?;
            if candidate.end() > window.end() {
                return None;
            }
            match self.collision(candidate) {
                None => return Some(candidate.start()),
                Some(taken) => {
                    base = align_up(taken.end().as_u64().checked_add(1)?, req.align())?;
                }
            }
        }
    }

    /// `req.size()` is non-zero by construction of [`PlacementRequest`].
    fn top_down(&self, window: PhysicalRange, req: &PlacementRequest) -> Option<PhysicalAddress> {
        let mut top = window.end().as_u64();
        loop {
            let base = align_down(top.checked_sub(req.size() - 1)?, req.align());
            if base < window.start().as_u64() {
                return None;
            }
            let candidate = PhysicalRange::from_start_len(PhysicalAddress::new(base), req.size())?;
            match self.collision(candidate) {
                None => return Some(candidate.start()),
                Some(taken) => top = taken.start().as_u64().checked_sub(1)?,
            }
        }
    }

    fn search(&self, req: &PlacementRequest) -> Option<PhysicalAddress> {
        let window_of = |ram: &PhysicalRange| {
            PhysicalRange::new(ram.start().max(req.min()), ram.end().min(req.max()))
        };
        match req.direction() {
            Direction::BottomUp => self
                .ram
                .iter()
                .filter_map(window_of)
                .find_map(|w| self.bottom_up(w, req)),
            Direction::TopDown => self
                .ram
                .iter()
                .rev()
                .filter_map(window_of)
                .find_map(|w| self.top_down(w, req)),
        }
    }
}

impl BufferAllocator for MemoryHoleFinder {
    fn reserve(&mut self, request: &PlacementRequest) -> Result<PhysicalAddress, OutOfMemory> {
        let base = self.search(request).ok_or(OutOfMemory)?;
        let range = PhysicalRange::from_start_len(base, request.size()).ok_or(OutOfMemory)?;
        trace!("reserved {range} for {request:?}");
        self.reserved.push(range);
        Ok(base)
    }

    fn release(&mut self, range: PhysicalRange) {
        if let Some(pos) = self.reserved.iter().position(|r| *r == range) {
            self.reserved.swap_remove(pos);
        }
    }
}

/// `align` must be a non-zero power of two.
const fn align_up(v: u64, align: u64) -> Option<u64> {
    match v.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

const fn align_down(v: u64, align: u64) -> u64 {
    v & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::memory::SZ_2M;

    fn range(start: u64, len: u64) -> PhysicalRange {
        PhysicalRange::from_start_len(PhysicalAddress::new(start), len).unwrap()
    }

    fn req(size: u64, align: u64, direction: Direction) -> PlacementRequest {
        PlacementRequest::new(
            size,
            align,
            PhysicalAddress::zero(),
            PhysicalAddress::MAX,
            direction,
        )
        .unwrap()
    }

    #[test]
    fn bottom_up_skips_reservations() {
        let mut f = MemoryHoleFinder::new([range(0x4000_0000, 0x80_0000)]);
        let a = f.reserve(&req(0x1000, 0, Direction::BottomUp)).unwrap();
        let b = f.reserve(&req(0x1000, 0, Direction::BottomUp)).unwrap();
        assert_eq!(a.as_u64(), 0x4000_0000);
        assert_eq!(b.as_u64(), 0x4000_1000);

        let c = f.reserve(&req(0x1000, SZ_2M, Direction::BottomUp)).unwrap();
        assert_eq!(c.as_u64(), 0x4020_0000);
    }

    #[test]
    fn top_down_prefers_high_ranges() {
        let mut f = MemoryHoleFinder::new([range(0x4000_0000, 0x40_0000), range(0x1000, 0x1000)]);
        let a = f.reserve(&req(0x2000, SZ_2M, Direction::TopDown)).unwrap();
        assert_eq!(a.as_u64(), 0x4020_0000);
        let b = f.reserve(&req(0x2000, SZ_2M, Direction::TopDown)).unwrap();
        assert_eq!(b.as_u64(), 0x4000_0000);
        assert_eq!(
            f.reserve(&req(0x2000, SZ_2M, Direction::TopDown)),
            Err(OutOfMemory)
        );
    }

    #[test]
    fn top_down_reaches_the_first_page() {
        let mut f = MemoryHoleFinder::new([range(0, 0x1000)]);
        let r = req(0x1000, 0, Direction::TopDown);
        assert_eq!(f.reserve(&r).unwrap().as_u64(), 0);
        assert_eq!(f.reserve(&r), Err(OutOfMemory));
    }

    #[test]
    fn windows_are_honoured() {
        let mut f = MemoryHoleFinder::new([range(0, 0x10_0000)]);
        let r = PlacementRequest::new(
            0x1000,
            0,
            PhysicalAddress::new(0x8000),
            PhysicalAddress::new(0x9FFF),
            Direction::TopDown,
        )
        .unwrap();
        assert_eq!(f.reserve(&r).unwrap().as_u64(), 0x9000);
        assert_eq!(f.reserve(&r).unwrap().as_u64(), 0x8000);
        assert_eq!(f.reserve(&r), Err(OutOfMemory));
    }

    #[test]
    fn release_makes_room_again() {
        let mut f = MemoryHoleFinder::for_crash(range(0x8000_0000, 0x1000));
        let a = f.reserve(&req(0x1000, 0, Direction::BottomUp)).unwrap();
        assert_eq!(
            f.reserve(&req(0x1000, 0, Direction::BottomUp)),
            Err(OutOfMemory)
        );
        f.release(range(a.as_u64(), 0x1000));
        assert!(f.reserved().is_empty());
        assert!(f.reserve(&req(0x1000, 0, Direction::BottomUp)).is_ok());
    }
}
