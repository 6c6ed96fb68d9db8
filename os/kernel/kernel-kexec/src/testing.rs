//! In-memory stand-ins for physical memory and the page allocator.

use crate::KexecError;
use crate::platform::{CacheMaintenance, PageAllocator, PhysicalMemory};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, PhysicalRange, Size4K};

const PAGE: usize = PAGE_SIZE as usize;

/// Sparse "physical memory" over a fixed window; untouched pages read as zero.
pub struct TestPhys {
    window: PhysicalRange,
    frames: BTreeMap<u64, Box<[u8; PAGE]>>,
}

impl TestPhys {
    pub fn new(start: u64, len: u64) -> Self {
        Self {
            window: PhysicalRange::from_start_len(PhysicalAddress::new(start), len).unwrap(),
            frames: BTreeMap::new(),
        }
    }

    pub fn bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = alloc::vec![0u8; len];
        self.read(PhysicalAddress::new(addr), &mut out).unwrap();
        out
    }

    fn check(&self, addr: PhysicalAddress, len: usize) -> Result<(), KexecError> {
        let ok = len == 0
            || PhysicalRange::from_start_len(addr, len as u64).is_some_and(|r| self.window.encloses(r));
        if ok {
            Ok(())
        } else {
            Err(KexecError::PhysicalAccess(addr.as_u64()))
        }
    }
}

impl PhysicalMemory for TestPhys {
    fn read(&self, addr: PhysicalAddress, buf: &mut [u8]) -> Result<(), KexecError> {
        self.check(addr, buf.len())?;
        for (i, b) in buf.iter_mut().enumerate() {
            let a = addr.as_u64() + i as u64;
            let frame = a & !(PAGE_SIZE - 1);
            *b = self
                .frames
                .get(&frame)
                .map_or(0, |f| f[(a - frame) as usize]);
        }
        Ok(())
    }

    fn write(&mut self, addr: PhysicalAddress, data: &[u8]) -> Result<(), KexecError> {
        self.check(addr, data.len())?;
        for (i, b) in data.iter().enumerate() {
            let a = addr.as_u64() + i as u64;
            let frame = a & !(PAGE_SIZE - 1);
            let f = self
                .frames
                .entry(frame)
                .or_insert_with(|| Box::new([0u8; PAGE]));
            f[(a - frame) as usize] = *b;
        }
        Ok(())
    }
}

/// Hands out consecutive pages from a window and records frees.
pub struct BumpPages {
    next: u64,
    end: u64,
    pub freed: Vec<u64>,
}

impl BumpPages {
    pub fn new(start: u64, pages: u64) -> Self {
        Self {
            next: start,
            end: start + pages * PAGE_SIZE,
            freed: Vec::new(),
        }
    }
}

impl PageAllocator for BumpPages {
    fn alloc_page(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.next >= self.end {
            return None;
        }
        let page = PhysicalPage::from_addr(PhysicalAddress::new(self.next));
        self.next += PAGE_SIZE;
        Some(page)
    }

    fn free_page(&mut self, page: PhysicalPage<Size4K>) {
        self.freed.push(page.base().as_u64());
    }
}

/// Records every cache maintenance call.
#[derive(Default)]
pub struct CacheLog {
    pub cleaned: Vec<(u64, u64)>,
    pub invalidated: Vec<(u64, u64)>,
}

impl CacheMaintenance for CacheLog {
    fn clean_dcache_to_poc(&mut self, addr: PhysicalAddress, len: u64) {
        self.cleaned.push((addr.as_u64(), len));
    }

    fn invalidate_icache(&mut self, addr: PhysicalAddress, len: u64) {
        self.invalidated.push((addr.as_u64(), len));
    }
}
