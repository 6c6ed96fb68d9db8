//! # Platform Seams
//!
//! Primitives the loader needs from the running kernel. The embedding kernel
//! implements them on top of its page allocator, linear map and cache
//! maintenance instructions; tests implement them over plain memory.

use crate::KexecError;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Allocator for single pages: relocation list pages and the control page.
pub trait PageAllocator {
    /// Allocate one page. Returns `None` when memory is exhausted.
    fn alloc_page(&mut self) -> Option<PhysicalPage<Size4K>>;

    fn free_page(&mut self, page: PhysicalPage<Size4K>);
}

/// Byte access to physical memory, e.g. through the linear map.
pub trait PhysicalMemory {
    /// Fill `buf` from physical memory at `addr`.
    ///
    /// # Errors
    /// [`KexecError::PhysicalAccess`] if the range is not accessible.
    fn read(&self, addr: PhysicalAddress, buf: &mut [u8]) -> Result<(), KexecError>;

    /// Store `data` to physical memory at `addr`.
    ///
    /// # Errors
    /// [`KexecError::PhysicalAccess`] if the range is not accessible.
    fn write(&mut self, addr: PhysicalAddress, data: &[u8]) -> Result<(), KexecError>;
}

/// Data and instruction cache maintenance by physical range.
pub trait CacheMaintenance {
    /// Clean the data cache to the point of coherency.
    fn clean_dcache_to_poc(&mut self, addr: PhysicalAddress, len: u64);

    /// Invalidate the instruction cache to the point of unification.
    fn invalidate_icache(&mut self, addr: PhysicalAddress, len: u64);
}

/// Toggling the validity of linear map pages.
pub trait MemoryProtection {
    /// Mark `pages` pages starting at `start` valid or invalid.
    fn set_memory_valid(&mut self, start: PhysicalAddress, pages: u64, valid: bool);
}
