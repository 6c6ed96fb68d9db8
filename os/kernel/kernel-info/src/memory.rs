//! # Memory Layout

use kernel_memory_addresses::{PageSize, Size1G, Size2M, Size4K, Size64K};

/// The base page size for segments and relocation list pages.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = Size4K::SHIFT;

pub const SZ_64K: u64 = Size64K::SIZE;
pub const SZ_2M: u64 = Size2M::SIZE;
pub const SZ_1G: u64 = Size1G::SIZE;

/// Minimum alignment of the kernel image reservation.
///
/// The arm64 boot protocol requires the image to sit `text_offset` bytes
/// above a 2 MiB aligned base.
pub const MIN_KIMG_ALIGN: u64 = SZ_2M;

/// Alignment of the core-dump header.
pub const ELF_CORE_HEADER_ALIGN: u64 = SZ_64K;

/// Alignment of the device tree. A blob aligned to 2 MiB and smaller than
/// 2 MiB never crosses a 2 MiB boundary.
pub const DTB_ALIGN: u64 = SZ_2M;

/// Upper bound on the size of a patched device tree.
pub const MAX_FDT_SIZE: u64 = SZ_2M;

/// Granule the ramdisk window is anchored to.
pub const INITRD_WINDOW_ALIGN: u64 = SZ_1G;

/// Span of the ramdisk window above `round_down(kernel, INITRD_WINDOW_ALIGN)`.
pub const INITRD_WINDOW: u64 = 32 * SZ_1G;

/// Extra room reserved in the device tree working buffer for properties added
/// during patching.
pub const DTB_EXTRA_SPACE: u64 = 0x1000;

/// Start of the kernel linear map. A physical address `pa` is visible at
/// `PAGE_OFFSET + pa` in the running kernel.
pub const PAGE_OFFSET: u64 = 0xffff_8000_0000_0000;

/// Number of relocation list words that fit in one page.
pub const ENTRIES_PER_PAGE: usize = (PAGE_SIZE / 8) as usize;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(MIN_KIMG_ALIGN.is_multiple_of(PAGE_SIZE));
    assert!(ELF_CORE_HEADER_ALIGN.is_multiple_of(PAGE_SIZE));
    assert!(DTB_ALIGN >= MAX_FDT_SIZE);
    assert!(INITRD_WINDOW.is_multiple_of(INITRD_WINDOW_ALIGN));
    assert!(DTB_EXTRA_SPACE.is_multiple_of(PAGE_SIZE));
    assert!(ENTRIES_PER_PAGE == 512);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initrd_window_is_anchored_to_gigabyte() {
        let kernel = 0x8_4020_0000_u64;
        let base = kernel & !(INITRD_WINDOW_ALIGN - 1);
        assert_eq!(base, 0x8_4000_0000);
        assert_eq!(base + INITRD_WINDOW, 0x10_4000_0000);
    }
}
