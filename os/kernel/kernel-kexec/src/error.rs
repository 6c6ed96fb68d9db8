use kernel_fdt::FdtError;
use kernel_memory_addresses::PhysicalRange;

/// The allocator found no free range that satisfies a placement request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no free physical range satisfies the placement request")]
pub struct OutOfMemory;

/// Rejections of a candidate kernel binary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("a buffer of {0} bytes cannot hold the 64-byte image header")]
    Truncated(usize),
    #[error("image header magic does not match")]
    BadMagic,
    #[error("image header declares a zero image size")]
    ZeroImageSize,
    #[error("text offset {0:#x} is not page aligned")]
    UnalignedTextOffset(u64),
    #[error("image endianness differs from the running kernel")]
    UnsupportedEndianness,
    #[error("image needs {0} pages which the CPU does not support")]
    UnsupportedPageSize(crate::image::PageSizeHint),
}

/// Failures of the bounded crash memory range table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("range table is full at {0} entries")]
    CapacityExceeded(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum KexecError {
    #[error("invalid kernel image")]
    Image(#[from] ImageError),
    #[error("no loader recognizes the kernel image")]
    NoLoader,
    #[error("out of memory")]
    OutOfMemory(#[from] OutOfMemory),
    #[error("crash memory ranges")]
    Ranges(#[from] RangeError),
    #[error("device tree edit failed")]
    DeviceTree(#[source] FdtError),
    #[error("device tree does not fit after {0} attempts")]
    DeviceTreeExhausted(usize),
    #[error("patched device tree of {0:#x} bytes exceeds the 2 MiB window")]
    DeviceTreeTooLarge(usize),
    #[error("device tree has no /chosen node")]
    NoChosenNode,
    #[error("no crash kernel region is reserved")]
    NoCrashRegion,
    #[error("crash image needs an ELF core header")]
    NoCoreHeader,
    #[error("a crash image is still loaded")]
    CrashImageLoaded,
    #[error("placement request of zero bytes")]
    EmptySegment,
    #[error("alignment {0:#x} is not a power of two")]
    InvalidAlignment(u64),
    #[error("address arithmetic overflowed")]
    Overflow,
    #[error("too many segments (limit {0})")]
    TooManySegments(usize),
    #[error("segment buffer of {bufsz:#x} bytes exceeds its memory size {memsz:#x}")]
    BufferTooLarge { bufsz: u64, memsz: u64 },
    #[error("segment {0} is not page aligned")]
    UnalignedSegment(PhysicalRange),
    #[error("segment {0} overlaps an already placed segment")]
    SegmentOverlap(PhysicalRange),
    #[error("crash segment {0} lies outside the reserved region")]
    SegmentOutsideCrashRegion(PhysicalRange),
    #[error("range {0} is not a releasable tail of the crash region")]
    InvalidRange(PhysicalRange),
    #[error("image has no kernel segment")]
    MissingKernelSegment,
    #[error("image has no device tree segment")]
    MissingDeviceTree,
    #[error("image segments are not loaded")]
    NotLoaded,
    #[error("secondary CPUs are stuck in the kernel")]
    Busy,
    #[error("corrupt relocation list word {0:#018x}")]
    CorruptEntry(u64),
    #[error("relocation list ends without a done entry")]
    UnterminatedList,
    #[error("source entry without a preceding destination")]
    SourceWithoutDestination,
    #[error("physical access at {0:#x} failed")]
    PhysicalAccess(u64),
}
