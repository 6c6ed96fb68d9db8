//! # Boot Image Segments

use alloc::borrow::Cow;
use core::fmt;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};

/// What a segment carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Kernel,
    Ramdisk,
    DeviceTree,
    CoreHeader,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Kernel => "kernel",
            Self::Ramdisk => "initrd",
            Self::DeviceTree => "dtb",
            Self::CoreHeader => "elf core header",
        })
    }
}

/// One placement unit of a boot image.
///
/// `range` is the memory the segment occupies once relocated. For the
/// kernel it starts `text_offset` bytes into `reserved`, the block actually
/// handed out by the allocator; for every other kind the two are equal.
#[derive(Clone)]
pub struct Segment<'a> {
    kind: SegmentKind,
    buffer: Cow<'a, [u8]>,
    range: PhysicalRange,
    reserved: PhysicalRange,
}

impl<'a> Segment<'a> {
    #[must_use]
    pub const fn new(kind: SegmentKind, buffer: Cow<'a, [u8]>, range: PhysicalRange) -> Self {
        Self {
            kind,
            buffer,
            range,
            reserved: range,
        }
    }

    /// A segment placed inside a larger reservation.
    #[must_use]
    pub const fn within(
        kind: SegmentKind,
        buffer: Cow<'a, [u8]>,
        range: PhysicalRange,
        reserved: PhysicalRange,
    ) -> Self {
        Self {
            kind,
            buffer,
            range,
            reserved,
        }
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// Staged source bytes. Empty once released after load.
    #[inline]
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Final physical address.
    #[inline]
    #[must_use]
    pub const fn mem(&self) -> PhysicalAddress {
        self.range.start()
    }

    /// Placed size in bytes. A whole number of pages.
    #[inline]
    #[must_use]
    pub const fn memsz(&self) -> u64 {
        self.range.len()
    }

    #[inline]
    #[must_use]
    pub fn bufsz(&self) -> u64 {
        self.buffer.len() as u64
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        self.range
    }

    /// The block obtained from the allocator.
    #[inline]
    #[must_use]
    pub const fn reserved(&self) -> PhysicalRange {
        self.reserved
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.memsz().div_ceil(PAGE_SIZE)
    }

    /// Drop the staged bytes. The placement is kept.
    pub fn release_buffer(&mut self) {
        self.buffer = Cow::Borrowed(&[]);
    }
}

impl fmt::Debug for Segment<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("kind", &self.kind)
            .field("bufsz", &self.buffer.len())
            .field("range", &self.range)
            .field("reserved", &self.reserved)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        let range = PhysicalRange::from_start_len(PhysicalAddress::new(0x4020_0000), 0x3000).unwrap();
        let data = [1u8, 2, 3];
        let mut seg = Segment::new(SegmentKind::Ramdisk, Cow::Borrowed(&data), range);
        assert_eq!(seg.mem().as_u64(), 0x4020_0000);
        assert_eq!(seg.memsz(), 0x3000);
        assert_eq!(seg.bufsz(), 3);
        assert_eq!(seg.pages(), 3);
        assert_eq!(seg.reserved(), range);

        seg.release_buffer();
        assert_eq!(seg.bufsz(), 0);
        assert_eq!(seg.range(), range);
    }
}
