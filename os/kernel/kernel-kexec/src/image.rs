//! # arm64 Image Header

use crate::ImageError;
use bitfield_struct::bitfield;
use core::fmt;
use core::mem::size_of;
use core::ptr::read_unaligned;
use kernel_info::memory::PAGE_SIZE;

/// Magic at byte offset 56 of an arm64 `Image`.
pub const ARM64_IMAGE_MAGIC: [u8; 4] = *b"ARM\x64";

/// Size of the `Image` header in bytes.
pub const IMAGE_HEADER_SIZE: usize = size_of::<RawImageHeader>();

// Layout from the arm64 boot protocol; all fields little-endian.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct RawImageHeader {
    code0: u32,
    code1: u32,
    text_offset: u64,
    image_size: u64,
    flags: u64,
    res2: u64,
    res3: u64,
    res4: u64,
    magic: [u8; 4],
    res5: u32,
}

const _: () = assert!(IMAGE_HEADER_SIZE == 64);

/// Kernel page size declared in bits 1–2 of the header flags.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum PageSizeHint {
    Unspecified = 0,
    Size4K = 1,
    Size16K = 2,
    Size64K = 3,
}

impl PageSizeHint {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0 => Self::Unspecified,
            1 => Self::Size4K,
            2 => Self::Size16K,
            _ => Self::Size64K,
        }
    }
}

impl fmt::Display for PageSizeHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unspecified => "unspecified",
            Self::Size4K => "4K",
            Self::Size16K => "16K",
            Self::Size64K => "64K",
        })
    }
}

/// The `flags` word of the `Image` header.
///
/// Layout (LSB→MSB):
/// - bit 0: kernel is big-endian
/// - bits 1–2: kernel page size
/// - bit 3: image may be placed anywhere in physical memory
/// - bits 4..63: reserved
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct ImageFlags {
    pub big_endian: bool,
    #[bits(2)]
    pub page_size: PageSizeHint,
    pub phys_placement_anywhere: bool,
    #[bits(60)]
    __: u64,
}

/// Parsed view of the `Image` header of a candidate kernel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    text_offset: u64,
    image_size: u64,
    flags: ImageFlags,
    magic: [u8; 4],
}

impl ImageHeader {
    /// Parse the header at the start of `buffer`.
    ///
    /// # Errors
    /// [`ImageError::Truncated`] for buffers shorter than the header and
    /// [`ImageError::BadMagic`] if the magic does not match exactly.
    pub fn parse(buffer: &[u8]) -> Result<Self, ImageError> {
        if buffer.len() < IMAGE_HEADER_SIZE {
            return Err(ImageError::Truncated(buffer.len()));
        }

        // SAFETY: We just checked bounds; using read_unaligned to avoid alignment assumptions.
        let raw = unsafe { read_unaligned(buffer.as_ptr().cast::<RawImageHeader>()) };
        if raw.magic != ARM64_IMAGE_MAGIC {
            return Err(ImageError::BadMagic);
        }

        Ok(Self {
            text_offset: u64::from_le(raw.text_offset),
            image_size: u64::from_le(raw.image_size),
            flags: ImageFlags::from_bits(u64::from_le(raw.flags)),
            magic: raw.magic,
        })
    }

    /// Distance from the 2 MiB aligned base to the kernel's first byte.
    #[inline]
    #[must_use]
    pub const fn text_offset(&self) -> u64 {
        self.text_offset
    }

    /// Effective image size including bss, as declared by the header.
    #[inline]
    #[must_use]
    pub const fn image_size(&self) -> u64 {
        self.image_size
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> ImageFlags {
        self.flags
    }
}

/// Cheap format sniff: the buffer is large enough and carries the magic.
///
/// # Errors
/// See [`ImageHeader::parse`].
pub fn probe(buffer: &[u8]) -> Result<ImageHeader, ImageError> {
    ImageHeader::parse(buffer)
}

/// Authoritative gate before any placement decision.
///
/// A header with a zero image size predates the unambiguous header format
/// and is rejected. The text offset must keep the kernel page aligned.
///
/// # Errors
/// [`ImageError::ZeroImageSize`], [`ImageError::BadMagic`] or
/// [`ImageError::UnalignedTextOffset`].
pub fn accept_for_load(header: &ImageHeader) -> Result<(), ImageError> {
    if header.magic != ARM64_IMAGE_MAGIC {
        return Err(ImageError::BadMagic);
    }
    if header.image_size == 0 {
        return Err(ImageError::ZeroImageSize);
    }
    if !header.text_offset.is_multiple_of(PAGE_SIZE) {
        return Err(ImageError::UnalignedTextOffset(header.text_offset));
    }
    Ok(())
}

/// Capabilities of the running CPU relevant to booting a new kernel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct CpuFeatures {
    /// The running kernel is big-endian.
    pub big_endian: bool,
    /// EL1 can run in either endianness.
    pub mixed_endian_el1: bool,
    pub granule_4k: bool,
    pub granule_16k: bool,
    pub granule_64k: bool,
}

impl CpuFeatures {
    /// A little-endian CPU supporting every translation granule.
    #[must_use]
    pub const fn little_endian_all_granules() -> Self {
        Self {
            big_endian: false,
            mixed_endian_el1: false,
            granule_4k: true,
            granule_16k: true,
            granule_64k: true,
        }
    }

    const fn supports(&self, hint: PageSizeHint) -> bool {
        match hint {
            PageSizeHint::Unspecified => true,
            PageSizeHint::Size4K => self.granule_4k,
            PageSizeHint::Size16K => self.granule_16k,
            PageSizeHint::Size64K => self.granule_64k,
        }
    }
}

/// Reject images the CPU cannot run: a foreign endianness without mixed
/// endian support at EL1, or an unsupported page size.
///
/// # Errors
/// [`ImageError::UnsupportedEndianness`] or [`ImageError::UnsupportedPageSize`].
pub fn check_cpu_features(header: &ImageHeader, cpu: &CpuFeatures) -> Result<(), ImageError> {
    let flags = header.flags();
    log::debug!(
        "image: {} endian, page size {}",
        if flags.big_endian() { "big" } else { "little" },
        flags.page_size()
    );

    if flags.big_endian() != cpu.big_endian && !cpu.mixed_endian_el1 {
        return Err(ImageError::UnsupportedEndianness);
    }
    if !cpu.supports(flags.page_size()) {
        return Err(ImageError::UnsupportedPageSize(flags.page_size()));
    }
    Ok(())
}

/// Whether `buffer` starts with a kernel header: correct magic and a
/// non-zero text offset.
///
/// Images with a zero text offset are not recognized here; callers fall back
/// to the segment kind, see [`Kimage::kernel_segment`](crate::Kimage::kernel_segment).
#[must_use]
pub fn is_kernel(buffer: &[u8]) -> bool {
    ImageHeader::parse(buffer).is_ok_and(|h| h.text_offset != 0)
}
