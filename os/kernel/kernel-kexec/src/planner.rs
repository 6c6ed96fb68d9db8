//! # Segment Planner
//!
//! Turns staged buffers into placed [`Segment`]s by asking a
//! [`BufferAllocator`] for physical memory that satisfies the arm64 boot
//! protocol:
//!
//! | Segment | Alignment | Window | Direction |
//! |---------|-----------|--------|-----------|
//! | kernel | 2 MiB | anywhere | bottom-up |
//! | core header | 64 KiB | above the kernel | top-down |
//! | ramdisk | page | above the kernel, below `round_down(kernel, 1 GiB) + 32 GiB` | bottom-up |
//! | device tree | 2 MiB | above the kernel | top-down |

use crate::image::ImageHeader;
use crate::segment::{Segment, SegmentKind};
use crate::{KexecError, OutOfMemory};
use alloc::borrow::Cow;
use kernel_info::memory::{
    DTB_ALIGN, ELF_CORE_HEADER_ALIGN, INITRD_WINDOW, INITRD_WINDOW_ALIGN, MIN_KIMG_ALIGN,
    PAGE_SIZE,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};
use log::debug;

/// Search direction of a placement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Lowest fitting address first.
    BottomUp,
    /// Highest fitting address first.
    TopDown,
}

/// A request for a block of physical memory.
///
/// ### Invariants
/// - `size` is a non-zero multiple of the page size.
/// - `align` is a power of two and at least one page.
/// - `min <= max`; `max` is the highest address the block may *cover*.
///
/// The hole finder relies on the first two without checking them again.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlacementRequest {
    size: u64,
    align: u64,
    min: PhysicalAddress,
    max: PhysicalAddress,
    direction: Direction,
}

impl PlacementRequest {
    /// Build a request, rounding `size` up to a page and raising `align` to
    /// at least one page.
    ///
    /// # Errors
    /// [`KexecError::EmptySegment`] for a zero size,
    /// [`KexecError::InvalidAlignment`] for a non power-of-two alignment and
    /// [`KexecError::Overflow`] if rounding overflows or the window is empty.
    pub fn new(
        size: u64,
        align: u64,
        min: PhysicalAddress,
        max: PhysicalAddress,
        direction: Direction,
    ) -> Result<Self, KexecError> {
        if size == 0 {
            return Err(KexecError::EmptySegment);
        }
        if align != 0 && !align.is_power_of_two() {
            return Err(KexecError::InvalidAlignment(align));
        }
        let size = size
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(KexecError::Overflow)?;
        if max < min {
            return Err(KexecError::Overflow);
        }

        Ok(Self {
            size,
            align: align.max(PAGE_SIZE),
            min,
            max,
            direction,
        })
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn align(&self) -> u64 {
        self.align
    }

    #[inline]
    #[must_use]
    pub const fn min(&self) -> PhysicalAddress {
        self.min
    }

    #[inline]
    #[must_use]
    pub const fn max(&self) -> PhysicalAddress {
        self.max
    }

    #[inline]
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether a block starting at `base` satisfies every constraint.
    #[must_use]
    pub fn admits(&self, base: PhysicalAddress) -> bool {
        base.as_u64().is_multiple_of(self.align)
            && base >= self.min
            && base
                .checked_add(self.size - 1)
                .is_some_and(|last| last <= self.max)
    }
}

/// The physical buffer allocator seam.
///
/// Implementations hand out page-aligned blocks and remember them until
/// [`release`](Self::release) is called for the same range.
pub trait BufferAllocator {
    /// Reserve a block satisfying `request` and return its base address.
    ///
    /// # Errors
    /// [`OutOfMemory`] if no block fits; the allocator state is unchanged.
    fn reserve(&mut self, request: &PlacementRequest) -> Result<PhysicalAddress, OutOfMemory>;

    /// Return a block obtained from [`reserve`](Self::reserve).
    fn release(&mut self, range: PhysicalRange);
}

/// Placement constraints of one segment kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Constraints {
    pub align: u64,
    pub min: PhysicalAddress,
    pub max: PhysicalAddress,
    pub direction: Direction,
}

impl Constraints {
    #[must_use]
    pub const fn kernel() -> Self {
        Self {
            align: MIN_KIMG_ALIGN,
            min: PhysicalAddress::zero(),
            max: PhysicalAddress::MAX,
            direction: Direction::BottomUp,
        }
    }

    #[must_use]
    pub const fn core_header(kernel: PhysicalRange) -> Self {
        Self {
            align: ELF_CORE_HEADER_ALIGN,
            min: above(kernel),
            max: PhysicalAddress::MAX,
            direction: Direction::TopDown,
        }
    }

    /// The ramdisk must sit entirely inside the 32 GiB window that starts at
    /// the 1 GiB boundary below the kernel.
    #[must_use]
    pub const fn ramdisk(kernel: PhysicalRange) -> Self {
        let window = kernel.start().as_u64() & !(INITRD_WINDOW_ALIGN - 1);
        Self {
            align: PAGE_SIZE,
            min: above(kernel),
            max: PhysicalAddress::new(window.saturating_add(INITRD_WINDOW - 1)),
            direction: Direction::BottomUp,
        }
    }

    #[must_use]
    pub const fn device_tree(kernel: PhysicalRange) -> Self {
        Self {
            align: DTB_ALIGN,
            min: above(kernel),
            max: PhysicalAddress::MAX,
            direction: Direction::TopDown,
        }
    }
}

const fn above(range: PhysicalRange) -> PhysicalAddress {
    range.end().saturating_add(1)
}

/// Place the kernel.
///
/// The reservation covers `image_size + text_offset` bytes at a 2 MiB
/// aligned base; the segment itself starts `text_offset` bytes in, which is
/// also the entry address of the new kernel.
///
/// # Errors
/// [`KexecError::BufferTooLarge`] if the file is larger than the image it
/// declares, [`KexecError::OutOfMemory`] if nothing fits.
pub fn plan_kernel<'a, A>(
    allocator: &mut A,
    header: &ImageHeader,
    buffer: &'a [u8],
) -> Result<Segment<'a>, KexecError>
where
    A: BufferAllocator + ?Sized,
{
    let text_offset = header.text_offset();
    let total = header
        .image_size()
        .checked_add(text_offset)
        .ok_or(KexecError::Overflow)?;
    let c = Constraints::kernel();
    let request = PlacementRequest::new(total, c.align, c.min, c.max, c.direction)?;

    let memsz = request.size() - text_offset;
    let bufsz = buffer.len() as u64;
    if bufsz > memsz {
        return Err(KexecError::BufferTooLarge { bufsz, memsz });
    }

    let base = allocator.reserve(&request)?;
    let reserved =
        PhysicalRange::from_start_len(base, request.size()).ok_or(KexecError::Overflow)?;
    let mem = base.checked_add(text_offset).ok_or(KexecError::Overflow)?;
    let range = PhysicalRange::new(mem, reserved.end()).ok_or(KexecError::Overflow)?;

    debug!(
        "Loaded kernel at {:#x} bufsz={:#x} memsz={:#x}",
        mem.as_u64(),
        bufsz,
        range.len()
    );
    Ok(Segment::within(
        SegmentKind::Kernel,
        Cow::Borrowed(buffer),
        range,
        reserved,
    ))
}

/// Place a ramdisk, device tree or core header under `constraints`.
///
/// # Errors
/// [`KexecError::EmptySegment`] for an empty buffer,
/// [`KexecError::OutOfMemory`] if nothing fits.
pub fn plan_payload<'a, A>(
    allocator: &mut A,
    kind: SegmentKind,
    buffer: Cow<'a, [u8]>,
    constraints: &Constraints,
) -> Result<Segment<'a>, KexecError>
where
    A: BufferAllocator + ?Sized,
{
    let request = PlacementRequest::new(
        buffer.len() as u64,
        constraints.align,
        constraints.min,
        constraints.max,
        constraints.direction,
    )?;
    let base = allocator.reserve(&request)?;
    let range = PhysicalRange::from_start_len(base, request.size()).ok_or(KexecError::Overflow)?;

    debug!(
        "Loaded {kind} at {:#x} bufsz={:#x} memsz={:#x}",
        base.as_u64(),
        buffer.len(),
        range.len()
    );
    Ok(Segment::new(kind, buffer, range))
}
