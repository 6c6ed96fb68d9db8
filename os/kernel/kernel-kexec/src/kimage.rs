//! # Loaded Images

use crate::image::is_kernel;
use crate::planner::BufferAllocator;
use crate::platform::{PageAllocator, PhysicalMemory};
use crate::relocation::RelocationProgram;
use crate::segment::{Segment, SegmentKind};
use crate::KexecError;
use crate::OutOfMemory;
use alloc::vec::Vec;
use core::fmt;
use kernel_fdt::FDT_MAGIC;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, PhysicalRange, Size4K};
use log::debug;

/// Maximum number of segments in one image.
pub const KEXEC_SEGMENT_MAX: usize = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ImageKind {
    /// Replace the running kernel on request.
    Normal,
    /// Boot into the reserved region after a crash.
    Crash,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Normal => "default",
            Self::Crash => "crash",
        })
    }
}

/// Where the loader put the blobs the next kernel is told about.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ArchData {
    pub dtb_mem: Option<PhysicalAddress>,
    pub elf_headers_mem: Option<PhysicalAddress>,
    pub elf_headers_sz: u64,
}

/// Entry and device tree addresses resolved before hand-off.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Bypass {
    pub kernel: PhysicalAddress,
    pub dtb: PhysicalAddress,
}

/// A boot image being loaded or waiting for hand-off.
pub struct Kimage<'a> {
    kind: ImageKind,
    segments: Vec<Segment<'a>>,
    start: PhysicalAddress,
    crash_region: Option<PhysicalRange>,
    arch: ArchData,
    program: Option<RelocationProgram>,
    control_page: Option<PhysicalPage<Size4K>>,
    bypass: Option<Bypass>,
}

impl<'a> Kimage<'a> {
    /// Start an empty image.
    ///
    /// # Errors
    /// [`KexecError::NoCrashRegion`] for a crash image without a region.
    pub fn new(kind: ImageKind, crash_region: Option<PhysicalRange>) -> Result<Self, KexecError> {
        if kind == ImageKind::Crash && crash_region.is_none() {
            return Err(KexecError::NoCrashRegion);
        }
        Ok(Self {
            kind,
            segments: Vec::new(),
            start: PhysicalAddress::zero(),
            crash_region,
            arch: ArchData::default(),
            program: None,
            control_page: None,
            bypass: None,
        })
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> ImageKind {
        self.kind
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment<'a>] {
        &self.segments
    }

    /// Entry address of the new kernel.
    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        self.start
    }

    pub const fn set_start(&mut self, start: PhysicalAddress) {
        self.start = start;
    }

    #[must_use]
    pub const fn arch(&self) -> &ArchData {
        &self.arch
    }

    pub const fn arch_mut(&mut self) -> &mut ArchData {
        &mut self.arch
    }

    #[must_use]
    pub const fn program(&self) -> Option<&RelocationProgram> {
        self.program.as_ref()
    }

    #[must_use]
    pub const fn control_page(&self) -> Option<PhysicalPage<Size4K>> {
        self.control_page
    }

    #[must_use]
    pub const fn bypass(&self) -> Option<Bypass> {
        self.bypass
    }

    pub(crate) const fn set_bypass(&mut self, bypass: Bypass) {
        self.bypass = Some(bypass);
    }

    /// Add a placed segment.
    ///
    /// # Errors
    /// - [`KexecError::TooManySegments`] beyond [`KEXEC_SEGMENT_MAX`].
    /// - [`KexecError::BufferTooLarge`] if the buffer exceeds the placed size.
    /// - [`KexecError::UnalignedSegment`] for a segment not starting on a page.
    /// - [`KexecError::SegmentOverlap`] if it collides with an earlier one.
    /// - [`KexecError::SegmentOutsideCrashRegion`] for a crash segment that
    ///   leaves the region.
    pub fn add_segment(&mut self, segment: Segment<'a>) -> Result<(), KexecError> {
        if self.segments.len() >= KEXEC_SEGMENT_MAX {
            return Err(KexecError::TooManySegments(KEXEC_SEGMENT_MAX));
        }
        if segment.bufsz() > segment.memsz() {
            return Err(KexecError::BufferTooLarge {
                bufsz: segment.bufsz(),
                memsz: segment.memsz(),
            });
        }
        if !segment.mem().as_u64().is_multiple_of(PAGE_SIZE)
            || !segment.memsz().is_multiple_of(PAGE_SIZE)
        {
            return Err(KexecError::UnalignedSegment(segment.range()));
        }
        if self
            .segments
            .iter()
            .any(|s| s.reserved().overlaps(segment.reserved()))
        {
            return Err(KexecError::SegmentOverlap(segment.reserved()));
        }
        if let Some(region) = self.crash_region.filter(|_| self.kind == ImageKind::Crash)
            && !region.encloses(segment.reserved())
        {
            return Err(KexecError::SegmentOutsideCrashRegion(segment.reserved()));
        }

        self.segments.push(segment);
        Ok(())
    }

    /// Return every segment reservation to `allocator` and drop the segments.
    pub fn discard_segments<A: BufferAllocator + ?Sized>(&mut self, allocator: &mut A) {
        for segment in self.segments.drain(..) {
            allocator.release(segment.reserved());
        }
    }

    /// Copy the segments towards their destinations.
    ///
    /// A normal image is staged into source pages and gets a relocation
    /// program; a crash image is written straight into the reserved region
    /// and its program is a lone `Done`. Either way a control page for the
    /// relocation routine is set aside that no segment overlaps.
    ///
    /// # Errors
    /// [`KexecError::OutOfMemory`] and [`KexecError::PhysicalAccess`].
    pub fn load_segments<P, M>(&mut self, pages: &mut P, mem: &mut M) -> Result<(), KexecError>
    where
        P: PageAllocator + ?Sized,
        M: PhysicalMemory + ?Sized,
    {
        let control = self.alloc_control_page(pages)?;

        let program = match self.kind {
            ImageKind::Normal => RelocationProgram::encode(&self.segments, pages, mem),
            ImageKind::Crash => self.copy_in_place(mem).map(|()| RelocationProgram::in_place()),
        };
        match program {
            Ok(program) => {
                self.program = Some(program);
                self.control_page = Some(control);
                Ok(())
            }
            Err(e) => {
                pages.free_page(control);
                Err(e)
            }
        }
    }

    fn alloc_control_page<P: PageAllocator + ?Sized>(
        &self,
        pages: &mut P,
    ) -> Result<PhysicalPage<Size4K>, KexecError> {
        let mut rejected = Vec::new();
        let found = loop {
            let Some(page) = pages.alloc_page() else {
                break None;
            };
            let span = PhysicalRange::new(page.base(), page.last());
            let usable = span.is_some_and(|span| {
                let clear = !self.segments.iter().any(|s| s.reserved().overlaps(span));
                let placed = match self.kind {
                    ImageKind::Crash => self.crash_region.is_some_and(|r| r.encloses(span)),
                    ImageKind::Normal => true,
                };
                clear && placed
            });
            if usable {
                break Some(page);
            }
            rejected.push(page);
        };
        for page in rejected {
            pages.free_page(page);
        }
        found.ok_or(KexecError::OutOfMemory(OutOfMemory))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn copy_in_place<M: PhysicalMemory + ?Sized>(&self, mem: &mut M) -> Result<(), KexecError> {
        let zero = [0u8; PAGE_SIZE as usize];
        for segment in &self.segments {
            mem.write(segment.mem(), segment.buffer())?;
            let mut at = segment.mem() + segment.bufsz();
            let mut left = segment.memsz() - segment.bufsz();
            while left > 0 {
                let n = left.min(PAGE_SIZE);
                mem.write(at, &zero[..n as usize])?;
                at += n;
                left -= n;
            }
        }
        Ok(())
    }

    /// Drop the staged device tree and core header once they are loaded.
    pub fn post_load_cleanup(&mut self) {
        for segment in &mut self.segments {
            if matches!(
                segment.kind(),
                SegmentKind::DeviceTree | SegmentKind::CoreHeader
            ) {
                segment.release_buffer();
            }
        }
    }

    /// The segment holding the kernel, found by its header.
    #[must_use]
    pub fn kernel_segment(&self) -> Option<&Segment<'a>> {
        self.segments
            .iter()
            .find(|s| is_kernel(s.buffer()))
            .or_else(|| self.segments.iter().find(|s| s.kind() == SegmentKind::Kernel))
    }

    /// The segment holding the device tree, found by its magic.
    #[must_use]
    pub fn dtb_segment(&self) -> Option<&Segment<'a>> {
        self.segments
            .iter()
            .find(|s| is_dtb(s.buffer()))
            .or_else(|| {
                self.segments
                    .iter()
                    .find(|s| s.kind() == SegmentKind::DeviceTree)
            })
    }

    /// Log the image layout.
    pub fn image_info(&self) {
        debug!("  kexec kimage info:");
        debug!("    type:        {}", self.kind);
        debug!("    start:       {:x}", self.start.as_u64());
        debug!(
            "    head:        {:x}",
            self.program.as_ref().map_or(0, RelocationProgram::head)
        );
        debug!("    nr_segments: {}", self.segments.len());
        for (i, s) in self.segments.iter().enumerate() {
            debug!(
                "      segment[{i}]: {:016x} - {:016x}, {:#x} bytes, {} pages{}",
                s.mem().as_u64(),
                s.mem().as_u64() + s.memsz(),
                s.memsz(),
                s.pages(),
                if s.kind() == SegmentKind::DeviceTree {
                    ", dtb segment"
                } else {
                    ""
                }
            );
        }
    }

    /// Give back every page and reservation held by the image.
    pub fn release<P, A>(mut self, pages: &mut P, allocator: &mut A)
    where
        P: PageAllocator + ?Sized,
        A: BufferAllocator + ?Sized,
    {
        if let Some(program) = self.program.take() {
            program.release(pages);
        }
        if let Some(control) = self.control_page.take() {
            pages.free_page(control);
        }
        self.discard_segments(allocator);
    }
}

fn is_dtb(buffer: &[u8]) -> bool {
    buffer
        .first_chunk::<4>()
        .is_some_and(|m| u32::from_be_bytes(*m) == FDT_MAGIC)
}

impl fmt::Debug for Kimage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kimage")
            .field("kind", &self.kind)
            .field("start", &self.start)
            .field("segments", &self.segments)
            .field("arch", &self.arch)
            .finish_non_exhaustive()
    }
}
