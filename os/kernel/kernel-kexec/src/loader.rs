//! # Image Loaders
//!
//! A file load picks the first registered [`KexecFileOps`] whose probe
//! accepts the kernel buffer and lets it place every segment:
//!
//! 1. Validate the kernel header against the running CPU.
//! 2. Place the kernel; its segment start becomes the entry address.
//! 3. Crash images only: build and place the ELF core header.
//! 4. Place the ramdisk, if any.
//! 5. Patch the device tree for the final layout and place it last.
//!
//! On failure every reservation taken so far is handed back to the
//! allocator.

use crate::KexecError;
use crate::config::KexecConfig;
use crate::crash::CrashGovernor;
use crate::dtb::{self, DtbPatch};
use crate::elf_core::CoreSources;
use crate::entropy::EntropyGate;
use crate::image::{CpuFeatures, ImageHeader, accept_for_load, check_cpu_features, probe};
use crate::kimage::{ImageKind, Kimage};
use crate::planner::{BufferAllocator, Constraints, plan_kernel, plan_payload};
use crate::segment::{Segment, SegmentKind};
use alloc::borrow::Cow;
use kernel_memory_addresses::PhysicalRange;
use log::{debug, info};
use rand_core::RngCore;

/// The user supplied parts of a file load.
#[derive(Debug, Copy, Clone)]
pub struct LoadRequest<'a> {
    pub kernel: &'a [u8],
    pub initrd: Option<&'a [u8]>,
    pub cmdline: Option<&'a str>,
}

impl<'a> LoadRequest<'a> {
    #[must_use]
    pub const fn new(kernel: &'a [u8]) -> Self {
        Self {
            kernel,
            initrd: None,
            cmdline: None,
        }
    }

    #[must_use]
    pub const fn with_initrd(mut self, initrd: &'a [u8]) -> Self {
        self.initrd = Some(initrd);
        self
    }

    #[must_use]
    pub const fn with_cmdline(mut self, cmdline: &'a str) -> Self {
        self.cmdline = Some(cmdline);
        self
    }
}

/// Everything a loader borrows from the running kernel.
pub struct LoadContext<'c> {
    /// Free physical memory; for crash images, the crash region.
    pub allocator: &'c mut dyn BufferAllocator,
    pub rng: &'c mut dyn RngCore,
    /// The running kernel's flattened device tree.
    pub dtb_template: &'c [u8],
    pub config: &'c KexecConfig,
    pub entropy: &'c EntropyGate,
    pub crash: &'c CrashGovernor,
    /// System RAM as seen by the running kernel; used for crash dumps.
    pub live_ranges: &'c [PhysicalRange],
    pub core_sources: &'c CoreSources,
    pub cpu: CpuFeatures,
}

/// A kernel image format.
pub trait KexecFileOps {
    fn name(&self) -> &'static str;

    /// Cheap check whether `kernel` is in this loader's format.
    ///
    /// # Errors
    /// Whatever made the buffer unrecognizable.
    fn probe(&self, kernel: &[u8]) -> Result<(), KexecError>;

    /// Place all segments of a new image.
    ///
    /// # Errors
    /// Any validation, placement or device tree failure.
    fn load<'a>(
        &self,
        kind: ImageKind,
        request: &LoadRequest<'a>,
        ctx: &mut LoadContext<'_>,
    ) -> Result<Kimage<'a>, KexecError>;
}

/// Loader for the arm64 `Image` format.
#[derive(Debug, Copy, Clone, Default)]
pub struct Arm64ImageLoader;

/// Registered loaders in probe order.
pub static KEXEC_FILE_LOADERS: &[&(dyn KexecFileOps + Sync)] = &[&Arm64ImageLoader];

/// Find the loader for `kernel`.
///
/// # Errors
/// [`KexecError::NoLoader`] if no registered loader accepts it.
pub fn probe_image(kernel: &[u8]) -> Result<&'static (dyn KexecFileOps + Sync), KexecError> {
    for ops in KEXEC_FILE_LOADERS {
        match ops.probe(kernel) {
            Ok(()) => return Ok(*ops),
            Err(e) => debug!("{}: probe failed: {e}", ops.name()),
        }
    }
    Err(KexecError::NoLoader)
}

/// Probe `request.kernel` and load it with the matching loader.
///
/// # Errors
/// [`KexecError::NoLoader`] or whatever the loader reports.
pub fn load_image<'a>(
    kind: ImageKind,
    request: &LoadRequest<'a>,
    ctx: &mut LoadContext<'_>,
) -> Result<Kimage<'a>, KexecError> {
    let ops = probe_image(request.kernel)?;
    ops.load(kind, request, ctx)
}

impl KexecFileOps for Arm64ImageLoader {
    fn name(&self) -> &'static str {
        "kexec_image"
    }

    fn probe(&self, kernel: &[u8]) -> Result<(), KexecError> {
        probe(kernel)?;
        Ok(())
    }

    fn load<'a>(
        &self,
        kind: ImageKind,
        request: &LoadRequest<'a>,
        ctx: &mut LoadContext<'_>,
    ) -> Result<Kimage<'a>, KexecError> {
        let header = probe(request.kernel)?;
        accept_for_load(&header)?;
        check_cpu_features(&header, &ctx.cpu)?;

        let mut image = Kimage::new(kind, ctx.crash.region())?;
        match load_segments(&mut image, &header, request, ctx) {
            Ok(()) => {
                info!(
                    "{kind} image loaded: entry {:#x}, {} segments",
                    image.start().as_u64(),
                    image.segments().len()
                );
                Ok(image)
            }
            Err(e) => {
                image.discard_segments(ctx.allocator);
                Err(e)
            }
        }
    }
}

fn load_segments<'a>(
    image: &mut Kimage<'a>,
    header: &ImageHeader,
    request: &LoadRequest<'a>,
    ctx: &mut LoadContext<'_>,
) -> Result<(), KexecError> {
    let kernel = plan_kernel(ctx.allocator, header, request.kernel)?;
    let kernel_range = kernel.range();
    image.set_start(kernel.mem());
    add(image, ctx.allocator, kernel)?;

    if image.kind() == ImageKind::Crash {
        let headers = ctx
            .crash
            .build_dump_header(ctx.live_ranges.iter().copied(), ctx.core_sources)?;
        let segment = plan_payload(
            ctx.allocator,
            SegmentKind::CoreHeader,
            Cow::Owned(headers),
            &Constraints::core_header(kernel_range),
        )?;
        let arch = image.arch_mut();
        arch.elf_headers_mem = Some(segment.mem());
        arch.elf_headers_sz = segment.bufsz();
        add(image, ctx.allocator, segment)?;
    }

    let mut initrd = None;
    if let Some(buffer) = request.initrd {
        let segment = plan_payload(
            ctx.allocator,
            SegmentKind::Ramdisk,
            Cow::Borrowed(buffer),
            &Constraints::ramdisk(kernel_range),
        )?;
        initrd = Some((segment.mem(), segment.bufsz()));
        add(image, ctx.allocator, segment)?;
    }

    let arch = *image.arch();
    let patch = DtbPatch {
        initrd,
        cmdline: request.cmdline,
        core_header: arch.elf_headers_mem.map(|mem| (mem, arch.elf_headers_sz)),
        crash_region: ctx.crash.region(),
        ..DtbPatch::new(image.kind())
    };
    let blob = dtb::build(ctx.dtb_template, &patch, ctx.config, ctx.entropy, ctx.rng)?;
    let segment = plan_payload(
        ctx.allocator,
        SegmentKind::DeviceTree,
        Cow::Owned(blob),
        &Constraints::device_tree(kernel_range),
    )?;
    image.arch_mut().dtb_mem = Some(segment.mem());
    add(image, ctx.allocator, segment)
}

/// Add a planned segment, returning its reservation if the image rejects it.
fn add<'a>(
    image: &mut Kimage<'a>,
    allocator: &mut dyn BufferAllocator,
    segment: Segment<'a>,
) -> Result<(), KexecError> {
    let reserved = segment.reserved();
    image
        .add_segment(segment)
        .inspect_err(|_| allocator.release(reserved))
}
