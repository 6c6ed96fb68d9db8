//! # Hand-off
//!
//! The last steps before control passes to the next kernel. Once
//! [`machine_kexec`] masks exceptions nothing of the running kernel is
//! trusted anymore: the relocation routine runs from the control page with
//! the MMU off, copies the staged pages along the relocation list and jumps
//! to the new entry with the device tree address in `x0`.

use crate::config::{KexecConfig, SecondaryCpuPolicy};
use crate::kimage::{Bypass, ImageKind, Kimage};
use crate::platform::{CacheMaintenance, PhysicalMemory};
use crate::KexecError;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::boot::{IND_DONE, SoftRestartArgs};
use kernel_info::memory::PAGE_SIZE;
use log::{debug, error, info, warn};

/// CPU control the hand-off needs from the running kernel.
pub trait HandoffPlatform: CacheMaintenance + PhysicalMemory {
    /// Saved register state of one CPU.
    type Registers: Default;

    fn num_online_cpus(&self) -> usize;

    /// Logical ids of every CPU that may ever come online.
    fn possible_cpus(&self) -> core::ops::Range<usize>;

    fn current_cpu(&self) -> usize;

    /// Whether secondaries failed to leave the kernel on a previous hotplug.
    fn cpus_stuck_in_kernel(&self) -> bool;

    /// Position independent code that performs the relocation with the MMU
    /// off.
    fn relocation_routine(&self) -> &'static [u8];

    /// Mask debug, `SError`, IRQ and FIQ exceptions.
    fn mask_daif(&mut self);

    /// Turn the MMU off and branch to `args.reboot_code`. Only returns if the
    /// platform cannot restart.
    fn soft_restart(&mut self, args: &SoftRestartArgs);

    fn local_irq_disable(&mut self);

    /// Stop every CPU but the current one.
    fn crash_smp_send_stop(&mut self);

    /// Record `regs` in the crash notes of `cpu`.
    fn crash_save_cpu(&mut self, regs: &Self::Registers, cpu: usize);

    /// Mask and deactivate every interrupt line.
    fn mask_interrupts(&mut self);
}

/// Hand-off state shared with the crash path.
#[derive(Debug, Default)]
pub struct HandoffState {
    in_crash_kexec: AtomicBool,
}

impl HandoffState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            in_crash_kexec: AtomicBool::new(false),
        }
    }

    /// Whether [`machine_crash_shutdown`] ran.
    #[must_use]
    pub fn in_crash_kexec(&self) -> bool {
        self.in_crash_kexec.load(Ordering::Acquire)
    }
}

/// Check a freshly loaded image against the running system.
///
/// # Errors
/// - [`KexecError::MissingKernelSegment`] or [`KexecError::MissingDeviceTree`]
///   if the image lacks either.
/// - [`KexecError::NotLoaded`] before [`Kimage::load_segments`] ran.
/// - [`KexecError::Busy`] for a normal image while CPUs are stuck in the
///   kernel; hand-off would need to take them down first.
pub fn prepare<P: HandoffPlatform + ?Sized>(
    image: &mut Kimage<'_>,
    platform: &P,
) -> Result<(), KexecError> {
    image.image_info();

    let kernel = image
        .kernel_segment()
        .ok_or(KexecError::MissingKernelSegment)?
        .mem();
    let dtb = image
        .dtb_segment()
        .ok_or(KexecError::MissingDeviceTree)?
        .mem();
    debug!("kernel segment: {kernel}, dtb segment: {dtb}");
    image.set_bypass(Bypass { kernel, dtb });

    if image.program().is_none() || image.control_page().is_none() {
        return Err(KexecError::NotLoaded);
    }
    if image.kind() != ImageKind::Crash && platform.cpus_stuck_in_kernel() {
        error!("Can't kexec: CPUs are stuck in the kernel.");
        return Err(KexecError::Busy);
    }
    Ok(())
}

/// Pass control to `image`.
///
/// The next kernel receives the device tree recorded by [`prepare`], or the
/// one placed by the loader if `prepare` was skipped.
///
/// # Panics
/// - More than one CPU online on a normal hand-off, or on a crash hand-off
///   under [`SecondaryCpuPolicy::Abort`].
/// - The image was never loaded or its relocation list is corrupt.
/// - The platform returns from [`HandoffPlatform::soft_restart`].
#[allow(clippy::cast_possible_truncation)]
pub fn machine_kexec<P: HandoffPlatform + ?Sized>(
    image: &Kimage<'_>,
    platform: &mut P,
    state: &HandoffState,
    config: &KexecConfig,
) -> ! {
    let online = platform.num_online_cpus();
    if online > 1 {
        assert!(state.in_crash_kexec(), "kexec with {online} cpus online");
        match config.crash_secondary_cpus() {
            SecondaryCpuPolicy::WarnAndProceed => {
                warn!("kdump might fail because {online} cpus are still online");
            }
            SecondaryCpuPolicy::Abort => panic!("kdump aborted: {online} cpus are still online"),
        }
    }

    let (Some(program), Some(control)) = (image.program(), image.control_page()) else {
        panic!("kexec image is not loaded");
    };

    image.image_info();
    let routine = platform.relocation_routine();
    debug!("control page:          {}", control.base());
    debug!("relocation routine:    {:#x} bytes", routine.len());
    debug!("head:                  {:#x}", program.head());
    debug!("start:                 {}", image.start());
    if let Some(bypass) = image.bypass() {
        debug!("bypass kernel:         {}", bypass.kernel);
        debug!("bypass dtb:            {}", bypass.dtb);
    }

    if let Err(e) = program.dump(config.list_dump()) {
        warn!("relocation list dump failed: {e}");
    }

    assert!(
        routine.len() as u64 <= PAGE_SIZE,
        "relocation routine of {:#x} bytes overflows the control page",
        routine.len()
    );
    if let Err(e) = platform.write(control.base(), routine) {
        panic!("cannot install relocation routine: {e}");
    }
    platform.clean_dcache_to_poc(control.base(), routine.len() as u64);
    platform.invalidate_icache(control.base(), routine.len() as u64);

    if let Err(e) = program.flush_for_execution(platform) {
        panic!("relocation list is corrupt: {e}");
    }
    if program.head() & IND_DONE != 0 {
        for segment in image.segments() {
            debug!(
                "  flush segment: {:016x} - {:016x}, {:#x} bytes",
                segment.mem().as_u64(),
                segment.mem().as_u64() + segment.memsz(),
                segment.memsz()
            );
            platform.clean_dcache_to_poc(segment.mem(), segment.memsz());
        }
    }

    info!("Bye!");
    platform.mask_daif();

    let args = SoftRestartArgs {
        reboot_code: control.base().as_u64(),
        head: program.head(),
        entry: image.start().as_u64(),
        dtb: image
            .bypass()
            .map(|b| b.dtb)
            .or(image.arch().dtb_mem)
            .map_or(0, |a| a.as_u64()),
    };
    platform.soft_restart(&args);
    panic!("soft restart returned");
}

/// Quiesce the system on the crash path before [`machine_kexec`].
///
/// Every possible CPU first gets an empty register record so slots of
/// offline CPUs are not left unfilled; the crashing CPU then saves `regs`.
pub fn machine_crash_shutdown<P: HandoffPlatform + ?Sized>(
    platform: &mut P,
    state: &HandoffState,
    regs: &P::Registers,
) {
    platform.local_irq_disable();
    platform.crash_smp_send_stop();

    state.in_crash_kexec.store(true, Ordering::Release);

    let dummy = P::Registers::default();
    for cpu in platform.possible_cpus() {
        platform.crash_save_cpu(&dummy, cpu);
    }

    platform.crash_smp_send_stop();

    let current = platform.current_cpu();
    platform.crash_save_cpu(regs, current);
    platform.mask_interrupts();

    info!("Starting crashdump kernel...");
}
