//! # Device Tree Patcher
//!
//! The next kernel boots with a copy of the running kernel's device tree
//! whose `/chosen` node is rewritten for the new image:
//!
//! | Property | Content |
//! |----------|---------|
//! | `linux,elfcorehdr` | crash only: `reg` of the ELF core header |
//! | `linux,usable-memory-range` | crash only: `reg` of the crash region |
//! | `bootargs` | the new command line, removed if there is none |
//! | `linux,initrd-start`, `linux,initrd-end` | ramdisk bounds, removed if there is none |
//! | `kaslr-seed` | a fresh seed once the entropy pool is ready, removed otherwise |

use crate::config::KexecConfig;
use crate::entropy::EntropyGate;
use crate::kimage::ImageKind;
use crate::KexecError;
use alloc::vec::Vec;
use kernel_fdt::{Fdt, FdtError, FdtHeader, NodeOffset};
use kernel_info::memory::MAX_FDT_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};
use log::{debug, info};
use rand_core::RngCore;

pub const PROP_ELFCOREHDR: &str = "linux,elfcorehdr";
pub const PROP_USABLE_MEM_RANGE: &str = "linux,usable-memory-range";
pub const PROP_BOOTARGS: &str = "bootargs";
pub const PROP_INITRD_START: &str = "linux,initrd-start";
pub const PROP_INITRD_END: &str = "linux,initrd-end";
pub const PROP_KASLR_SEED: &str = "kaslr-seed";

/// What to write into `/chosen`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DtbPatch<'a> {
    pub kind: ImageKind,
    /// Load address and length of the ramdisk.
    pub initrd: Option<(PhysicalAddress, u64)>,
    pub cmdline: Option<&'a str>,
    /// Load address and size of the ELF core header.
    pub core_header: Option<(PhysicalAddress, u64)>,
    pub crash_region: Option<PhysicalRange>,
}

impl<'a> DtbPatch<'a> {
    #[must_use]
    pub const fn new(kind: ImageKind) -> Self {
        Self {
            kind,
            initrd: None,
            cmdline: None,
            core_header: None,
            crash_region: None,
        }
    }
}

/// Patch `template` and return the packed blob.
///
/// The working buffer starts at the template size plus the command line
/// plus [`KexecConfig::dtb_extra_space`], and grows by the same slack each
/// time an edit runs out of room, at most
/// [`KexecConfig::max_dtb_regrowths`] times.
///
/// # Errors
/// - [`KexecError::NoChosenNode`] if the template lacks `/chosen`.
/// - [`KexecError::NoCoreHeader`] or [`KexecError::NoCrashRegion`] for a crash
///   image without them.
/// - [`KexecError::DeviceTreeExhausted`] if the edits never fit.
/// - [`KexecError::DeviceTreeTooLarge`] if the result exceeds [`MAX_FDT_SIZE`].
/// - [`KexecError::DeviceTree`] for any other library failure.
#[allow(clippy::cast_possible_truncation)]
pub fn build(
    template: &[u8],
    patch: &DtbPatch<'_>,
    config: &KexecConfig,
    entropy: &EntropyGate,
    rng: &mut dyn RngCore,
) -> Result<Vec<u8>, KexecError> {
    let crash = match patch.kind {
        ImageKind::Crash => Some((
            patch.core_header.ok_or(KexecError::NoCoreHeader)?,
            patch.crash_region.ok_or(KexecError::NoCrashRegion)?,
        )),
        ImageKind::Normal => None,
    };

    let seed = if entropy.is_ready() {
        Some(rng.next_u64())
    } else {
        info!("kaslr-seed won't be fed");
        None
    };

    let header = FdtHeader::parse(template).map_err(KexecError::DeviceTree)?;
    let slack = config.dtb_extra_space() as usize;
    let mut bufsize = header.totalsize as usize + patch.cmdline.map_or(0, str::len) + slack;

    let attempts = config.max_dtb_regrowths() + 1;
    for attempt in 1..=attempts {
        let mut fdt = Fdt::open_into(template, bufsize).map_err(KexecError::DeviceTree)?;
        match apply(&mut fdt, patch, crash, seed) {
            Ok(()) => {
                let blob = fdt.into_bytes();
                if blob.len() as u64 > MAX_FDT_SIZE {
                    return Err(KexecError::DeviceTreeTooLarge(blob.len()));
                }
                debug!("dtb: {:#x} bytes after {attempt} attempt(s)", blob.len());
                return Ok(blob);
            }
            Err(PatchError::Fdt(FdtError::NoSpace)) => {
                debug!("dtb: {bufsize:#x} bytes are not enough, growing");
                bufsize += slack;
            }
            Err(PatchError::Fdt(e)) => return Err(KexecError::DeviceTree(e)),
            Err(PatchError::NoChosen) => return Err(KexecError::NoChosenNode),
        }
    }

    Err(KexecError::DeviceTreeExhausted(attempts))
}

enum PatchError {
    NoChosen,
    Fdt(FdtError),
}

impl From<FdtError> for PatchError {
    fn from(e: FdtError) -> Self {
        Self::Fdt(e)
    }
}

fn apply(
    fdt: &mut Fdt,
    patch: &DtbPatch<'_>,
    crash: Option<((PhysicalAddress, u64), PhysicalRange)>,
    seed: Option<u64>,
) -> Result<(), PatchError> {
    let chosen = match fdt.path_offset("/chosen") {
        Ok(node) => node,
        Err(FdtError::NotFound) => return Err(PatchError::NoChosen),
        Err(e) => return Err(e.into()),
    };

    if let Some(((hdr, hdr_len), region)) = crash {
        fdt.setprop_reg(chosen, PROP_ELFCOREHDR, hdr.as_u64(), hdr_len)?;
        fdt.setprop_reg(
            chosen,
            PROP_USABLE_MEM_RANGE,
            region.start().as_u64(),
            region.len(),
        )?;
    } else {
        remove(fdt, chosen, PROP_ELFCOREHDR)?;
        remove(fdt, chosen, PROP_USABLE_MEM_RANGE)?;
    }

    match patch.cmdline {
        Some(cmdline) => fdt.setprop_string(chosen, PROP_BOOTARGS, cmdline)?,
        None => remove(fdt, chosen, PROP_BOOTARGS)?,
    }

    if let Some((start, len)) = patch.initrd {
        fdt.setprop_u64(chosen, PROP_INITRD_START, start.as_u64())?;
        fdt.setprop_u64(chosen, PROP_INITRD_END, start.as_u64() + len)?;
    } else {
        remove(fdt, chosen, PROP_INITRD_START)?;
        remove(fdt, chosen, PROP_INITRD_END)?;
    }

    remove(fdt, chosen, PROP_KASLR_SEED)?;
    if let Some(seed) = seed {
        fdt.setprop_u64(chosen, PROP_KASLR_SEED, seed)?;
    }
    Ok(())
}

/// Delete a property that may legitimately be absent.
fn remove(fdt: &mut Fdt, node: NodeOffset, name: &str) -> Result<(), FdtError> {
    match fdt.delprop(node, name) {
        Ok(()) | Err(FdtError::NotFound) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_fdt::FdtWriter;
    use rand::rngs::mock::StepRng;

    fn template(with_chosen: bool) -> Vec<u8> {
        let mut w = FdtWriter::new();
        w.begin_node("").unwrap();
        w.property_u32("#address-cells", 2).unwrap();
        w.property_u32("#size-cells", 2).unwrap();
        if with_chosen {
            w.begin_node("chosen").unwrap();
            w.property_string("bootargs", "console=ttyS0").unwrap();
            w.property_u64("linux,initrd-start", 0x4800_0000).unwrap();
            w.property_u64("linux,initrd-end", 0x4880_0000).unwrap();
            w.end_node().unwrap();
        }
        w.end_node().unwrap();
        w.finish().unwrap()
    }

    fn chosen_of(blob: &[u8]) -> (Fdt, NodeOffset) {
        let fdt = Fdt::from_blob(blob).unwrap();
        let chosen = fdt.path_offset("/chosen").unwrap();
        (fdt, chosen)
    }

    #[test]
    fn normal_image_without_extras_drops_stale_properties() {
        let gate = EntropyGate::new();
        let blob = build(
            &template(true),
            &DtbPatch::new(ImageKind::Normal),
            &KexecConfig::new(),
            &gate,
            &mut StepRng::new(1, 1),
        )
        .unwrap();
        let (fdt, chosen) = chosen_of(&blob);
        for prop in [PROP_BOOTARGS, PROP_INITRD_START, PROP_INITRD_END, PROP_KASLR_SEED] {
            assert_eq!(fdt.getprop(chosen, prop), Err(FdtError::NotFound));
        }
    }

    #[test]
    fn seed_is_fed_once_entropy_is_ready() {
        let gate = EntropyGate::new();
        gate.mark_ready();
        let blob = build(
            &template(true),
            &DtbPatch::new(ImageKind::Normal),
            &KexecConfig::new(),
            &gate,
            &mut StepRng::new(0x1234, 1),
        )
        .unwrap();
        let (fdt, chosen) = chosen_of(&blob);
        assert_eq!(fdt.getprop_u64(chosen, PROP_KASLR_SEED).unwrap(), 0x1234);
    }

    #[test]
    fn crash_image_carries_core_header_and_usable_range() {
        let region = PhysicalRange::from_start_len(PhysicalAddress::new(0x9000_0000), 0x1000_0000)
            .unwrap();
        let patch = DtbPatch {
            core_header: Some((PhysicalAddress::new(0x9fff_0000), 0x1000)),
            crash_region: Some(region),
            ..DtbPatch::new(ImageKind::Crash)
        };
        let blob = build(
            &template(true),
            &patch,
            &KexecConfig::new(),
            &EntropyGate::new(),
            &mut StepRng::new(0, 0),
        )
        .unwrap();
        let (fdt, chosen) = chosen_of(&blob);

        let reg = fdt.getprop(chosen, PROP_USABLE_MEM_RANGE).unwrap();
        assert_eq!(&reg[..8], &0x9000_0000u64.to_be_bytes());
        assert_eq!(&reg[8..], &0x1000_0000u64.to_be_bytes());
        let hdr = fdt.getprop(chosen, PROP_ELFCOREHDR).unwrap();
        assert_eq!(&hdr[..8], &0x9fff_0000u64.to_be_bytes());
    }

    #[test]
    fn crash_image_needs_its_inputs() {
        let run = |patch: DtbPatch<'_>| {
            build(
                &template(true),
                &patch,
                &KexecConfig::new(),
                &EntropyGate::new(),
                &mut StepRng::new(0, 0),
            )
        };
        assert!(matches!(
            run(DtbPatch::new(ImageKind::Crash)),
            Err(KexecError::NoCoreHeader)
        ));
        assert!(matches!(
            run(DtbPatch {
                core_header: Some((PhysicalAddress::new(0x9fff_0000), 0x1000)),
                ..DtbPatch::new(ImageKind::Crash)
            }),
            Err(KexecError::NoCrashRegion)
        ));
    }

    #[test]
    fn missing_chosen_is_invalid() {
        assert!(matches!(
            build(
                &template(false),
                &DtbPatch::new(ImageKind::Normal),
                &KexecConfig::new(),
                &EntropyGate::new(),
                &mut StepRng::new(0, 0),
            ),
            Err(KexecError::NoChosenNode)
        ));
    }

    #[test]
    fn regrowth_is_bounded() {
        let long: alloc::string::String = "x".repeat(64);
        let patch = DtbPatch {
            cmdline: Some(long.as_str()),
            initrd: Some((PhysicalAddress::new(0x4800_0000), 0x10_0000)),
            ..DtbPatch::new(ImageKind::Normal)
        };
        let tight = KexecConfig::new()
            .with_dtb_extra_space(0)
            .with_max_dtb_regrowths(3);

        // no slack at all: every attempt is the same size and fails
        let template = {
            let mut w = FdtWriter::new();
            w.begin_node("").unwrap();
            w.begin_node("chosen").unwrap();
            w.end_node().unwrap();
            w.end_node().unwrap();
            w.finish().unwrap()
        };
        assert!(matches!(
            build(&template, &patch, &tight, &EntropyGate::new(), &mut StepRng::new(0, 0)),
            Err(KexecError::DeviceTreeExhausted(4))
        ));

        let roomy = KexecConfig::new().with_dtb_extra_space(0x40);
        assert!(build(&template, &patch, &roomy, &EntropyGate::new(), &mut StepRng::new(0, 0)).is_ok());
    }
}
