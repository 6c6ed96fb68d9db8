mod common;

use common::{BumpAlloc, Board, RAM_LEN, RAM_START, kernel_image, range, virt_dtb};
use kernel_fdt::{Fdt, FdtError};
use kernel_kexec::dtb::{self, DtbPatch, PROP_BOOTARGS, PROP_INITRD_END, PROP_INITRD_START};
use kernel_kexec::elf_core::CoreSources;
use kernel_kexec::image::CpuFeatures;
use kernel_kexec::loader::load_image;
use kernel_kexec::relocation::{self, CommittedList, WalkStep};
use kernel_kexec::{
    CrashGovernor, EntropyGate, ImageKind, KexecConfig, KexecError, Kimage, LoadContext,
    LoadRequest, MemoryHoleFinder, SegmentKind,
};
use rand::rngs::mock::StepRng;

const PAGES_AT: u64 = 0x4600_0000;

fn holes() -> MemoryHoleFinder {
    let mut holes = MemoryHoleFinder::new([range(RAM_START, RAM_LEN)]);
    holes.exclude(range(PAGES_AT, 0x100_0000));
    holes
}

fn load<'a>(
    holes: &mut MemoryHoleFinder,
    template: &[u8],
    entropy: &EntropyGate,
    request: &LoadRequest<'a>,
) -> Result<Kimage<'a>, KexecError> {
    let mut rng = StepRng::new(0x5eed, 1);
    let config = KexecConfig::new();
    let crash = CrashGovernor::new(None);
    let sources = CoreSources::default();
    let mut ctx = LoadContext {
        allocator: holes,
        rng: &mut rng,
        dtb_template: template,
        config: &config,
        entropy,
        crash: &crash,
        live_ranges: &[],
        core_sources: &sources,
        cpu: CpuFeatures::little_endian_all_granules(),
    };
    load_image(ImageKind::Normal, request, &mut ctx)
}

#[test]
fn image_is_in_place_after_relocation() {
    let kernel = kernel_image(0x8_0000, 0x20_0000, 0x3000);
    let initrd = vec![0xa5u8; 0x1800];
    let template = virt_dtb(Some("console=ttyS0"));
    let mut holes = holes();
    let request = LoadRequest::new(&kernel)
        .with_initrd(&initrd)
        .with_cmdline("console=ttyAMA0 root=/dev/vda");
    let mut image = load(&mut holes, &template, &EntropyGate::new(), &request).unwrap();

    let kernel_seg = &image.segments()[0];
    assert_eq!(kernel_seg.kind(), SegmentKind::Kernel);
    assert_eq!(kernel_seg.reserved().start().as_u64(), RAM_START);
    assert_eq!(image.start().as_u64(), RAM_START + 0x8_0000);
    assert_eq!(kernel_seg.memsz(), 0x20_0000);

    let initrd_at = image.segments()[1].mem().as_u64();
    let dtb_at = image.arch().dtb_mem.unwrap().as_u64();
    let dtb_blob = image.dtb_segment().unwrap().buffer().to_vec();
    assert!(dtb_at.is_multiple_of(0x20_0000));
    assert!(dtb_at + dtb_blob.len() as u64 <= RAM_START + RAM_LEN);

    let mut board = Board::default();
    let mut pages = BumpAlloc::new(PAGES_AT, 0x1000);
    image.load_segments(&mut pages, &mut board).unwrap();
    image.post_load_cleanup();
    assert_eq!(image.dtb_segment().unwrap().bufsz(), 0);

    let program = image.program().unwrap();
    program.commit(&mut board).unwrap();
    relocation::apply(program.head(), &mut board).unwrap();

    let start = image.start().as_u64();
    assert_eq!(board.bytes(start, kernel.len()), kernel);
    assert!(board.bytes(start + kernel.len() as u64, 0x100).iter().all(|b| *b == 0));
    assert_eq!(board.bytes(initrd_at, initrd.len()), initrd);
    assert_eq!(board.bytes(dtb_at, dtb_blob.len()), dtb_blob);

    let fdt = Fdt::from_blob(&board.bytes(dtb_at, dtb_blob.len())).unwrap();
    let chosen = fdt.path_offset("/chosen").unwrap();
    assert_eq!(
        fdt.getprop_str(chosen, PROP_BOOTARGS).unwrap(),
        "console=ttyAMA0 root=/dev/vda"
    );
    assert_eq!(fdt.getprop_u64(chosen, PROP_INITRD_START).unwrap(), initrd_at);
    assert_eq!(
        fdt.getprop_u64(chosen, PROP_INITRD_END).unwrap(),
        initrd_at + initrd.len() as u64
    );
}

#[test]
fn committed_list_matches_the_encoded_one() {
    let kernel = kernel_image(0x8_0000, 0x20_0000, 0x5000);
    let template = virt_dtb(None);
    let mut holes = holes();
    let mut image = load(
        &mut holes,
        &template,
        &EntropyGate::new(),
        &LoadRequest::new(&kernel),
    )
    .unwrap();

    let mut board = Board::default();
    let mut pages = BumpAlloc::new(PAGES_AT, 0x1000);
    image.load_segments(&mut pages, &mut board).unwrap();
    let program = image.program().unwrap();
    program.commit(&mut board).unwrap();

    let mut encoded = Vec::new();
    program
        .walk(|step| {
            encoded.push(step);
            Ok(())
        })
        .unwrap();
    let mut committed = Vec::new();
    relocation::walk(program.head(), &CommittedList::new(&board), |step| {
        committed.push(step);
        Ok(())
    })
    .unwrap();

    assert_eq!(encoded, committed);
    assert_eq!(encoded.last(), Some(&WalkStep::Done));
}

#[test]
fn command_line_round_trip() {
    let kernel = kernel_image(0x8_0000, 0x20_0000, 0);

    let template = virt_dtb(None);
    let mut holes = holes();
    let request = LoadRequest::new(&kernel).with_cmdline("quiet");
    let image = load(&mut holes, &template, &EntropyGate::new(), &request).unwrap();
    let fdt = Fdt::from_blob(image.dtb_segment().unwrap().buffer()).unwrap();
    let chosen = fdt.path_offset("/chosen").unwrap();
    assert_eq!(fdt.getprop_str(chosen, PROP_BOOTARGS).unwrap(), "quiet");

    let mut holes = self::holes();
    let image = load(
        &mut holes,
        &template,
        &EntropyGate::new(),
        &LoadRequest::new(&kernel),
    )
    .unwrap();
    let fdt = Fdt::from_blob(image.dtb_segment().unwrap().buffer()).unwrap();
    let chosen = fdt.path_offset("/chosen").unwrap();
    assert_eq!(fdt.getprop(chosen, PROP_BOOTARGS), Err(FdtError::NotFound));
    assert_eq!(fdt.getprop(chosen, PROP_INITRD_START), Err(FdtError::NotFound));
}

#[test]
fn patching_differs_only_in_the_seed() {
    let template = virt_dtb(Some("console=ttyS0"));
    let patch = DtbPatch {
        cmdline: Some("console=ttyAMA0"),
        ..DtbPatch::new(ImageKind::Normal)
    };
    let config = KexecConfig::new();
    let entropy = EntropyGate::new();
    entropy.mark_ready();

    let a = dtb::build(&template, &patch, &config, &entropy, &mut StepRng::new(1, 0)).unwrap();
    let b = dtb::build(&template, &patch, &config, &entropy, &mut StepRng::new(1, 0)).unwrap();
    assert_eq!(a, b);

    let c = dtb::build(&template, &patch, &config, &entropy, &mut StepRng::new(u64::MAX, 0))
        .unwrap();
    assert_eq!(a.len(), c.len());
    let differing: Vec<_> = (0..a.len()).filter(|i| a[*i] != c[*i]).collect();
    assert!(!differing.is_empty());
    assert!(differing.last().unwrap() - differing[0] < 8);
}

#[test]
fn unsupported_images_are_rejected_before_placement() {
    let template = virt_dtb(None);
    let mut holes = holes();

    let mut zero_size = kernel_image(0x8_0000, 0x20_0000, 0);
    zero_size[16..24].fill(0);
    assert!(matches!(
        load(&mut holes, &template, &EntropyGate::new(), &LoadRequest::new(&zero_size)),
        Err(KexecError::Image(_))
    ));
    assert!(matches!(
        load(&mut holes, &template, &EntropyGate::new(), &LoadRequest::new(&[0u8; 63])),
        Err(KexecError::NoLoader)
    ));
    assert_eq!(holes.reserved().len(), 1);
}
