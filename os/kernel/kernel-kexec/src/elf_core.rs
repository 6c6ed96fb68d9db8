//! # ELF Core Header
//!
//! The crash kernel finds the memory of the crashed kernel through an
//! `ET_CORE` ELF header placed next to it. The header only describes memory;
//! the notes themselves are filled in by the crashing kernel.

use crate::KexecError;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_info::memory::{PAGE_OFFSET, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_CORE: u16 = 4;
const EM_AARCH64: u16 = 183;
const PT_LOAD: u32 = 1;
const PT_NOTE: u32 = 4;

/// Size of `Elf64_Ehdr`.
pub const EHDR_SIZE: usize = 64;

/// Size of `Elf64_Phdr`.
pub const PHDR_SIZE: usize = 56;

/// `Elf64_Phdr.p_flags` (SVr4): bit0=X, bit1=W, bit2=R.
#[bitfield(u32)]
pub struct SegmentFlags {
    pub execute: bool,
    pub write: bool,
    pub read: bool,
    #[bits(29)]
    __: u32,
}

impl SegmentFlags {
    const fn rwx() -> Self {
        Self::new().with_read(true).with_write(true).with_execute(true)
    }
}

/// A note buffer in the running kernel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CoreNote {
    pub addr: PhysicalAddress,
    pub size: u64,
}

/// Where the running kernel's text lives, for a dedicated `PT_LOAD`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KernelText {
    pub vaddr: u64,
    pub paddr: PhysicalAddress,
    pub size: u64,
}

/// Per-boot facts the core header points at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreSources {
    /// One crash note per present CPU.
    pub cpu_notes: Vec<CoreNote>,
    pub vmcoreinfo: Option<CoreNote>,
    pub kernel_text: Option<KernelText>,
}

#[derive(Copy, Clone)]
#[allow(clippy::struct_field_names)]
struct Ph64 {
    p_type: u32,
    p_flags: SegmentFlags,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

impl Ph64 {
    const fn note(note: CoreNote) -> Self {
        Self {
            p_type: PT_NOTE,
            p_flags: SegmentFlags::new(),
            p_offset: note.addr.as_u64(),
            p_vaddr: 0,
            p_paddr: note.addr.as_u64(),
            p_filesz: note.size,
            p_memsz: note.size,
            p_align: 0,
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.p_type.to_le_bytes());
        out.extend_from_slice(&self.p_flags.into_bits().to_le_bytes());
        out.extend_from_slice(&self.p_offset.to_le_bytes());
        out.extend_from_slice(&self.p_vaddr.to_le_bytes());
        out.extend_from_slice(&self.p_paddr.to_le_bytes());
        out.extend_from_slice(&self.p_filesz.to_le_bytes());
        out.extend_from_slice(&self.p_memsz.to_le_bytes());
        out.extend_from_slice(&self.p_align.to_le_bytes());
    }
}

/// Serialize the core header for `ranges`.
///
/// Program headers are emitted in this order: the CPU notes, the vmcoreinfo
/// note, the kernel text, then one `PT_LOAD` per range. The result is padded
/// with zeroes to a whole page.
///
/// # Errors
/// [`KexecError::Overflow`] if the headers do not fit `e_phnum`.
#[allow(clippy::cast_possible_truncation)]
pub fn build_core_header(
    sources: &CoreSources,
    ranges: &[PhysicalRange],
) -> Result<Vec<u8>, KexecError> {
    let mut phdrs = Vec::with_capacity(sources.cpu_notes.len() + ranges.len() + 2);
    phdrs.extend(sources.cpu_notes.iter().copied().map(Ph64::note));
    phdrs.extend(sources.vmcoreinfo.map(Ph64::note));
    phdrs.extend(sources.kernel_text.map(|text| Ph64 {
        p_type: PT_LOAD,
        p_flags: SegmentFlags::rwx(),
        p_offset: text.paddr.as_u64(),
        p_vaddr: text.vaddr,
        p_paddr: text.paddr.as_u64(),
        p_filesz: text.size,
        p_memsz: text.size,
        p_align: 0,
    }));
    phdrs.extend(ranges.iter().map(|range| Ph64 {
        p_type: PT_LOAD,
        p_flags: SegmentFlags::rwx(),
        p_offset: range.start().as_u64(),
        p_vaddr: PAGE_OFFSET.wrapping_add(range.start().as_u64()),
        p_paddr: range.start().as_u64(),
        p_filesz: range.len(),
        p_memsz: range.len(),
        p_align: 0,
    }));

    let phnum = u16::try_from(phdrs.len()).map_err(|_| KexecError::Overflow)?;
    let len = EHDR_SIZE + phdrs.len() * PHDR_SIZE;
    let mut out = Vec::with_capacity(len.next_multiple_of(PAGE_SIZE as usize));

    let mut ident = [0u8; 16];
    ident[..4].copy_from_slice(b"\x7fELF");
    ident[4] = ELFCLASS64;
    ident[5] = ELFDATA2LSB;
    ident[6] = EV_CURRENT;
    out.extend_from_slice(&ident);
    out.extend_from_slice(&ET_CORE.to_le_bytes());
    out.extend_from_slice(&EM_AARCH64.to_le_bytes());
    out.extend_from_slice(&u32::from(EV_CURRENT).to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    out.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&phnum.to_le_bytes());
    out.extend_from_slice(&[0u8; 6]); // e_shentsize, e_shnum, e_shstrndx
    debug_assert_eq!(out.len(), EHDR_SIZE);

    for ph in &phdrs {
        ph.write_to(&mut out);
    }
    out.resize(len.next_multiple_of(PAGE_SIZE as usize), 0);
    Ok(out)
}
