//! # Sequential Blob Writer

extern crate alloc;

use crate::FdtError;
use crate::header::{
    FDT_BEGIN_NODE, FDT_END, FDT_END_NODE, FDT_LAST_COMP_VERSION, FDT_MAGIC, FDT_PROP,
    FDT_VERSION, FdtHeader, HEADER_SIZE, RSV_ENTRY_SIZE, tag_align,
};
use alloc::vec::Vec;

/// Builds a blob front to back: nodes are opened and closed in order and
/// each node's properties come before its children.
///
/// ```rust
/// # use kernel_fdt::*;
/// let mut w = FdtWriter::new();
/// w.begin_node("")?;
/// w.begin_node("chosen")?;
/// w.property_string("bootargs", "console=ttyAMA0")?;
/// w.end_node()?;
/// w.end_node()?;
/// let blob = w.finish()?;
///
/// let fdt = Fdt::from_blob(&blob)?;
/// let chosen = fdt.path_offset("/chosen")?;
/// assert_eq!(fdt.getprop_str(chosen, "bootargs")?, "console=ttyAMA0");
/// # Ok::<(), FdtError>(())
/// ```
#[derive(Debug, Default)]
pub struct FdtWriter {
    reservations: Vec<(u64, u64)>,
    structure: Vec<u8>,
    strings: Vec<u8>,
    depth: usize,
    props_closed: bool,
    root_done: bool,
    boot_cpuid_phys: u32,
}

impl FdtWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn set_boot_cpuid(&mut self, cpu: u32) {
        self.boot_cpuid_phys = cpu;
    }

    pub fn add_reservation(&mut self, address: u64, size: u64) {
        self.reservations.push((address, size));
    }

    /// Open a node. The root node is named `""`.
    pub fn begin_node(&mut self, name: &str) -> Result<(), FdtError> {
        if name.as_bytes().contains(&0) {
            return Err(FdtError::BadValue);
        }
        if self.root_done || (self.depth == 0 && !name.is_empty()) {
            return Err(FdtError::BadStructure);
        }
        self.push_u32(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
        self.depth += 1;
        self.props_closed = false;
        Ok(())
    }

    pub fn end_node(&mut self) -> Result<(), FdtError> {
        self.depth = self.depth.checked_sub(1).ok_or(FdtError::BadStructure)?;
        self.push_u32(FDT_END_NODE);
        self.props_closed = true;
        if self.depth == 0 {
            self.root_done = true;
        }
        Ok(())
    }

    pub fn property(&mut self, name: &str, value: &[u8]) -> Result<(), FdtError> {
        if self.depth == 0 || self.props_closed {
            return Err(FdtError::BadStructure);
        }
        let len = u32::try_from(value.len()).map_err(|_| FdtError::BadValue)?;
        let nameoff = self.intern(name)?;
        self.push_u32(FDT_PROP);
        self.push_u32(len);
        self.push_u32(nameoff);
        self.structure.extend_from_slice(value);
        self.pad();
        Ok(())
    }

    pub fn property_u32(&mut self, name: &str, v: u32) -> Result<(), FdtError> {
        self.property(name, &v.to_be_bytes())
    }

    pub fn property_u64(&mut self, name: &str, v: u64) -> Result<(), FdtError> {
        self.property(name, &v.to_be_bytes())
    }

    pub fn property_string(&mut self, name: &str, v: &str) -> Result<(), FdtError> {
        let mut bytes = Vec::with_capacity(v.len() + 1);
        bytes.extend_from_slice(v.as_bytes());
        bytes.push(0);
        self.property(name, &bytes)
    }

    /// A list of big-endian cells, as used by `reg` and `ranges`.
    pub fn property_cells(&mut self, name: &str, cells: &[u32]) -> Result<(), FdtError> {
        let bytes: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.property(name, &bytes)
    }

    /// Assemble the blob. Fails unless exactly one root node was written and closed.
    pub fn finish(mut self) -> Result<Vec<u8>, FdtError> {
        if !self.root_done || self.depth != 0 {
            return Err(FdtError::BadStructure);
        }
        self.push_u32(FDT_END);

        let rsv_len = (self.reservations.len() + 1) * RSV_ENTRY_SIZE;
        let struct_off = HEADER_SIZE + rsv_len;
        let strings_off = struct_off + self.structure.len();
        let total = strings_off + self.strings.len();
        let to_u32 = |v: usize| u32::try_from(v).map_err(|_| FdtError::BadLayout);

        let mut out = Vec::with_capacity(total);
        out.resize(HEADER_SIZE, 0);
        FdtHeader {
            magic: FDT_MAGIC,
            totalsize: to_u32(total)?,
            off_dt_struct: to_u32(struct_off)?,
            off_dt_strings: to_u32(strings_off)?,
            off_mem_rsvmap: to_u32(HEADER_SIZE)?,
            version: FDT_VERSION,
            last_comp_version: FDT_LAST_COMP_VERSION,
            boot_cpuid_phys: self.boot_cpuid_phys,
            size_dt_strings: to_u32(self.strings.len())?,
            size_dt_struct: to_u32(self.structure.len())?,
        }
        .write_to(&mut out);

        for (address, size) in self.reservations.iter().copied().chain([(0, 0)]) {
            out.extend_from_slice(&address.to_be_bytes());
            out.extend_from_slice(&size.to_be_bytes());
        }
        out.extend_from_slice(&self.structure);
        out.extend_from_slice(&self.strings);
        Ok(out)
    }

    fn intern(&mut self, name: &str) -> Result<u32, FdtError> {
        if name.is_empty() || name.as_bytes().contains(&0) {
            return Err(FdtError::BadValue);
        }
        let mut off = 0;
        for s in self.strings.split(|&b| b == 0) {
            if s == name.as_bytes() {
                return u32::try_from(off).map_err(|_| FdtError::BadLayout);
            }
            off += s.len() + 1;
        }
        let off = self.strings.len();
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        u32::try_from(off).map_err(|_| FdtError::BadLayout)
    }

    fn push_u32(&mut self, v: u32) {
        self.structure.extend_from_slice(&v.to_be_bytes());
    }

    fn pad(&mut self) {
        let len = tag_align(self.structure.len());
        self.structure.resize(len, 0);
    }
}
