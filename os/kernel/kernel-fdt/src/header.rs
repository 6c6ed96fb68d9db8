//! # Blob Header

use crate::FdtError;

/// Magic number at the start of every flattened device tree.
pub const FDT_MAGIC: u32 = 0xd00d_feed;

/// Version written by this crate.
pub const FDT_VERSION: u32 = 17;

/// Oldest version a version-17 blob is backwards compatible with.
pub const FDT_LAST_COMP_VERSION: u32 = 16;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 40;

pub(crate) const FDT_BEGIN_NODE: u32 = 0x1;
pub(crate) const FDT_END_NODE: u32 = 0x2;
pub(crate) const FDT_PROP: u32 = 0x3;
pub(crate) const FDT_NOP: u32 = 0x4;
pub(crate) const FDT_END: u32 = 0x9;

/// Size of one memory reservation entry (`address`, `size`, both `u64`).
pub(crate) const RSV_ENTRY_SIZE: usize = 16;

/// Round up to the 4-byte structure block alignment.
#[inline]
pub(crate) const fn tag_align(v: usize) -> usize {
    (v + 3) & !3
}

#[inline]
pub(crate) fn be32(bytes: &[u8], at: usize) -> Result<u32, FdtError> {
    let raw = bytes.get(at..at + 4).ok_or(FdtError::Truncated)?;
    Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

#[inline]
pub(crate) fn be64(bytes: &[u8], at: usize) -> Result<u64, FdtError> {
    let hi = be32(bytes, at)?;
    let lo = be32(bytes, at + 4)?;
    Ok((u64::from(hi) << 32) | u64::from(lo))
}

#[inline]
pub(crate) fn put_be32(bytes: &mut [u8], at: usize, v: u32) {
    bytes[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

/// Parsed copy of the 40-byte big-endian blob header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(clippy::struct_field_names)]
pub struct FdtHeader {
    pub magic: u32,
    pub totalsize: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

impl FdtHeader {
    /// Parse and sanity check the header at the start of `bytes`.
    ///
    /// Only version 17 layouts (which carry `size_dt_struct`) are accepted.
    /// Every block must lie inside `totalsize`, and `totalsize` inside `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, FdtError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FdtError::Truncated);
        }

        let field = |i: usize| be32(bytes, i * 4);
        let header = Self {
            magic: field(0)?,
            totalsize: field(1)?,
            off_dt_struct: field(2)?,
            off_dt_strings: field(3)?,
            off_mem_rsvmap: field(4)?,
            version: field(5)?,
            last_comp_version: field(6)?,
            boot_cpuid_phys: field(7)?,
            size_dt_strings: field(8)?,
            size_dt_struct: field(9)?,
        };

        if header.magic != FDT_MAGIC {
            return Err(FdtError::BadMagic);
        }
        if header.version < FDT_VERSION || header.last_comp_version > FDT_VERSION {
            return Err(FdtError::BadVersion);
        }

        let total = header.totalsize as usize;
        if total > bytes.len() {
            return Err(FdtError::Truncated);
        }
        if total < HEADER_SIZE {
            return Err(FdtError::BadLayout);
        }

        let within = |off: u32, len: u32| {
            (off as usize)
                .checked_add(len as usize)
                .is_some_and(|end| off as usize >= HEADER_SIZE && end <= total)
        };
        if !within(header.off_mem_rsvmap, 0)
            || !within(header.off_dt_struct, header.size_dt_struct)
            || !within(header.off_dt_strings, header.size_dt_strings)
        {
            return Err(FdtError::BadLayout);
        }
        if !header.off_mem_rsvmap.is_multiple_of(8) || !header.off_dt_struct.is_multiple_of(4) {
            return Err(FdtError::BadLayout);
        }

        Ok(header)
    }

    /// Serialize into the first [`HEADER_SIZE`] bytes of `bytes`.
    pub fn write_to(&self, bytes: &mut [u8]) {
        let fields = [
            self.magic,
            self.totalsize,
            self.off_dt_struct,
            self.off_dt_strings,
            self.off_mem_rsvmap,
            self.version,
            self.last_comp_version,
            self.boot_cpuid_phys,
            self.size_dt_strings,
            self.size_dt_struct,
        ];
        for (i, v) in fields.into_iter().enumerate() {
            put_be32(bytes, i * 4, v);
        }
    }

    /// Length of the memory reservation map including its `(0, 0)` terminator.
    pub(crate) fn rsvmap_len(&self, bytes: &[u8]) -> Result<usize, FdtError> {
        let start = self.off_mem_rsvmap as usize;
        let limit = self.totalsize as usize;
        let mut at = start;
        loop {
            if at + RSV_ENTRY_SIZE > limit {
                return Err(FdtError::Truncated);
            }
            let address = be64(bytes, at)?;
            let size = be64(bytes, at + 8)?;
            at += RSV_ENTRY_SIZE;
            if address == 0 && size == 0 {
                return Ok(at - start);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> [u8; 64] {
        let mut b = [0u8; 64];
        FdtHeader {
            magic: FDT_MAGIC,
            totalsize: 64,
            off_dt_struct: 56,
            off_dt_strings: 64,
            off_mem_rsvmap: 40,
            version: 17,
            last_comp_version: 16,
            boot_cpuid_phys: 0,
            size_dt_strings: 0,
            size_dt_struct: 8,
        }
        .write_to(&mut b);
        b
    }

    #[test]
    fn parses_minimal_header() {
        let b = minimal();
        let h = FdtHeader::parse(&b).unwrap();
        assert_eq!(h.totalsize, 64);
        assert_eq!(h.rsvmap_len(&b).unwrap(), 16);
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let mut b = minimal();
        assert_eq!(FdtHeader::parse(&b[..39]), Err(FdtError::Truncated));
        assert_eq!(FdtHeader::parse(&b[..60]), Err(FdtError::Truncated));
        b[0] = 0;
        assert_eq!(FdtHeader::parse(&b), Err(FdtError::BadMagic));
    }

    #[test]
    fn rejects_old_versions_and_bad_layout() {
        let mut b = minimal();
        put_be32(&mut b, 20, 16);
        assert_eq!(FdtHeader::parse(&b), Err(FdtError::BadVersion));

        let mut b = minimal();
        put_be32(&mut b, 36, 64);
        assert_eq!(FdtHeader::parse(&b), Err(FdtError::BadLayout));
    }
}
