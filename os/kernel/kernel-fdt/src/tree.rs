//! # Editable Blob

extern crate alloc;

use crate::FdtError;
use crate::header::{
    FDT_BEGIN_NODE, FDT_END, FDT_END_NODE, FDT_LAST_COMP_VERSION, FDT_MAGIC, FDT_NOP, FDT_PROP,
    FDT_VERSION, FdtHeader, HEADER_SIZE, RSV_ENTRY_SIZE, be32, be64, put_be32, tag_align,
};
use alloc::vec;
use alloc::vec::Vec;

/// `#address-cells` assumed when a node does not declare it.
pub const DEFAULT_ADDRESS_CELLS: u32 = 2;

/// `#size-cells` assumed when a node does not declare it.
pub const DEFAULT_SIZE_CELLS: u32 = 1;

const MAX_NCELLS: u32 = 4;

/// Offset of a node's `FDT_BEGIN_NODE` tag inside the structure block.
///
/// Inserting or deleting properties invalidates the offsets of nodes that
/// follow the edited node, never the edited node itself.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeOffset(usize);

impl NodeOffset {
    /// The root node is always the first tag of the structure block.
    pub const ROOT: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

/// One entry of the memory reservation map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryReservation {
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Tag {
    BeginNode,
    EndNode,
    Prop,
    Nop,
    End,
}

/// A flattened device tree held in a fixed-capacity working buffer.
///
/// The blob is always kept in canonical order: header, memory reservation
/// map, structure block, strings block, then free space up to the buffer
/// capacity. Edits splice the structure block in place and append to the
/// strings block; an edit that does not fit fails with [`FdtError::NoSpace`]
/// and leaves the blob unchanged.
#[derive(Clone)]
pub struct Fdt {
    buf: Vec<u8>,
}

impl Fdt {
    /// Copy `template` into a fresh working buffer of `bufsize` bytes.
    ///
    /// The blocks are laid out anew in canonical order so the free space sits
    /// at the end. Fails with [`FdtError::NoSpace`] if the template does not
    /// fit.
    pub fn open_into(template: &[u8], bufsize: usize) -> Result<Self, FdtError> {
        let h = FdtHeader::parse(template)?;
        let rsv_len = h.rsvmap_len(template)?;

        let rsv_off = HEADER_SIZE;
        let struct_off = rsv_off + rsv_len;
        let struct_len = h.size_dt_struct as usize;
        let strings_off = struct_off + struct_len;
        let strings_len = h.size_dt_strings as usize;
        let total = strings_off + strings_len;
        if total > bufsize {
            return Err(FdtError::NoSpace);
        }

        let mut buf = vec![0u8; bufsize];
        let copy = |buf: &mut [u8], to: usize, from: usize, len: usize| {
            buf[to..to + len].copy_from_slice(&template[from..from + len]);
        };
        copy(&mut buf, rsv_off, h.off_mem_rsvmap as usize, rsv_len);
        copy(&mut buf, struct_off, h.off_dt_struct as usize, struct_len);
        copy(&mut buf, strings_off, h.off_dt_strings as usize, strings_len);

        let to_u32 = |v: usize| u32::try_from(v).map_err(|_| FdtError::BadLayout);
        FdtHeader {
            magic: FDT_MAGIC,
            totalsize: to_u32(total)?,
            off_dt_struct: to_u32(struct_off)?,
            off_dt_strings: to_u32(strings_off)?,
            off_mem_rsvmap: to_u32(rsv_off)?,
            version: FDT_VERSION,
            last_comp_version: FDT_LAST_COMP_VERSION,
            boot_cpuid_phys: h.boot_cpuid_phys,
            size_dt_strings: h.size_dt_strings,
            size_dt_struct: h.size_dt_struct,
        }
        .write_to(&mut buf);

        let fdt = Self { buf };
        fdt.check_structure()?;
        Ok(fdt)
    }

    /// Open a standalone blob, sized exactly to its own `totalsize`.
    pub fn from_blob(blob: &[u8]) -> Result<Self, FdtError> {
        let h = FdtHeader::parse(blob)?;
        Self::open_into(blob, h.totalsize as usize)
    }

    /// Bytes in use by the blob.
    #[must_use]
    pub fn totalsize(&self) -> usize {
        self.header_field(1)
    }

    /// Size of the working buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.totalsize()]
    }

    /// Consume the tree, returning exactly `totalsize` bytes.
    #[must_use]
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.pack();
        self.buf
    }

    /// Shrink the working buffer to the blob's minimum size.
    pub fn pack(&mut self) {
        let total = self.totalsize();
        self.buf.truncate(total);
        self.buf.shrink_to_fit();
    }

    /// Entries of the memory reservation map, terminator excluded.
    pub fn reservations(&self) -> impl Iterator<Item = MemoryReservation> + '_ {
        let start = self.header_field(4);
        let end = self.header_field(2);
        self.buf[start..end]
            .chunks_exact(RSV_ENTRY_SIZE)
            .filter_map(|c| {
                let address = be64(c, 0).ok()?;
                let size = be64(c, 8).ok()?;
                Some(MemoryReservation { address, size })
            })
            .take_while(|r| r.address != 0 || r.size != 0)
    }

    /// Resolve an absolute node path such as `/chosen` or `/memory@80000000`.
    ///
    /// A path component without a unit address also matches a node that
    /// carries one (`/memory` finds `memory@80000000`).
    pub fn path_offset(&self, path: &str) -> Result<NodeOffset, FdtError> {
        let rest = path.strip_prefix('/').ok_or(FdtError::BadPath)?;
        let mut node = NodeOffset::ROOT;
        for component in rest.split('/').filter(|c| !c.is_empty()) {
            node = self.subnode_offset(node, component)?;
        }
        Ok(node)
    }

    /// Find the direct child of `parent` named `name`.
    pub fn subnode_offset(&self, parent: NodeOffset, name: &str) -> Result<NodeOffset, FdtError> {
        let mut off = self.node_body(parent)?;
        let mut depth = 0usize;
        loop {
            let (tag, next) = self.next_tag(off)?;
            match tag {
                Tag::BeginNode => {
                    if depth == 0 && name_matches(self.raw_node_name(off)?, name.as_bytes()) {
                        return Ok(NodeOffset(off));
                    }
                    depth += 1;
                }
                Tag::EndNode => {
                    if depth == 0 {
                        return Err(FdtError::NotFound);
                    }
                    depth -= 1;
                }
                Tag::Prop | Tag::Nop => {}
                Tag::End => return Err(FdtError::BadStructure),
            }
            off = next;
        }
    }

    /// Name of the node, including any unit address. The root is `""`.
    pub fn node_name(&self, node: NodeOffset) -> Result<&str, FdtError> {
        self.check_node(node)?;
        core::str::from_utf8(self.raw_node_name(node.0)?).map_err(|_| FdtError::BadStructure)
    }

    /// Raw value of property `name` on `node`.
    pub fn getprop(&self, node: NodeOffset, name: &str) -> Result<&[u8], FdtError> {
        let off = self.find_property(node, name)?;
        let (start, len) = self.prop_value_span(off)?;
        Ok(&self.buf[start..start + len])
    }

    pub fn getprop_u32(&self, node: NodeOffset, name: &str) -> Result<u32, FdtError> {
        let v = self.getprop(node, name)?;
        if v.len() != 4 {
            return Err(FdtError::BadValue);
        }
        be32(v, 0)
    }

    pub fn getprop_u64(&self, node: NodeOffset, name: &str) -> Result<u64, FdtError> {
        let v = self.getprop(node, name)?;
        if v.len() != 8 {
            return Err(FdtError::BadValue);
        }
        be64(v, 0)
    }

    /// A NUL-terminated string property, without the terminator.
    pub fn getprop_str(&self, node: NodeOffset, name: &str) -> Result<&str, FdtError> {
        let v = self.getprop(node, name)?;
        let (last, body) = v.split_last().ok_or(FdtError::BadValue)?;
        if *last != 0 {
            return Err(FdtError::BadValue);
        }
        core::str::from_utf8(body).map_err(|_| FdtError::BadValue)
    }

    /// Set property `name` on `node`, creating it if necessary.
    ///
    /// New properties are inserted directly after the node name.
    pub fn setprop(&mut self, node: NodeOffset, name: &str, value: &[u8]) -> Result<(), FdtError> {
        let len = u32::try_from(value.len()).map_err(|_| FdtError::BadValue)?;
        let padded = tag_align(value.len());

        match self.find_property(node, name) {
            Ok(off) => {
                let (start, old_len) = self.prop_value_span(off)?;
                let rel = start - self.struct_off();
                self.splice_struct(rel, tag_align(old_len), padded)?;
                let struct_off = self.struct_off();
                put_be32(&mut self.buf, struct_off + off + 4, len);
                self.write_value(start, value, padded);
                Ok(())
            }
            Err(FdtError::NotFound) => {
                let body = self.node_body(node)?;
                let string_cost = if self.find_string(name).is_some() {
                    0
                } else {
                    name.len() + 1
                };
                if self.totalsize() + string_cost + 12 + padded > self.capacity() {
                    return Err(FdtError::NoSpace);
                }

                let nameoff = self.add_string(name)?;
                self.splice_struct(body, 0, 12 + padded)?;
                let at = self.struct_off() + body;
                put_be32(&mut self.buf, at, FDT_PROP);
                put_be32(&mut self.buf, at + 4, len);
                put_be32(&mut self.buf, at + 8, nameoff);
                self.write_value(at + 12, value, padded);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn setprop_u32(&mut self, node: NodeOffset, name: &str, v: u32) -> Result<(), FdtError> {
        self.setprop(node, name, &v.to_be_bytes())
    }

    pub fn setprop_u64(&mut self, node: NodeOffset, name: &str, v: u64) -> Result<(), FdtError> {
        self.setprop(node, name, &v.to_be_bytes())
    }

    /// Store `v` with a trailing NUL.
    pub fn setprop_string(&mut self, node: NodeOffset, name: &str, v: &str) -> Result<(), FdtError> {
        if v.as_bytes().contains(&0) {
            return Err(FdtError::BadValue);
        }
        let mut bytes = Vec::with_capacity(v.len() + 1);
        bytes.extend_from_slice(v.as_bytes());
        bytes.push(0);
        self.setprop(node, name, &bytes)
    }

    /// Store an `(address, size)` pair encoded with the root node's
    /// `#address-cells` and `#size-cells`.
    ///
    /// Only one- and two-cell encodings are supported. With a single address
    /// cell both `address` and `address + size` must fit in 32 bits; with a
    /// single size cell `size` must.
    pub fn setprop_reg(
        &mut self,
        node: NodeOffset,
        name: &str,
        address: u64,
        size: u64,
    ) -> Result<(), FdtError> {
        let addr_cells = self.address_cells(NodeOffset::ROOT)?;
        let size_cells = self.size_cells(NodeOffset::ROOT)?;
        if addr_cells > 2 || size_cells > 2 {
            return Err(FdtError::BadNCells);
        }

        let narrow = u64::from(u32::MAX);
        if addr_cells == 1 && (address > narrow || address.saturating_add(size) > narrow) {
            return Err(FdtError::BadValue);
        }
        if size_cells == 1 && size > narrow {
            return Err(FdtError::BadValue);
        }

        let mut value = Vec::with_capacity(((addr_cells + size_cells) * 4) as usize);
        push_cells(&mut value, address, addr_cells);
        push_cells(&mut value, size, size_cells);
        self.setprop(node, name, &value)
    }

    /// Remove property `name` from `node`.
    pub fn delprop(&mut self, node: NodeOffset, name: &str) -> Result<(), FdtError> {
        let off = self.find_property(node, name)?;
        let (_, len) = self.prop_value_span(off)?;
        self.splice_struct(off, 12 + tag_align(len), 0)
    }

    /// `#address-cells` of `node`, or [`DEFAULT_ADDRESS_CELLS`].
    pub fn address_cells(&self, node: NodeOffset) -> Result<u32, FdtError> {
        let n = self.cells(node, "#address-cells", DEFAULT_ADDRESS_CELLS)?;
        if n == 0 {
            return Err(FdtError::BadNCells);
        }
        Ok(n)
    }

    /// `#size-cells` of `node`, or [`DEFAULT_SIZE_CELLS`].
    pub fn size_cells(&self, node: NodeOffset) -> Result<u32, FdtError> {
        self.cells(node, "#size-cells", DEFAULT_SIZE_CELLS)
    }

    fn cells(&self, node: NodeOffset, name: &str, default: u32) -> Result<u32, FdtError> {
        match self.getprop(node, name) {
            Ok(v) if v.len() == 4 => {
                let n = be32(v, 0)?;
                if n > MAX_NCELLS {
                    return Err(FdtError::BadNCells);
                }
                Ok(n)
            }
            Ok(_) => Err(FdtError::BadNCells),
            Err(FdtError::NotFound) => Ok(default),
            Err(e) => Err(e),
        }
    }

    fn header_field(&self, index: usize) -> usize {
        let raw = &self.buf[index * 4..index * 4 + 4];
        u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
    }

    fn set_header_field(&mut self, index: usize, v: usize) -> Result<(), FdtError> {
        let v = u32::try_from(v).map_err(|_| FdtError::NoSpace)?;
        put_be32(&mut self.buf, index * 4, v);
        Ok(())
    }

    fn struct_off(&self) -> usize {
        self.header_field(2)
    }

    fn strings_off(&self) -> usize {
        self.header_field(3)
    }

    fn structure(&self) -> &[u8] {
        let off = self.struct_off();
        &self.buf[off..off + self.header_field(9)]
    }

    fn strings(&self) -> &[u8] {
        let off = self.strings_off();
        &self.buf[off..off + self.header_field(8)]
    }

    fn next_tag(&self, off: usize) -> Result<(Tag, usize), FdtError> {
        let s = self.structure();
        let tag = be32(s, off)?;
        match tag {
            FDT_BEGIN_NODE => {
                let name = s.get(off + 4..).ok_or(FdtError::Truncated)?;
                let nul = name.iter().position(|&b| b == 0).ok_or(FdtError::Truncated)?;
                let next = tag_align(off + 4 + nul + 1);
                if next > s.len() {
                    return Err(FdtError::Truncated);
                }
                Ok((Tag::BeginNode, next))
            }
            FDT_PROP => {
                let len = be32(s, off + 4)? as usize;
                let next = tag_align(off + 12 + len);
                if next > s.len() {
                    return Err(FdtError::Truncated);
                }
                Ok((Tag::Prop, next))
            }
            FDT_END_NODE => Ok((Tag::EndNode, off + 4)),
            FDT_NOP => Ok((Tag::Nop, off + 4)),
            FDT_END => Ok((Tag::End, off + 4)),
            _ => Err(FdtError::BadStructure),
        }
    }

    /// Walk the whole structure block once: a single root node, balanced
    /// nesting, properties before subnodes, terminated by `FDT_END`.
    fn check_structure(&self) -> Result<(), FdtError> {
        let (first, mut off) = self.next_tag(0)?;
        if first != Tag::BeginNode {
            return Err(FdtError::BadStructure);
        }
        let mut depth = 1usize;
        let mut props_closed = false;
        loop {
            let (tag, next) = self.next_tag(off)?;
            match tag {
                Tag::BeginNode => {
                    if depth == 0 {
                        return Err(FdtError::BadStructure);
                    }
                    depth += 1;
                    props_closed = false;
                }
                Tag::EndNode => {
                    depth = depth.checked_sub(1).ok_or(FdtError::BadStructure)?;
                    props_closed = true;
                }
                Tag::Prop => {
                    if depth == 0 || props_closed {
                        return Err(FdtError::BadStructure);
                    }
                    self.string_at(be32(self.structure(), off + 8)? as usize)?;
                }
                Tag::Nop => {}
                Tag::End => {
                    return if depth == 0 {
                        Ok(())
                    } else {
                        Err(FdtError::BadStructure)
                    };
                }
            }
            off = next;
        }
    }

    fn check_node(&self, node: NodeOffset) -> Result<(), FdtError> {
        match self.next_tag(node.0) {
            Ok((Tag::BeginNode, _)) => Ok(()),
            Ok(_) | Err(FdtError::Truncated) => Err(FdtError::BadOffset),
            Err(e) => Err(e),
        }
    }

    /// Offset of the first tag after the node's name.
    fn node_body(&self, node: NodeOffset) -> Result<usize, FdtError> {
        self.check_node(node)?;
        self.next_tag(node.0).map(|(_, next)| next)
    }

    fn raw_node_name(&self, off: usize) -> Result<&[u8], FdtError> {
        let s = self.structure();
        let name = s.get(off + 4..).ok_or(FdtError::Truncated)?;
        let nul = name.iter().position(|&b| b == 0).ok_or(FdtError::Truncated)?;
        Ok(&name[..nul])
    }

    fn string_at(&self, nameoff: usize) -> Result<&[u8], FdtError> {
        let tail = self.strings().get(nameoff..).ok_or(FdtError::BadStructure)?;
        let nul = tail.iter().position(|&b| b == 0).ok_or(FdtError::BadStructure)?;
        Ok(&tail[..nul])
    }

    /// Structure-block offset of the `FDT_PROP` tag for `name`.
    fn find_property(&self, node: NodeOffset, name: &str) -> Result<usize, FdtError> {
        let mut off = self.node_body(node)?;
        loop {
            let (tag, next) = self.next_tag(off)?;
            match tag {
                Tag::Prop => {
                    let nameoff = be32(self.structure(), off + 8)? as usize;
                    if self.string_at(nameoff)? == name.as_bytes() {
                        return Ok(off);
                    }
                }
                Tag::Nop => {}
                _ => return Err(FdtError::NotFound),
            }
            off = next;
        }
    }

    /// Absolute buffer offset and length of the value of the property at `off`.
    fn prop_value_span(&self, off: usize) -> Result<(usize, usize), FdtError> {
        let len = be32(self.structure(), off + 4)? as usize;
        Ok((self.struct_off() + off + 12, len))
    }

    fn find_string(&self, name: &str) -> Option<usize> {
        let needle = name.as_bytes();
        let strings = self.strings();
        strings
            .windows(needle.len() + 1)
            .position(|w| &w[..needle.len()] == needle && w[needle.len()] == 0)
    }

    fn add_string(&mut self, name: &str) -> Result<u32, FdtError> {
        if let Some(off) = self.find_string(name) {
            return u32::try_from(off).map_err(|_| FdtError::BadLayout);
        }

        let total = self.totalsize();
        let grow = name.len() + 1;
        if total + grow > self.capacity() {
            return Err(FdtError::NoSpace);
        }
        let off = self.header_field(8);
        self.buf[total..total + name.len()].copy_from_slice(name.as_bytes());
        self.buf[total + name.len()] = 0;
        self.set_header_field(8, off + grow)?;
        self.set_header_field(1, total + grow)?;
        u32::try_from(off).map_err(|_| FdtError::BadLayout)
    }

    /// Replace `old_len` bytes at structure offset `at` with `new_len` bytes,
    /// moving everything behind them. New bytes are left for the caller to fill.
    fn splice_struct(&mut self, at: usize, old_len: usize, new_len: usize) -> Result<(), FdtError> {
        let total = self.totalsize();
        let pos = self.struct_off() + at;
        if total - old_len + new_len > self.capacity() {
            return Err(FdtError::NoSpace);
        }

        self.buf.copy_within(pos + old_len..total, pos + new_len);
        let new_total = total - old_len + new_len;
        if new_total < total {
            self.buf[new_total..total].fill(0);
        }

        let struct_len = self.header_field(9) - old_len + new_len;
        let strings_off = self.strings_off() - old_len + new_len;
        self.set_header_field(9, struct_len)?;
        self.set_header_field(3, strings_off)?;
        self.set_header_field(1, new_total)
    }

    fn write_value(&mut self, at: usize, value: &[u8], padded: usize) {
        self.buf[at..at + value.len()].copy_from_slice(value);
        self.buf[at + value.len()..at + padded].fill(0);
    }
}

impl core::fmt::Debug for Fdt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fdt")
            .field("totalsize", &self.totalsize())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

fn name_matches(node: &[u8], wanted: &[u8]) -> bool {
    if node == wanted {
        return true;
    }
    !wanted.contains(&b'@')
        && node.len() > wanted.len()
        && node.starts_with(wanted)
        && node[wanted.len()] == b'@'
}

/// Big-endian cells, most significant first. `cells` is at most 2.
#[allow(clippy::cast_possible_truncation)]
fn push_cells(out: &mut Vec<u8>, v: u64, cells: u32) {
    for i in (0..cells).rev() {
        let word = (v >> (32 * i)) as u32;
        out.extend_from_slice(&word.to_be_bytes());
    }
}
