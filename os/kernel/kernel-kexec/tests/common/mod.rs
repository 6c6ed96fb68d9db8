#![allow(dead_code)]

use kernel_fdt::FdtWriter;
use kernel_info::memory::PAGE_SIZE;
use kernel_kexec::{KexecError, PageAllocator, PhysicalMemory};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, PhysicalRange, Size4K};
use std::collections::BTreeMap;

pub const RAM_START: u64 = 0x4000_0000;
pub const RAM_LEN: u64 = 0x800_0000;

/// Physical memory of a small board, backed page by page on first write.
#[derive(Default)]
pub struct Board {
    frames: BTreeMap<u64, Vec<u8>>,
}

impl Board {
    pub fn bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        self.read(PhysicalAddress::new(addr), &mut out).unwrap();
        out
    }

    fn check(addr: PhysicalAddress, len: usize) -> Result<(), KexecError> {
        let end = addr.as_u64() + len as u64;
        if addr.as_u64() >= RAM_START && end <= RAM_START + RAM_LEN {
            Ok(())
        } else {
            Err(KexecError::PhysicalAccess(addr.as_u64()))
        }
    }
}

impl PhysicalMemory for Board {
    fn read(&self, addr: PhysicalAddress, buf: &mut [u8]) -> Result<(), KexecError> {
        Self::check(addr, buf.len())?;
        for (i, b) in buf.iter_mut().enumerate() {
            let a = addr.as_u64() + i as u64;
            let frame = a & !(PAGE_SIZE - 1);
            *b = self
                .frames
                .get(&frame)
                .map_or(0, |f| f[(a - frame) as usize]);
        }
        Ok(())
    }

    fn write(&mut self, addr: PhysicalAddress, data: &[u8]) -> Result<(), KexecError> {
        Self::check(addr, data.len())?;
        for (i, b) in data.iter().enumerate() {
            let a = addr.as_u64() + i as u64;
            let frame = a & !(PAGE_SIZE - 1);
            self.frames
                .entry(frame)
                .or_insert_with(|| vec![0; PAGE_SIZE as usize])[(a - frame) as usize] = *b;
        }
        Ok(())
    }
}

/// Page allocator handing out a fixed window front to back.
pub struct BumpAlloc {
    next: u64,
    end: u64,
    pub freed: Vec<u64>,
}

impl BumpAlloc {
    pub fn new(start: u64, pages: u64) -> Self {
        Self {
            next: start,
            end: start + pages * PAGE_SIZE,
            freed: Vec::new(),
        }
    }

    pub fn window(&self) -> PhysicalRange {
        PhysicalRange::new(PhysicalAddress::new(self.next), PhysicalAddress::new(self.end - 1))
            .unwrap()
    }
}

impl PageAllocator for BumpAlloc {
    fn alloc_page(&mut self) -> Option<PhysicalPage<Size4K>> {
        (self.next < self.end).then(|| {
            let page = PhysicalPage::from_addr(PhysicalAddress::new(self.next));
            self.next += PAGE_SIZE;
            page
        })
    }

    fn free_page(&mut self, page: PhysicalPage<Size4K>) {
        self.freed.push(page.base().as_u64());
    }
}

pub fn range(start: u64, len: u64) -> PhysicalRange {
    PhysicalRange::from_start_len(PhysicalAddress::new(start), len).unwrap()
}

/// An arm64 `Image` with a valid header followed by `body` bytes of payload.
pub fn kernel_image(text_offset: u64, image_size: u64, body: usize) -> Vec<u8> {
    let mut image = vec![0u8; 64 + body];
    image[0..4].copy_from_slice(&0x1400_0000u32.to_le_bytes());
    image[8..16].copy_from_slice(&text_offset.to_le_bytes());
    image[16..24].copy_from_slice(&image_size.to_le_bytes());
    image[56..60].copy_from_slice(b"ARM\x64");
    for (i, b) in image[64..].iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    image
}

/// The device tree of a `virt` board with an empty `/chosen`.
pub fn virt_dtb(bootargs: Option<&str>) -> Vec<u8> {
    let mut w = FdtWriter::new();
    w.begin_node("").unwrap();
    w.property_string("compatible", "linux,dummy-virt").unwrap();
    w.property_u32("#address-cells", 2).unwrap();
    w.property_u32("#size-cells", 2).unwrap();
    w.begin_node("chosen").unwrap();
    if let Some(args) = bootargs {
        w.property_string("bootargs", args).unwrap();
    }
    w.end_node().unwrap();
    w.begin_node("memory@40000000").unwrap();
    w.property_string("device_type", "memory").unwrap();
    w.property_cells("reg", &[0, 0x4000_0000, 0, 0x800_0000]).unwrap();
    w.end_node().unwrap();
    w.end_node().unwrap();
    w.finish().unwrap()
}

/// Decode a `reg` property with two address and two size cells.
pub fn reg_pair(bytes: &[u8]) -> (u64, u64) {
    let addr = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let size = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
    (addr, size)
}
