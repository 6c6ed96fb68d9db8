//! # Hand-off ABI

/// Relocation list word: the page address is the new copy destination.
pub const IND_DESTINATION: u64 = 0x1;

/// Relocation list word: the page address holds the next run of entries.
pub const IND_INDIRECTION: u64 = 0x2;

/// Relocation list word: end of the program.
pub const IND_DONE: u64 = 0x4;

/// Relocation list word: copy one page from this address.
pub const IND_SOURCE: u64 = 0x8;

/// Mask of the flag bits in a relocation list word.
pub const IND_FLAGS: u64 = IND_DESTINATION | IND_INDIRECTION | IND_DONE | IND_SOURCE;

/// Arguments handed to the soft-restart routine.
///
/// The routine turns the MMU off, runs the relocation routine over `head`
/// and jumps to `entry` with `dtb` in `x0`.
/// Keep this `#[repr(C)]`; the field order is the register order.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SoftRestartArgs {
    /// Physical address of the relocation routine in the control page.
    pub reboot_code: u64,

    /// Raw head word of the relocation program.
    pub head: u64,

    /// Physical entry address of the new kernel.
    pub entry: u64,

    /// Physical address of the patched device tree.
    pub dtb: u64,
}

const _: () = {
    assert!(IND_FLAGS == 0xF);
    assert!(size_of::<SoftRestartArgs>() == 32);
};
