use core::fmt;
use core::hash::Hash;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page and alignment granules.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Display + fmt::Debug
{
    /// Granule size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
    /// Short human readable label, e.g. `"4K"`.
    const LABEL: &'static str;

    /// Mask of the in-granule offset bits.
    #[inline]
    #[must_use]
    fn mask() -> u64 {
        Self::SIZE - 1
    }
}

macro_rules! page_size {
    ($(#[$meta:meta])* $name:ident, $shift:literal, $label:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
            const LABEL: &'static str = $label;
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(Self::LABEL)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&self, f)
            }
        }
    };
}

page_size!(
    /// 4 KiB granule, the base page of the relocation list and of page frame numbers.
    Size4K, 12, "4K"
);

page_size!(
    /// 64 KiB granule, the largest translation granule a kernel image may be built for.
    Size64K, 16, "64K"
);

page_size!(
    /// 2 MiB granule, the minimum kernel image alignment and the device tree window.
    Size2M, 21, "2M"
);

page_size!(
    /// 1 GiB granule, used to compute the ramdisk placement window.
    Size1G, 30, "1G"
);
