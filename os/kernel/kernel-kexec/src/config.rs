//! # Runtime Policy

use kernel_info::memory::DTB_EXTRA_SPACE;

/// What to do when a crash hand-off finds secondary CPUs still online.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum SecondaryCpuPolicy {
    /// Log that the dump may fail and hand off anyway.
    #[default]
    WarnAndProceed,
    /// Refuse the hand-off.
    Abort,
}

/// Detail of the relocation list dump logged before hand-off.
///
/// Indirection, destination and done entries are logged at every level
/// above [`DumpVerbosity::Off`]; the levels only differ for source pages.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DumpVerbosity {
    Off = 0,
    /// Source pages are not listed.
    #[default]
    Entries = 1,
    /// One `S` marker per source page.
    SourceMarks = 2,
    /// Copy destination per source page.
    SourceDestinations = 3,
    /// Source and destination per source page.
    Full = 4,
}

/// Tunables of the loader and the hand-off.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KexecConfig {
    dtb_extra_space: u64,
    max_dtb_regrowths: usize,
    crash_secondary_cpus: SecondaryCpuPolicy,
    list_dump: DumpVerbosity,
}

impl KexecConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dtb_extra_space: DTB_EXTRA_SPACE,
            max_dtb_regrowths: 1,
            crash_secondary_cpus: SecondaryCpuPolicy::WarnAndProceed,
            list_dump: DumpVerbosity::Entries,
        }
    }

    /// Bytes added to the device tree working buffer on top of the template
    /// and command line, and again on every regrowth.
    #[inline]
    #[must_use]
    pub const fn dtb_extra_space(&self) -> u64 {
        self.dtb_extra_space
    }

    /// How often a device tree build that ran out of space is retried.
    #[inline]
    #[must_use]
    pub const fn max_dtb_regrowths(&self) -> usize {
        self.max_dtb_regrowths
    }

    #[inline]
    #[must_use]
    pub const fn crash_secondary_cpus(&self) -> SecondaryCpuPolicy {
        self.crash_secondary_cpus
    }

    #[inline]
    #[must_use]
    pub const fn list_dump(&self) -> DumpVerbosity {
        self.list_dump
    }

    #[must_use]
    pub const fn with_dtb_extra_space(mut self, bytes: u64) -> Self {
        self.dtb_extra_space = bytes;
        self
    }

    #[must_use]
    pub const fn with_max_dtb_regrowths(mut self, n: usize) -> Self {
        self.max_dtb_regrowths = n;
        self
    }

    #[must_use]
    pub const fn with_crash_secondary_cpus(mut self, policy: SecondaryCpuPolicy) -> Self {
        self.crash_secondary_cpus = policy;
        self
    }

    #[must_use]
    pub const fn with_list_dump(mut self, verbosity: DumpVerbosity) -> Self {
        self.list_dump = verbosity;
        self
    }
}

impl Default for KexecConfig {
    fn default() -> Self {
        Self::new()
    }
}
