//! # kexec File Load and Crash-Dump Hand-off
//!
//! Loads a new arm64 kernel while the current one keeps running and later
//! hands control to it, either on request or after a crash.
//!
//! ## Flow
//!
//! ```text
//!  kernel, initrd, cmdline
//!          │
//!          ▼
//!  loader::load_image ──► image validator   (image)
//!          │            ► segment planner   (planner, hole)
//!          │            ► core header       (crash, elf_core)   crash only
//!          │            ► device tree       (dtb)
//!          ▼
//!  handoff::prepare ──► Kimage::load_segments ──► relocation program
//!          │                                       (relocation)
//!          ▼
//!  handoff::machine_kexec ──► soft restart(control page, head, entry, dtb)
//! ```
//!
//! A crash image is loaded straight into the reserved crash region; the
//! [`CrashGovernor`] owns that region, hides the image from the linear map
//! while it waits, and builds the ELF core header describing the memory
//! the dump kernel should save.
//!
//! ## Seams
//!
//! Everything that touches the machine goes through traits the embedding
//! kernel implements:
//!
//! | Trait | Used for |
//! |-------|----------|
//! | [`BufferAllocator`] | physical placement of segments |
//! | [`PageAllocator`] | list pages, source pages, the control page |
//! | [`PhysicalMemory`] | staging copies and committing the list |
//! | [`CacheMaintenance`] | cleaning to the point of coherency |
//! | [`MemoryProtection`] | unmapping the loaded crash image |
//! | [`HandoffPlatform`] | CPU control on the final path |

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod config;
pub mod crash;
pub mod dtb;
pub mod elf_core;
pub mod entropy;
mod error;
pub mod handoff;
pub mod hole;
pub mod image;
pub mod kimage;
pub mod loader;
pub mod planner;
pub mod platform;
pub mod relocation;
pub mod segment;

#[cfg(test)]
mod testing;

pub use config::{DumpVerbosity, KexecConfig, SecondaryCpuPolicy};
pub use crash::{CrashGovernor, CrashMemoryRanges};
pub use entropy::EntropyGate;
pub use error::{ImageError, KexecError, OutOfMemory, RangeError};
pub use handoff::{HandoffPlatform, HandoffState};
pub use hole::MemoryHoleFinder;
pub use kimage::{ImageKind, Kimage};
pub use loader::{KexecFileOps, LoadContext, LoadRequest};
pub use planner::BufferAllocator;
pub use platform::{CacheMaintenance, MemoryProtection, PageAllocator, PhysicalMemory};
pub use relocation::RelocationProgram;
pub use segment::{Segment, SegmentKind};
