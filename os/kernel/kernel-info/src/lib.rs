//! # Kexec Layout Constants and Hand-off ABI
//!
//! This crate is the single source of truth for the numbers that the image
//! loader, the relocation program and the low-level hand-off routine must
//! agree on. Nothing in here performs work; it only describes layout.
//!
//! ## Architecture
//!
//! ### Memory Layout ([`memory`])
//! Placement constants for the new boot image:
//! * **Page granule**: the base page used by segments and the relocation list
//! * **Kernel alignment**: the 2 MiB window the arm64 boot protocol requires
//! * **Ramdisk window**: the bounded region above the kernel that the new
//!   kernel can reach through its early linear map
//! * **Device tree alignment**: a blob must never cross a 2 MiB boundary
//! * **Linear map base**: used for virtual addresses in the core-dump header
//!
//! ```text
//! Physical placement (bottom-up unless noted):
//!
//!   round_down(kernel, 1 GiB)   ┌─────────────────────────────────┐
//!                               │           ...                   │
//!   kernel reservation (2 MiB)  ├─────────────────────────────────┤
//!                               │  text_offset pad                │
//!   entry address               ├─────────────────────────────────┤
//!                               │  Kernel Image                   │
//!                               ├─────────────────────────────────┤
//!                               │  Ramdisk (page aligned)         │
//!   + INITRD_WINDOW (32 GiB)    ├─────────────────────────────────┤
//!                               │  Device tree (top-down, 2 MiB)  │
//!                               │  Core header (top-down, 64 KiB) │
//!                               └─────────────────────────────────┘
//! ```
//!
//! ### Hand-off ABI ([`boot`])
//! The register arguments of the soft-restart entry and the raw bit values
//! of the relocation list words consumed by the relocation routine.
//!
//! All values are `const` and checked with compile-time assertions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
