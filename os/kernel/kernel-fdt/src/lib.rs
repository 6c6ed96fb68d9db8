//! # Flattened Device Tree Blobs
//!
//! A small library for the device-tree edits a kexec loader performs on a
//! copy of the boot blob: resolve a node by path, read, set and delete
//! properties, encode `reg` pairs according to the root node's cell sizes,
//! and pack the result.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Fdt`] | A blob in a fixed-capacity working buffer, edited in place. |
//! | [`NodeOffset`] | Handle of a node inside the structure block. |
//! | [`FdtWriter`] | Front-to-back builder for fresh blobs. |
//! | [`FdtHeader`] | Parsed view of the 40-byte header. |
//! | [`FdtError`] | The fixed error set every operation reports. |
//!
//! Edits never reallocate: a working buffer that is too small reports
//! [`FdtError::NoSpace`] and the caller decides whether to retry with a
//! larger one.
//!
//! ```rust
//! # use kernel_fdt::*;
//! # let mut w = FdtWriter::new();
//! # w.begin_node("")?; w.begin_node("chosen")?; w.end_node()?; w.end_node()?;
//! # let template = w.finish()?;
//! let mut fdt = Fdt::open_into(&template, template.len() + 0x1000)?;
//! let chosen = fdt.path_offset("/chosen")?;
//! fdt.setprop_string(chosen, "bootargs", "console=ttyAMA0")?;
//! match fdt.delprop(chosen, "kaslr-seed") {
//!     Ok(()) | Err(FdtError::NotFound) => {}
//!     Err(e) => return Err(e),
//! }
//! fdt.pack();
//! assert_eq!(fdt.capacity(), fdt.totalsize());
//! # Ok::<(), FdtError>(())
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod error;
mod header;
mod tree;
mod writer;

pub use error::FdtError;
pub use header::{FDT_LAST_COMP_VERSION, FDT_MAGIC, FDT_VERSION, FdtHeader, HEADER_SIZE};
pub use tree::{DEFAULT_ADDRESS_CELLS, DEFAULT_SIZE_CELLS, Fdt, MemoryReservation, NodeOffset};
pub use writer::FdtWriter;
