/// Failures reported by the blob operations.
///
/// The variants mirror the small fixed error set callers are expected to
/// triage: [`FdtError::NoSpace`] means "retry with a larger buffer",
/// [`FdtError::NotFound`] is routinely ignored on deletes and everything
/// else is fatal.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FdtError {
    #[error("node or property not found")]
    NotFound,
    #[error("not enough free space in the working buffer")]
    NoSpace,
    #[error("offset does not point at a node")]
    BadOffset,
    #[error("malformed node path")]
    BadPath,
    #[error("blob ends before the structure it describes")]
    Truncated,
    #[error("missing device tree magic")]
    BadMagic,
    #[error("unsupported blob version")]
    BadVersion,
    #[error("malformed structure block")]
    BadStructure,
    #[error("block offsets or sizes are inconsistent")]
    BadLayout,
    #[error("value cannot be represented in the requested encoding")]
    BadValue,
    #[error("invalid #address-cells or #size-cells")]
    BadNCells,
}
