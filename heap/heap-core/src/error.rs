//! Error taxonomy of the heap engine.

/// Failure modes of the public heap operations.
///
/// Apart from [`AllocationFailed`](Self::AllocationFailed) and
/// [`ReallocFailed`](Self::ReallocFailed), which a caller may want to treat
/// like a null return from `malloc`/`realloc`, every variant indicates a
/// programmer fault or a corrupted region. Recovering from those is not
/// meaningful; callers typically log and halt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    /// No free section can host an allocation of the given (normalized) size.
    #[error("no free section can host an allocation of {0} bytes")]
    AllocationFailed(usize),
    /// A reallocation to the given size could neither extend nor relocate.
    #[error("reallocation to {0} bytes could neither extend nor relocate")]
    ReallocFailed(usize),
    /// The pointer passed to `free` lies outside the region.
    #[error("pointer passed to free lies outside the heap region")]
    FreeOutsideRegion,
    /// The pointer passed to `reallocate` lies outside the region.
    #[error("pointer passed to reallocate lies outside the heap region")]
    ReallocOutsideRegion,
    /// The pointer is inside the region but is not a live allocation.
    #[error("pointer passed to free is not a live allocation")]
    FalseFree,
    /// The reallocation target is not a live allocation.
    #[error("pointer passed to reallocate is not a live allocation")]
    FalseRealloc,
    /// The section chain no longer tiles the region, or a section key does
    /// not match its variant.
    #[error("heap section chain is corrupted")]
    Broken,
    /// An operation was attempted before the region was bound via `init`.
    #[error("heap region has not been initialized")]
    Uninitialized,
    /// A `Display` implementation produced a different length on the second
    /// rendering pass of the format helper.
    #[error("formatted output changed length while rendering")]
    FormatFailed,
}
