//! Memory-mapped file regions.
//!
//! A [`MappedRegion`] owns one mapping of a file range. Buffers obtained
//! from [`MappedRegion::buffer`] are non-owning views: each access checks
//! that the mapping is still live, so using a view after the region was
//! unmapped (or its channel closed) fails with
//! [`BufferError::Invalidated`](crate::error::BufferError::Invalidated)
//! instead of touching released memory.
//!
//! Flush and unmap are sequential, not atomic: [`MappedRegion::unmap`]
//! flushes first and only releases the mapping when the flush succeeded.
//! Closing the owning channel or dropping the region flushes best-effort
//! and always releases.

mod region;

pub use region::MappedRegion;
pub(crate) use region::{MapShared, MapView};

/// Access mode of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Shared, read-only. Views reject writes.
    ReadOnly,

    /// Shared, writable. Writes reach the file on flush.
    ReadWrite,

    /// Private copy-on-write. Writes never reach the file.
    Private,
}
