//! Bounds-checked, position-tracked byte buffers.
//!
//! A [`Buffer`] stages data between the application and a channel. It
//! tracks three indices, `position <= limit <= capacity`, and every
//! relative access moves `position` forward. Buffers either own their
//! bytes or are non-owning views over a [`MappedRegion`](crate::mmap::MappedRegion).
//!
//! The [`scatter`] helpers apply one logical transfer across an ordered
//! sequence of buffers.

mod byte_buffer;
pub mod scatter;

pub use byte_buffer::Buffer;
pub use scatter::remaining_total;

/// Byte order used by the typed accessors of a [`Buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Most significant byte first (network order).
    #[default]
    BigEndian,

    /// Least significant byte first.
    LittleEndian,
}

impl ByteOrder {
    /// The byte order of the host CPU.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::BigEndian
        } else {
            Self::LittleEndian
        }
    }
}
