//! The [`Buffer`] type and its storage.

use std::fmt;
use std::mem::size_of;

use crate::buffer::ByteOrder;
use crate::error::{BufferError, ChannelError};
use crate::mmap::MapView;

/// Backing bytes of a buffer.
enum Storage {
    /// Exclusively owned heap memory.
    Heap(Box<[u8]>),

    /// Non-owning view over a mapped region.
    View(MapView),
}

impl Storage {
    /// Runs `f` over the whole backing region.
    fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, BufferError> {
        match self {
            Self::Heap(bytes) => Ok(f(bytes)),
            Self::View(view) => {
                let guard = view.lock()?;
                Ok(f(&guard))
            }
        }
    }

    /// Runs `f` over the whole backing region for writing.
    fn with_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, BufferError> {
        match self {
            Self::Heap(bytes) => Ok(f(bytes)),
            Self::View(view) => {
                let mut guard = view.lock_mut()?;
                Ok(f(&mut guard))
            }
        }
    }
}

/// A fixed-capacity byte buffer with `position`, `limit` and `mark`.
///
/// Invariant: `mark <= position <= limit <= capacity`. Relative accessors
/// read or write at `position` and advance it; absolute accessors address
/// an index below `limit` and leave `position` alone. A failed access never
/// mutates the buffer.
pub struct Buffer {
    /// Backing bytes.
    storage: Storage,

    /// Fixed size of the backing region.
    capacity: usize,

    /// First index that must not be read or written.
    limit: usize,

    /// Next index to read or write.
    position: usize,

    /// Saved position for `reset`.
    mark: Option<usize>,

    /// Byte order of the typed accessors.
    order: ByteOrder,
}

impl Buffer {
    /// Allocates a zero-filled buffer with the given capacity.
    pub fn allocate(capacity: usize) -> Self {
        Self::from_storage(Storage::Heap(vec![0u8; capacity].into_boxed_slice()), capacity)
    }

    /// Wraps an existing byte vector. The buffer takes ownership; capacity
    /// and limit are the vector's length.
    pub fn wrap(bytes: Vec<u8>) -> Self {
        let capacity = bytes.len();
        Self::from_storage(Storage::Heap(bytes.into_boxed_slice()), capacity)
    }

    /// Creates a non-owning view over a mapped region.
    pub(crate) fn view(view: MapView) -> Self {
        let capacity = view.len();
        Self::from_storage(Storage::View(view), capacity)
    }

    fn from_storage(storage: Storage, capacity: usize) -> Self {
        Self {
            storage,
            capacity,
            limit: capacity,
            position: 0,
            mark: None,
            order: ByteOrder::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of bytes between `position` and `limit`.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    /// Whether this buffer is a view over memory it does not own.
    pub fn is_view(&self) -> bool {
        matches!(self.storage, Storage::View(_))
    }

    /// Whether writes through this buffer are rejected.
    pub fn is_read_only(&self) -> bool {
        match &self.storage {
            Storage::Heap(_) => false,
            Storage::View(view) => view.is_read_only(),
        }
    }

    /// Whether the backing memory is still accessible. Owned buffers are
    /// always valid; views become invalid when their region is unmapped.
    pub fn is_valid(&self) -> bool {
        match &self.storage {
            Storage::Heap(_) => true,
            Storage::View(view) => view.is_valid(),
        }
    }

    /// Moves `position`. A mark beyond the new position is discarded.
    pub fn set_position(&mut self, position: usize) -> Result<(), BufferError> {
        if position > self.limit {
            return Err(BufferError::InvalidPosition {
                position,
                limit: self.limit,
            });
        }
        self.position = position;
        if self.mark.is_some_and(|mark| mark > position) {
            self.mark = None;
        }
        Ok(())
    }

    /// Moves `limit`, pulling `position` and the mark back if needed.
    pub fn set_limit(&mut self, limit: usize) -> Result<(), BufferError> {
        if limit > self.capacity {
            return Err(BufferError::InvalidLimit {
                limit,
                capacity: self.capacity,
            });
        }
        self.limit = limit;
        if self.position > limit {
            self.position = limit;
        }
        if self.mark.is_some_and(|mark| mark > limit) {
            self.mark = None;
        }
        Ok(())
    }

    /// Switches from filling to draining: `limit = position`, `position = 0`.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
        self.mark = None;
    }

    /// Prepares for filling: `position = 0`, `limit = capacity`. Contents
    /// are left as they are.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity;
        self.mark = None;
    }

    /// Re-reads from the start: `position = 0`, `limit` unchanged.
    pub fn rewind(&mut self) {
        self.position = 0;
        self.mark = None;
    }

    /// Moves the unread bytes `[position, limit)` to the front and prepares
    /// for filling after them.
    ///
    /// Never fails. On an invalidated or read-only view the indices are
    /// updated but no bytes are moved.
    pub fn compact(&mut self) {
        let remaining = self.remaining();
        let (start, end) = (self.position, self.limit);

        if remaining > 0 && start > 0 && !self.is_read_only() {
            // An invalidated view has nothing left to move
            let _ = self
                .storage
                .with_mut(|bytes| bytes.copy_within(start..end, 0));
        }

        self.position = remaining;
        self.limit = self.capacity;
        self.mark = None;
    }

    /// Saves the current position.
    pub fn mark(&mut self) {
        self.mark = Some(self.position);
    }

    /// Restores the position saved by [`mark`](Self::mark).
    pub fn reset(&mut self) -> Result<(), BufferError> {
        let mark = self.mark.ok_or(BufferError::InvalidMark)?;
        self.position = mark;
        Ok(())
    }

    /// Copies `src` at the position and advances past it.
    pub fn put_slice(&mut self, src: &[u8]) -> Result<(), BufferError> {
        let start = self.check_relative(src.len())?;
        self.write_range(start, src)?;
        self.position += src.len();
        Ok(())
    }

    /// Fills `dst` from the position and advances past it.
    pub fn get_slice(&mut self, dst: &mut [u8]) -> Result<(), BufferError> {
        let start = self.check_relative(dst.len())?;
        self.read_range(start, dst)?;
        self.position += dst.len();
        Ok(())
    }

    /// Copies `src` to `index` without moving the position.
    pub fn put_slice_at(&mut self, index: usize, src: &[u8]) -> Result<(), BufferError> {
        self.check_absolute(index, src.len())?;
        self.write_range(index, src)
    }

    /// Fills `dst` from `index` without moving the position.
    pub fn get_slice_at(&self, index: usize, dst: &mut [u8]) -> Result<(), BufferError> {
        self.check_absolute(index, dst.len())?;
        self.read_range(index, dst)
    }

    /// Transfers all of `src`'s remaining bytes into this buffer. Fails
    /// without touching either buffer when they do not fit.
    pub fn put_buffer(&mut self, src: &mut Buffer) -> Result<(), BufferError> {
        let count = src.remaining();
        let start = self.check_relative(count)?;
        let bytes = src.to_vec()?;
        self.write_range(start, &bytes)?;
        self.position += count;
        src.position += count;
        Ok(())
    }

    /// Copies the remaining bytes out without moving the position.
    pub fn to_vec(&self) -> Result<Vec<u8>, BufferError> {
        self.to_vec_at(self.position, self.remaining())
    }

    /// Copies `len` bytes starting at `index` without moving the position.
    pub fn to_vec_at(&self, index: usize, len: usize) -> Result<Vec<u8>, BufferError> {
        let mut out = vec![0u8; len];
        self.get_slice_at(index, &mut out)?;
        Ok(out)
    }

    /// Returns the start index of a relative access of `len` bytes.
    fn check_relative(&self, len: usize) -> Result<usize, BufferError> {
        if len > self.remaining() {
            return Err(BufferError::OutOfBounds {
                index: self.position,
                requested: len,
                limit: self.limit,
            });
        }
        Ok(self.position)
    }

    fn check_absolute(&self, index: usize, len: usize) -> Result<(), BufferError> {
        match index.checked_add(len) {
            Some(end) if end <= self.limit => Ok(()),
            _ => Err(BufferError::OutOfBounds {
                index,
                requested: len,
                limit: self.limit,
            }),
        }
    }

    fn read_range(&self, start: usize, dst: &mut [u8]) -> Result<(), BufferError> {
        let end = start + dst.len();
        self.storage
            .with(|bytes| dst.copy_from_slice(&bytes[start..end]))
    }

    fn write_range(&mut self, start: usize, src: &[u8]) -> Result<(), BufferError> {
        if self.is_read_only() {
            return Err(BufferError::ReadOnly);
        }
        let end = start + src.len();
        self.storage
            .with_mut(|bytes| bytes[start..end].copy_from_slice(src))
    }

    /// Runs a platform read over `[position, limit)` and advances by the
    /// number of bytes it reports.
    pub(crate) fn fill_with<F>(&mut self, op: F) -> Result<usize, ChannelError>
    where
        F: FnOnce(&mut [u8]) -> std::io::Result<usize>,
    {
        if self.is_read_only() {
            return Err(BufferError::ReadOnly.into());
        }
        let (start, end) = (self.position, self.limit);
        let count = self.storage.with_mut(|bytes| op(&mut bytes[start..end]))??;
        self.position += count.min(end - start);
        Ok(count)
    }

    /// Runs a platform write over `[position, limit)` and advances by the
    /// number of bytes it reports.
    pub(crate) fn drain_with<F>(&mut self, op: F) -> Result<usize, ChannelError>
    where
        F: FnOnce(&[u8]) -> std::io::Result<usize>,
    {
        let (start, end) = (self.position, self.limit);
        let count = self.storage.with(|bytes| op(&bytes[start..end]))??;
        self.position += count.min(end - start);
        Ok(count)
    }

    /// The writable window of an owned buffer. `None` for views.
    pub(crate) fn heap_window_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.storage {
            Storage::Heap(bytes) => Some(&mut bytes[self.position..self.limit]),
            Storage::View(_) => None,
        }
    }

    /// The readable window of an owned buffer. `None` for views.
    pub(crate) fn heap_window(&self) -> Option<&[u8]> {
        match &self.storage {
            Storage::Heap(bytes) => Some(&bytes[self.position..self.limit]),
            Storage::View(_) => None,
        }
    }

    /// Advances the position after an external transfer of `count` bytes.
    pub(crate) fn advance(&mut self, count: usize) {
        self.position = (self.position + count).min(self.limit);
    }
}

macro_rules! typed_accessors {
    ($($ty:ty => $get:ident, $put:ident, $get_at:ident, $put_at:ident;)*) => {
        impl Buffer {
            $(
                #[doc = concat!("Reads a `", stringify!($ty), "` at the position and advances past it.")]
                pub fn $get(&mut self) -> Result<$ty, BufferError> {
                    let mut raw = [0u8; size_of::<$ty>()];
                    self.get_slice(&mut raw)?;
                    Ok(match self.order {
                        ByteOrder::BigEndian => <$ty>::from_be_bytes(raw),
                        ByteOrder::LittleEndian => <$ty>::from_le_bytes(raw),
                    })
                }

                #[doc = concat!("Writes a `", stringify!($ty), "` at the position and advances past it.")]
                pub fn $put(&mut self, value: $ty) -> Result<(), BufferError> {
                    let raw = match self.order {
                        ByteOrder::BigEndian => value.to_be_bytes(),
                        ByteOrder::LittleEndian => value.to_le_bytes(),
                    };
                    self.put_slice(&raw)
                }

                #[doc = concat!("Reads a `", stringify!($ty), "` at `index` without moving the position.")]
                pub fn $get_at(&self, index: usize) -> Result<$ty, BufferError> {
                    let mut raw = [0u8; size_of::<$ty>()];
                    self.get_slice_at(index, &mut raw)?;
                    Ok(match self.order {
                        ByteOrder::BigEndian => <$ty>::from_be_bytes(raw),
                        ByteOrder::LittleEndian => <$ty>::from_le_bytes(raw),
                    })
                }

                #[doc = concat!("Writes a `", stringify!($ty), "` at `index` without moving the position.")]
                pub fn $put_at(&mut self, index: usize, value: $ty) -> Result<(), BufferError> {
                    let raw = match self.order {
                        ByteOrder::BigEndian => value.to_be_bytes(),
                        ByteOrder::LittleEndian => value.to_le_bytes(),
                    };
                    self.put_slice_at(index, &raw)
                }
            )*
        }
    };
}

typed_accessors! {
    u8 => get_u8, put_u8, get_u8_at, put_u8_at;
    i8 => get_i8, put_i8, get_i8_at, put_i8_at;
    u16 => get_u16, put_u16, get_u16_at, put_u16_at;
    i16 => get_i16, put_i16, get_i16_at, put_i16_at;
    u32 => get_u32, put_u32, get_u32_at, put_u32_at;
    i32 => get_i32, put_i32, get_i32_at, put_i32_at;
    u64 => get_u64, put_u64, get_u64_at, put_u64_at;
    i64 => get_i64, put_i64, get_i64_at, put_i64_at;
    f32 => get_f32, put_f32, get_f32_at, put_f32_at;
    f64 => get_f64, put_f64, get_f64_at, put_f64_at;
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.capacity)
            .field("view", &self.is_view())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_initial_state() {
        let buf = Buffer::allocate(16);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.limit(), 16);
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.remaining(), 16);
        assert!(!buf.is_view());
        assert!(buf.is_valid());
    }

    #[test]
    fn test_wrap_uses_vector_length() {
        let mut buf = Buffer::wrap(b"hello".to_vec());
        assert_eq!(buf.capacity(), 5);
        assert_eq!(buf.limit(), 5);

        let mut out = [0u8; 5];
        buf.get_slice(&mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn test_put_beyond_limit_fails_without_mutation() {
        let mut buf = Buffer::allocate(4);
        buf.put_u16(0xBEEF).unwrap();

        let err = buf.put_u32(1).unwrap_err();
        assert_eq!(
            err,
            BufferError::OutOfBounds {
                index: 2,
                requested: 4,
                limit: 4
            }
        );
        assert_eq!(buf.position(), 2);
        assert_eq!(buf.to_vec_at(0, 4).unwrap(), vec![0xBE, 0xEF, 0, 0]);
    }

    #[test]
    fn test_get_beyond_limit_fails() {
        let mut buf = Buffer::allocate(8);
        buf.put_u8(7).unwrap();
        buf.flip();

        assert_eq!(buf.get_u8().unwrap(), 7);
        assert!(matches!(
            buf.get_u8(),
            Err(BufferError::OutOfBounds { .. })
        ));
        assert_eq!(buf.position(), 1);
    }

    #[test]
    fn test_flip_then_read_all() {
        let mut buf = Buffer::allocate(32);
        buf.put_slice(b"abcdef").unwrap();
        buf.flip();
        assert_eq!(buf.limit(), 6);

        let mut out = [0u8; 6];
        buf.get_slice(&mut out).unwrap();
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_clear_then_flip_is_empty() {
        let mut buf = Buffer::allocate(32);
        buf.put_slice(b"junk").unwrap();
        buf.clear();
        buf.flip();
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_clear_keeps_contents() {
        let mut buf = Buffer::allocate(4);
        buf.put_slice(b"abcd").unwrap();
        buf.clear();
        assert_eq!(buf.to_vec().unwrap(), b"abcd");
    }

    #[test]
    fn test_rewind_keeps_limit() {
        let mut buf = Buffer::allocate(8);
        buf.put_slice(b"xyz").unwrap();
        buf.flip();
        buf.get_u8().unwrap();
        buf.rewind();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 3);
    }

    #[test]
    fn test_compact_preserves_unread_bytes() {
        let mut buf = Buffer::allocate(16);
        buf.put_slice(b"0123456789").unwrap();
        buf.flip();

        let mut head = [0u8; 4];
        buf.get_slice(&mut head).unwrap();
        let (p, l) = (buf.position(), buf.limit());

        buf.compact();
        assert_eq!(buf.position(), l - p);
        assert_eq!(buf.limit(), buf.capacity());
        assert_eq!(buf.to_vec_at(0, l - p).unwrap(), b"456789");
    }

    #[test]
    fn test_compact_when_fully_consumed() {
        let mut buf = Buffer::allocate(8);
        buf.put_slice(b"ab").unwrap();
        buf.flip();
        buf.get_u16().unwrap();

        buf.compact();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 8);
    }

    #[test]
    fn test_mark_and_reset() {
        let mut buf = Buffer::allocate(8);
        assert_eq!(buf.reset(), Err(BufferError::InvalidMark));

        buf.put_u8(1).unwrap();
        buf.mark();
        buf.put_u16(2).unwrap();
        buf.reset().unwrap();
        assert_eq!(buf.position(), 1);

        // Moving the position before the mark discards it
        buf.set_position(0).unwrap();
        assert_eq!(buf.reset(), Err(BufferError::InvalidMark));
    }

    #[test]
    fn test_set_limit_clamps_position() {
        let mut buf = Buffer::allocate(8);
        buf.put_u32(5).unwrap();
        buf.set_limit(2).unwrap();
        assert_eq!(buf.position(), 2);
        assert!(matches!(
            buf.set_limit(9),
            Err(BufferError::InvalidLimit { .. })
        ));
        assert!(matches!(
            buf.set_position(3),
            Err(BufferError::InvalidPosition { .. })
        ));
    }

    #[test]
    fn test_typed_values_and_order() {
        let mut buf = Buffer::allocate(64);
        buf.put_i16(-2).unwrap();
        buf.put_u32(0xDEAD_BEEF).unwrap();
        buf.put_i64(-42).unwrap();
        buf.put_f32(1.5).unwrap();
        buf.put_f64(-0.25).unwrap();
        buf.set_order(ByteOrder::LittleEndian);
        buf.put_u16(0x0102).unwrap();
        buf.flip();

        buf.set_order(ByteOrder::BigEndian);
        assert_eq!(buf.get_i16().unwrap(), -2);
        assert_eq!(buf.get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(buf.get_i64().unwrap(), -42);
        assert_eq!(buf.get_f32().unwrap(), 1.5);
        assert_eq!(buf.get_f64().unwrap(), -0.25);
        assert_eq!(buf.get_u8_at(buf.position()).unwrap(), 0x02);
        buf.set_order(ByteOrder::LittleEndian);
        assert_eq!(buf.get_u16().unwrap(), 0x0102);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_absolute_access_leaves_position() {
        let mut buf = Buffer::allocate(8);
        buf.put_u32_at(4, 99).unwrap();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.get_u32_at(4).unwrap(), 99);
        assert!(matches!(
            buf.get_u32_at(5),
            Err(BufferError::OutOfBounds { .. })
        ));
        assert!(matches!(
            buf.get_u8_at(usize::MAX),
            Err(BufferError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_put_buffer_all_or_nothing() {
        let mut dst = Buffer::allocate(4);
        let mut src = Buffer::wrap(b"abcdef".to_vec());

        assert!(dst.put_buffer(&mut src).is_err());
        assert_eq!(src.position(), 0);
        assert_eq!(dst.position(), 0);

        src.set_position(2).unwrap();
        dst.put_buffer(&mut src).unwrap();
        assert!(!src.has_remaining());
        assert_eq!(dst.to_vec_at(0, 4).unwrap(), b"cdef");
    }

    #[test]
    fn test_fill_with_advances_by_count() {
        let mut buf = Buffer::allocate(8);
        let n = buf
            .fill_with(|window| {
                window[..3].copy_from_slice(b"abc");
                Ok(3)
            })
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf.position(), 3);

        buf.flip();
        let n = buf.drain_with(|window| Ok(window.len() - 1)).unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf.remaining(), 1);
    }
}
