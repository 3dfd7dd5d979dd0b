//! Mapping ownership and view validity.

use std::fs::File;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::buffer::Buffer;
use crate::error::{BufferError, ChannelError};
use crate::mmap::MapMode;

/// The live mapping.
enum Mapping {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::ReadOnly(map) => &map[..],
            Self::Writable(map) => &map[..],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::ReadOnly(_) => &mut [],
            Self::Writable(map) => &mut map[..],
        }
    }
}

/// State shared between a region, its views and its channel.
pub(crate) struct MapShared {
    /// `None` once released.
    mapping: Mutex<Option<Mapping>>,

    /// Cleared when the mapping is released.
    valid: AtomicBool,

    mode: MapMode,
    offset: u64,
    len: usize,
}

impl MapShared {
    fn lock(&self) -> MutexGuard<'_, Option<Mapping>> {
        self.mapping.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush_locked(&self, mapping: &Option<Mapping>) -> Result<(), ChannelError> {
        match mapping {
            None => Err(BufferError::Invalidated.into()),
            Some(Mapping::Writable(map)) if self.mode == MapMode::ReadWrite => {
                map.flush()?;
                Ok(())
            }
            // Read-only and private mappings have nothing to write back
            Some(_) => Ok(()),
        }
    }

    fn flush(&self) -> Result<(), ChannelError> {
        let mapping = self.lock();
        self.flush_locked(&mapping)
    }

    /// Flushes, then releases only when the flush succeeded.
    fn unmap(&self) -> Result<(), ChannelError> {
        let mut mapping = self.lock();
        if mapping.is_none() {
            return Ok(());
        }
        self.flush_locked(&mapping)?;
        self.valid.store(false, Ordering::Release);
        *mapping = None;
        Ok(())
    }

    /// Flushes best-effort and always releases. Used on channel close and drop.
    pub(crate) fn invalidate(&self) {
        let mut mapping = self.lock();
        if mapping.is_none() {
            return;
        }
        if let Err(e) = self.flush_locked(&mapping) {
            tracing::warn!(
                "Flush before unmapping {} byte(s) at offset {} failed: {}",
                self.len,
                self.offset,
                e
            );
        }
        self.valid.store(false, Ordering::Release);
        *mapping = None;
    }
}

/// Non-owning handle used by view buffers.
pub(crate) struct MapView {
    shared: Arc<MapShared>,
}

impl MapView {
    pub(crate) fn len(&self) -> usize {
        self.shared.len
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.shared.mode == MapMode::ReadOnly
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.shared.valid.load(Ordering::Acquire)
    }

    /// Locks the mapping for reading. Fails once it has been released.
    pub(crate) fn lock(&self) -> Result<ViewGuard<'_>, BufferError> {
        let guard = self.shared.lock();
        if guard.is_none() {
            return Err(BufferError::Invalidated);
        }
        Ok(ViewGuard { guard })
    }

    /// Locks the mapping for writing.
    pub(crate) fn lock_mut(&self) -> Result<ViewGuard<'_>, BufferError> {
        if self.is_read_only() {
            return Err(BufferError::ReadOnly);
        }
        self.lock()
    }
}

/// Access to the mapped bytes while the mapping lock is held.
pub(crate) struct ViewGuard<'a> {
    guard: MutexGuard<'a, Option<Mapping>>,
}

impl Deref for ViewGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.guard.as_ref() {
            Some(mapping) => mapping.bytes(),
            None => &[],
        }
    }
}

impl DerefMut for ViewGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self.guard.as_mut() {
            Some(mapping) => mapping.bytes_mut(),
            None => &mut [],
        }
    }
}

/// An owned mapping of a file range.
///
/// The region is released exactly once: by [`unmap`](Self::unmap), by
/// closing the channel it was mapped from, or on drop.
pub struct MappedRegion {
    shared: Arc<MapShared>,
}

impl MappedRegion {
    /// Maps `len` bytes of `file` starting at `offset`.
    pub(crate) fn map(file: &File, mode: MapMode, offset: u64, len: usize) -> std::io::Result<Self> {
        let mut options = MmapOptions::new();
        options.offset(offset).len(len);

        // Safety: the mapping is only reachable through `MapShared`, whose
        // lock serializes access and whose release makes later access fail.
        // Concurrent modification of the file by other processes is the
        // caller's concern, as with any shared mapping.
        let mapping = unsafe {
            match mode {
                MapMode::ReadOnly => Mapping::ReadOnly(options.map(file)?),
                MapMode::ReadWrite => Mapping::Writable(options.map_mut(file)?),
                MapMode::Private => Mapping::Writable(options.map_copy(file)?),
            }
        };

        tracing::debug!("Mapped {} byte(s) at offset {} ({:?})", len, offset, mode);

        Ok(Self {
            shared: Arc::new(MapShared {
                mapping: Mutex::new(Some(mapping)),
                valid: AtomicBool::new(true),
                mode,
                offset,
                len,
            }),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<MapShared> {
        &self.shared
    }

    /// A buffer viewing the whole region. Its capacity is the region length.
    pub fn buffer(&self) -> Buffer {
        Buffer::view(MapView {
            shared: self.shared.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.shared.len
    }

    pub fn is_empty(&self) -> bool {
        self.shared.len == 0
    }

    /// File offset of the first mapped byte.
    pub fn offset(&self) -> u64 {
        self.shared.offset
    }

    pub fn mode(&self) -> MapMode {
        self.shared.mode
    }

    /// Whether the mapping is still live.
    pub fn is_mapped(&self) -> bool {
        self.shared.valid.load(Ordering::Acquire)
    }

    /// Writes modified pages back to the file. No-op for read-only and
    /// private mappings.
    pub fn flush(&self) -> Result<(), ChannelError> {
        self.shared.flush()
    }

    /// Flushes, then releases the mapping. When the flush fails the mapping
    /// stays live and the error is returned. Unmapping twice is a no-op.
    pub fn unmap(&self) -> Result<(), ChannelError> {
        self.shared.unmap()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        self.shared.invalidate();
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("offset", &self.shared.offset)
            .field("len", &self.shared.len)
            .field("mode", &self.shared.mode)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
