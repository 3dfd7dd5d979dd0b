//! File channels.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use crate::buffer::{scatter, Buffer};
use crate::channel::shared::{ChannelCore, IoObject};
use crate::channel::{
    classify_read, ChannelKind, ReadStatus, ReadableChannel, SelectableChannel, WritableChannel,
};
use crate::error::ChannelError;
use crate::mmap::{MapMode, MappedRegion};

/// Largest staging copy used by [`FileChannel::transfer_to`].
const TRANSFER_CHUNK: usize = 64 * 1024;

/// A channel over an open file.
///
/// Files are always blocking and cannot be registered with a selector.
/// Relative reads and writes move the shared file position; the positional
/// variants leave it alone and may run concurrently.
#[derive(Clone)]
pub struct FileChannel {
    core: Arc<ChannelCore>,
}

impl FileChannel {
    /// Opens `path` with the given options.
    pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self, ChannelError> {
        let file = options.open(path)?;
        Ok(Self::from_file(file))
    }

    /// Opens `path` read-write, creating it or truncating it.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        Self::open(path, &options)
    }

    /// Takes ownership of an open file.
    pub fn from_file(file: File) -> Self {
        Self {
            core: ChannelCore::new(ChannelKind::File, IoObject::File(file), true),
        }
    }

    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }

    /// Reads at the file position into `[position, limit)` of `buf`.
    pub fn read(&self, buf: &mut Buffer) -> Result<ReadStatus, ChannelError> {
        let wanted = buf.remaining();
        let result = self
            .core
            .with_file(|file| buf.fill_with(|window| (&*file).read(window)));
        classify_read(result, wanted)
    }

    /// Reads at `offset` without moving the file position.
    pub fn read_at(&self, buf: &mut Buffer, offset: u64) -> Result<ReadStatus, ChannelError> {
        let wanted = buf.remaining();
        let result = self
            .core
            .with_file(|file| buf.fill_with(|window| file.read_at(window, offset)));
        classify_read(result, wanted)
    }

    pub fn read_vectored(&self, bufs: &mut [&mut Buffer]) -> Result<ReadStatus, ChannelError> {
        let wanted = scatter::remaining_total(bufs);
        let result = self.core.with_file(|file| {
            scatter::scatter_with(bufs, |slices| (&*file).read_vectored(slices))
        });
        classify_read(result, wanted)
    }

    /// Writes `[position, limit)` of `buf` at the file position.
    pub fn write(&self, buf: &mut Buffer) -> Result<usize, ChannelError> {
        self.core
            .with_file(|file| buf.drain_with(|window| (&*file).write(window)))
    }

    /// Writes at `offset` without moving the file position.
    pub fn write_at(&self, buf: &mut Buffer, offset: u64) -> Result<usize, ChannelError> {
        self.core
            .with_file(|file| buf.drain_with(|window| file.write_at(window, offset)))
    }

    pub fn write_vectored(&self, bufs: &mut [&mut Buffer]) -> Result<usize, ChannelError> {
        self.core.with_file(|file| {
            scatter::gather_with(bufs, |slices| (&*file).write_vectored(slices))
        })
    }

    /// Current file position.
    pub fn position(&self) -> Result<u64, ChannelError> {
        self.core
            .with_file(|file| Ok((&*file).stream_position()?))
    }

    pub fn set_position(&self, position: u64) -> Result<(), ChannelError> {
        self.core.with_file(|file| {
            (&*file).seek(SeekFrom::Start(position))?;
            Ok(())
        })
    }

    /// Current file size in bytes.
    pub fn size(&self) -> Result<u64, ChannelError> {
        self.core.with_file(|file| Ok(file.metadata()?.len()))
    }

    /// Shrinks the file to `len` bytes. A larger `len` leaves the file as it
    /// is. A position beyond the new size is pulled back to it.
    pub fn truncate(&self, len: u64) -> Result<(), ChannelError> {
        self.core.with_file(|file| {
            if len < file.metadata()?.len() {
                file.set_len(len)?;
            }
            let mut handle = file;
            if handle.stream_position()? > len {
                handle.seek(SeekFrom::Start(len))?;
            }
            Ok(())
        })
    }

    /// Forces written data to the storage device, including metadata when
    /// `metadata` is set.
    pub fn force(&self, metadata: bool) -> Result<(), ChannelError> {
        self.core.with_file(|file| {
            if metadata {
                file.sync_all()?;
            } else {
                file.sync_data()?;
            }
            Ok(())
        })
    }

    /// Copies up to `count` bytes starting at file offset `position` into
    /// `target`. Stops early at end of file or when `target` accepts fewer
    /// bytes than offered. Returns the bytes written to `target`; the file
    /// position is not moved.
    pub fn transfer_to(
        &self,
        position: u64,
        count: u64,
        target: &dyn WritableChannel,
    ) -> Result<u64, ChannelError> {
        let chunk = count.min(TRANSFER_CHUNK as u64) as usize;
        let mut staging = Buffer::allocate(chunk);
        let mut transferred = 0u64;

        while transferred < count {
            staging.clear();
            let want = (count - transferred).min(chunk as u64) as usize;
            staging.set_limit(want)?;

            let read = match self.read_at(&mut staging, position + transferred)? {
                ReadStatus::EndOfStream | ReadStatus::Bytes(0) => break,
                ReadStatus::Bytes(n) => n,
            };
            staging.flip();

            let written = target.write(&mut staging)?;
            transferred += written as u64;
            if written < read {
                break;
            }
        }

        Ok(transferred)
    }

    /// Maps `len` bytes starting at `offset`.
    ///
    /// The region lives until it is unmapped, dropped, or this channel is
    /// closed, whichever comes first.
    pub fn map(&self, mode: MapMode, offset: u64, len: usize) -> Result<MappedRegion, ChannelError> {
        let region = self
            .core
            .with_file(|file| Ok(MappedRegion::map(file, mode, offset, len)?))?;
        self.core.track_mapping(region.shared());
        Ok(region)
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Closes the file. Idempotent; regions mapped from it are released.
    pub fn close(&self) {
        self.core.close()
    }
}

impl SelectableChannel for FileChannel {
    fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }
}

impl ReadableChannel for FileChannel {
    fn read(&self, buf: &mut Buffer) -> Result<ReadStatus, ChannelError> {
        FileChannel::read(self, buf)
    }

    fn read_vectored(&self, bufs: &mut [&mut Buffer]) -> Result<ReadStatus, ChannelError> {
        FileChannel::read_vectored(self, bufs)
    }
}

impl WritableChannel for FileChannel {
    fn write(&self, buf: &mut Buffer) -> Result<usize, ChannelError> {
        FileChannel::write(self, buf)
    }

    fn write_vectored(&self, bufs: &mut [&mut Buffer]) -> Result<usize, ChannelError> {
        FileChannel::write_vectored(self, bufs)
    }
}

impl fmt::Debug for FileChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileChannel")
            .field("fd", &self.core.raw_fd())
            .field("open", &self.core.is_open())
            .finish()
    }
}
