//! Channels: non-blocking handles to files and sockets.
//!
//! Three kinds exist, each with its own capability set:
//! - [`FileChannel`]: read, write, positional I/O and mapping. Never selectable.
//! - [`ServerSocketChannel`]: accept.
//! - [`SocketChannel`]: read, write and connect.
//!
//! The [`Channel`] enum wraps any of them and rejects operations outside
//! the wrapped kind's capability set with [`ChannelError::Unsupported`].
//!
//! Every handle is a cheap clone of one shared core. The descriptor is
//! released exactly once: on the first [`close`](Channel::close) or when the
//! last handle is dropped. Closing deregisters the channel from every
//! selector and invalidates all buffer views over regions it mapped.

mod shared;
mod file;
mod listener;
mod socket;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

pub use shared::ChannelCore;
pub use file::FileChannel;
pub use listener::ServerSocketChannel;
pub use socket::SocketChannel;

use crate::buffer::Buffer;
use crate::error::ChannelError;
use crate::select::Ops;

/// The kind of endpoint a channel wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    File,
    Listener,
    Stream,
}

impl ChannelKind {
    /// Operations a selector may watch for on this kind.
    pub fn valid_ops(self) -> Ops {
        match self {
            Self::File => Ops::NONE,
            Self::Listener => Ops::ACCEPT,
            Self::Stream => Ops::READ | Ops::WRITE | Ops::CONNECT,
        }
    }

    pub fn is_selectable(self) -> bool {
        !self.valid_ops().is_empty()
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Listener => "listening-socket",
            Self::Stream => "connected-socket",
        })
    }
}

/// Outcome of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Bytes transferred. Zero means the call would have blocked (or the
    /// buffers had no room).
    Bytes(usize),

    /// The peer closed its side and no more data will arrive.
    EndOfStream,
}

impl ReadStatus {
    /// Bytes transferred; zero at end-of-stream.
    pub fn bytes(self) -> usize {
        match self {
            Self::Bytes(n) => n,
            Self::EndOfStream => 0,
        }
    }

    pub fn is_end_of_stream(self) -> bool {
        self == Self::EndOfStream
    }
}

/// A channel that can be multiplexed by a selector.
pub trait SelectableChannel {
    /// The shared core the selector registers.
    #[doc(hidden)]
    fn core(&self) -> &Arc<ChannelCore>;

    fn kind(&self) -> ChannelKind {
        self.core().kind()
    }

    /// Operations a selector may watch for on this channel.
    fn valid_ops(&self) -> Ops {
        self.kind().valid_ops()
    }
}

/// A channel that reads into buffers.
pub trait ReadableChannel {
    fn read(&self, buf: &mut Buffer) -> Result<ReadStatus, ChannelError>;

    fn read_vectored(&self, bufs: &mut [&mut Buffer]) -> Result<ReadStatus, ChannelError>;
}

/// A channel that writes from buffers.
pub trait WritableChannel {
    fn write(&self, buf: &mut Buffer) -> Result<usize, ChannelError>;

    fn write_vectored(&self, bufs: &mut [&mut Buffer]) -> Result<usize, ChannelError>;
}

/// Any channel kind behind one handle.
#[derive(Clone, Debug)]
pub enum Channel {
    File(FileChannel),
    Listener(ServerSocketChannel),
    Stream(SocketChannel),
}

impl Channel {
    /// Rebuilds the typed handle for a shared core.
    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Self {
        match core.kind() {
            ChannelKind::File => Self::File(FileChannel::from_core(core)),
            ChannelKind::Listener => Self::Listener(ServerSocketChannel::from_core(core)),
            ChannelKind::Stream => Self::Stream(SocketChannel::from_core(core)),
        }
    }

    pub fn read(&self, buf: &mut Buffer) -> Result<ReadStatus, ChannelError> {
        match self {
            Self::File(file) => file.read(buf),
            Self::Stream(stream) => stream.read(buf),
            Self::Listener(_) => Err(self.unsupported("read")),
        }
    }

    pub fn write(&self, buf: &mut Buffer) -> Result<usize, ChannelError> {
        match self {
            Self::File(file) => file.write(buf),
            Self::Stream(stream) => stream.write(buf),
            Self::Listener(_) => Err(self.unsupported("write")),
        }
    }

    pub fn read_vectored(&self, bufs: &mut [&mut Buffer]) -> Result<ReadStatus, ChannelError> {
        match self {
            Self::File(file) => file.read_vectored(bufs),
            Self::Stream(stream) => stream.read_vectored(bufs),
            Self::Listener(_) => Err(self.unsupported("read_vectored")),
        }
    }

    pub fn write_vectored(&self, bufs: &mut [&mut Buffer]) -> Result<usize, ChannelError> {
        match self {
            Self::File(file) => file.write_vectored(bufs),
            Self::Stream(stream) => stream.write_vectored(bufs),
            Self::Listener(_) => Err(self.unsupported("write_vectored")),
        }
    }

    /// Accepts a pending connection. `Ok(None)` when none is waiting.
    pub fn accept(&self) -> Result<Option<SocketChannel>, ChannelError> {
        match self {
            Self::Listener(listener) => listener.accept(),
            _ => Err(self.unsupported("accept")),
        }
    }

    /// Starts a connect. `Ok(true)` when it completed immediately.
    pub fn connect(&self, addr: SocketAddr) -> Result<bool, ChannelError> {
        match self {
            Self::Stream(stream) => stream.connect(addr),
            _ => Err(self.unsupported("connect")),
        }
    }

    pub fn finish_connect(&self) -> Result<bool, ChannelError> {
        match self {
            Self::Stream(stream) => stream.finish_connect(),
            _ => Err(self.unsupported("finish_connect")),
        }
    }

    pub fn configure_blocking(&self, blocking: bool) -> Result<(), ChannelError> {
        self.core().set_blocking(blocking)
    }

    pub fn is_blocking(&self) -> bool {
        self.core().is_blocking()
    }

    pub fn is_open(&self) -> bool {
        self.core().is_open()
    }

    /// Closes the channel. Idempotent.
    pub fn close(&self) {
        self.core().close()
    }

    pub fn as_file(&self) -> Option<&FileChannel> {
        match self {
            Self::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn as_listener(&self) -> Option<&ServerSocketChannel> {
        match self {
            Self::Listener(listener) => Some(listener),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&SocketChannel> {
        match self {
            Self::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    fn unsupported(&self, op: &'static str) -> ChannelError {
        ChannelError::unsupported(self.kind(), op)
    }
}

impl SelectableChannel for Channel {
    fn core(&self) -> &Arc<ChannelCore> {
        match self {
            Self::File(file) => file.core(),
            Self::Listener(listener) => listener.core(),
            Self::Stream(stream) => stream.core(),
        }
    }
}

impl ReadableChannel for Channel {
    fn read(&self, buf: &mut Buffer) -> Result<ReadStatus, ChannelError> {
        Channel::read(self, buf)
    }

    fn read_vectored(&self, bufs: &mut [&mut Buffer]) -> Result<ReadStatus, ChannelError> {
        Channel::read_vectored(self, bufs)
    }
}

impl WritableChannel for Channel {
    fn write(&self, buf: &mut Buffer) -> Result<usize, ChannelError> {
        Channel::write(self, buf)
    }

    fn write_vectored(&self, bufs: &mut [&mut Buffer]) -> Result<usize, ChannelError> {
        Channel::write_vectored(self, bufs)
    }
}

impl From<FileChannel> for Channel {
    fn from(file: FileChannel) -> Self {
        Self::File(file)
    }
}

impl From<ServerSocketChannel> for Channel {
    fn from(listener: ServerSocketChannel) -> Self {
        Self::Listener(listener)
    }
}

impl From<SocketChannel> for Channel {
    fn from(stream: SocketChannel) -> Self {
        Self::Stream(stream)
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Maps a raw read outcome onto [`ReadStatus`].
///
/// `wanted` is the room the buffers offered: a zero-byte read into a
/// non-empty window is end-of-stream, a transient failure is would-block.
pub(crate) fn classify_read(
    result: Result<usize, ChannelError>,
    wanted: usize,
) -> Result<ReadStatus, ChannelError> {
    match result {
        Ok(0) if wanted > 0 => Ok(ReadStatus::EndOfStream),
        Ok(n) => Ok(ReadStatus::Bytes(n)),
        Err(ChannelError::Io(err)) if is_transient(&err) => Ok(ReadStatus::Bytes(0)),
        Err(err) => Err(err),
    }
}

/// Maps a raw write outcome: a transient failure is a zero-byte write.
pub(crate) fn classify_write(result: Result<usize, ChannelError>) -> Result<usize, ChannelError> {
    match result {
        Err(ChannelError::Io(err)) if is_transient(&err) => Ok(0),
        other => other,
    }
}
