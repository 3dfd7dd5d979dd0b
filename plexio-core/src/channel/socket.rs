//! Connected (stream) socket channels.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::buffer::{scatter, Buffer};
use crate::channel::shared::{ChannelCore, IoObject};
use crate::channel::{
    classify_read, classify_write, ChannelKind, ReadStatus, ReadableChannel, SelectableChannel,
    WritableChannel,
};
use crate::error::ChannelError;

/// A TCP stream channel.
///
/// In non-blocking mode reads and writes that cannot make progress return
/// zero bytes, and [`connect`](Self::connect) returns `false` while the
/// handshake is still running; completion is observed through
/// [`finish_connect`](Self::finish_connect) once the selector reports
/// `CONNECT` readiness.
#[derive(Clone)]
pub struct SocketChannel {
    core: Arc<ChannelCore>,
}

impl SocketChannel {
    /// Creates an unconnected TCP socket in blocking mode.
    pub fn open(domain: Domain) -> Result<Self, ChannelError> {
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        Ok(Self {
            core: ChannelCore::new(ChannelKind::Stream, IoObject::Socket(socket), true),
        })
    }

    /// Opens a socket and connects it in blocking mode.
    pub fn connect_to(addr: SocketAddr) -> Result<Self, ChannelError> {
        let channel = Self::open(Domain::for_address(addr))?;
        channel.connect(addr)?;
        Ok(channel)
    }

    /// Wraps a freshly accepted socket. It starts in blocking mode.
    pub(crate) fn from_accepted(socket: Socket) -> Result<Self, ChannelError> {
        socket.set_nonblocking(false)?;
        let core = ChannelCore::new(ChannelKind::Stream, IoObject::Socket(socket), true);
        core.set_connected();
        Ok(Self { core })
    }

    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }

    /// Starts connecting to `addr`.
    ///
    /// Returns `true` when the connection was established immediately, which
    /// is always the case in blocking mode. `false` means the connect is in
    /// progress.
    pub fn connect(&self, addr: SocketAddr) -> Result<bool, ChannelError> {
        if self.core.is_connected() {
            return Err(ChannelError::AlreadyConnected);
        }
        if self.core.is_connect_pending() {
            return Err(ChannelError::ConnectionPending);
        }

        let target = SockAddr::from(addr);
        self.core.with_socket(|socket| match socket.connect(&target) {
            Ok(()) => {
                self.core.set_connected();
                Ok(true)
            }
            Err(err) if is_in_progress(&err) => {
                self.core.set_connect_pending(true);
                Ok(false)
            }
            Err(err) => Err(err.into()),
        })
    }

    /// Completes a pending connect.
    ///
    /// Returns `true` once connected, `false` while the handshake is still
    /// running. A failed handshake clears the pending state and returns the
    /// socket error.
    pub fn finish_connect(&self) -> Result<bool, ChannelError> {
        if self.core.is_connected() {
            return Ok(true);
        }
        if !self.core.is_connect_pending() {
            return Err(ChannelError::NoConnectionPending);
        }

        self.core.with_socket(|socket| {
            if let Some(err) = socket.take_error()? {
                self.core.set_connect_pending(false);
                return Err(err.into());
            }
            match socket.peer_addr() {
                Ok(_) => {
                    self.core.set_connected();
                    Ok(true)
                }
                Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => Ok(false),
                Err(err) => {
                    self.core.set_connect_pending(false);
                    Err(err.into())
                }
            }
        })
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn is_connection_pending(&self) -> bool {
        self.core.is_connect_pending()
    }

    /// Reads into `[position, limit)` of `buf`.
    pub fn read(&self, buf: &mut Buffer) -> Result<ReadStatus, ChannelError> {
        let wanted = buf.remaining();
        let result = self.core.with_socket(|socket| {
            let mut reader = socket;
            buf.fill_with(|window| reader.read(window))
        });
        classify_read(result, wanted)
    }

    /// Scatter read: fills `bufs` in order.
    pub fn read_vectored(&self, bufs: &mut [&mut Buffer]) -> Result<ReadStatus, ChannelError> {
        let wanted = scatter::remaining_total(bufs);
        let result = self.core.with_socket(|socket| {
            let mut reader = socket;
            scatter::scatter_with(bufs, |slices| reader.read_vectored(slices))
        });
        classify_read(result, wanted)
    }

    /// Writes from `[position, limit)` of `buf`. Zero when the send buffer
    /// is full.
    pub fn write(&self, buf: &mut Buffer) -> Result<usize, ChannelError> {
        let result = self.core.with_socket(|socket| {
            let mut writer = socket;
            buf.drain_with(|window| writer.write(window))
        });
        classify_write(result)
    }

    /// Gather write: drains `bufs` in order.
    pub fn write_vectored(&self, bufs: &mut [&mut Buffer]) -> Result<usize, ChannelError> {
        let result = self.core.with_socket(|socket| {
            let mut writer = socket;
            scatter::gather_with(bufs, |slices| writer.write_vectored(slices))
        });
        classify_write(result)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        self.core
            .with_socket(|socket| to_socket_addr(socket.local_addr()?))
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, ChannelError> {
        self.core
            .with_socket(|socket| to_socket_addr(socket.peer_addr()?))
    }

    /// Half-closes the connection: the peer reads end-of-stream, reads on
    /// this side keep working.
    pub fn shutdown_output(&self) -> Result<(), ChannelError> {
        self.core
            .with_socket(|socket| Ok(socket.shutdown(Shutdown::Write)?))
    }

    pub fn set_nodelay(&self, nodelay: bool) -> Result<(), ChannelError> {
        self.core
            .with_socket(|socket| Ok(socket.set_nodelay(nodelay)?))
    }

    /// Switches blocking mode. Fails with [`ChannelError::Blocking`] when
    /// switching a registered channel to blocking.
    pub fn configure_blocking(&self, blocking: bool) -> Result<(), ChannelError> {
        self.core.set_blocking(blocking)
    }

    pub fn is_blocking(&self) -> bool {
        self.core.is_blocking()
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Closes the socket. Idempotent; cancels every registration.
    pub fn close(&self) {
        self.core.close()
    }
}

/// `connect` on a non-blocking socket reports `EINPROGRESS`.
fn is_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

pub(crate) fn to_socket_addr(addr: SockAddr) -> Result<SocketAddr, ChannelError> {
    addr.as_socket().ok_or_else(|| {
        ChannelError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket address is not an IP address",
        ))
    })
}

impl SelectableChannel for SocketChannel {
    fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }
}

impl ReadableChannel for SocketChannel {
    fn read(&self, buf: &mut Buffer) -> Result<ReadStatus, ChannelError> {
        SocketChannel::read(self, buf)
    }

    fn read_vectored(&self, bufs: &mut [&mut Buffer]) -> Result<ReadStatus, ChannelError> {
        SocketChannel::read_vectored(self, bufs)
    }
}

impl WritableChannel for SocketChannel {
    fn write(&self, buf: &mut Buffer) -> Result<usize, ChannelError> {
        SocketChannel::write(self, buf)
    }

    fn write_vectored(&self, bufs: &mut [&mut Buffer]) -> Result<usize, ChannelError> {
        SocketChannel::write_vectored(self, bufs)
    }
}

impl fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketChannel")
            .field("fd", &self.core.raw_fd())
            .field("open", &self.core.is_open())
            .field("connected", &self.core.is_connected())
            .field("blocking", &self.core.is_blocking())
            .finish()
    }
}
