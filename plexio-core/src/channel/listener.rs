//! Listening socket channels.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::channel::shared::{ChannelCore, IoObject};
use crate::channel::socket::to_socket_addr;
use crate::channel::{ChannelKind, SelectableChannel, SocketChannel};
use crate::error::ChannelError;

/// A listening TCP socket. Its only operation is accept.
#[derive(Clone)]
pub struct ServerSocketChannel {
    core: Arc<ChannelCore>,
}

impl ServerSocketChannel {
    /// Binds to `addr` with `SO_REUSEADDR` and starts listening.
    ///
    /// The channel starts in blocking mode.
    pub fn bind(addr: SocketAddr, backlog: i32) -> Result<Self, ChannelError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(backlog)?;

        let channel = Self {
            core: ChannelCore::new(ChannelKind::Listener, IoObject::Socket(socket), true),
        };
        tracing::debug!("Listening on {}", channel.local_addr()?);
        Ok(channel)
    }

    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }

    /// Accepts a pending connection.
    ///
    /// In non-blocking mode returns `Ok(None)` when no connection is
    /// waiting. The accepted channel starts in blocking mode.
    pub fn accept(&self) -> Result<Option<SocketChannel>, ChannelError> {
        let accepted = self.core.with_socket(|socket| match socket.accept() {
            Ok((stream, _)) => Ok(Some(stream)),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        })?;

        accepted.map(SocketChannel::from_accepted).transpose()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        self.core
            .with_socket(|socket| to_socket_addr(socket.local_addr()?))
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

    /// Stops listening. Idempotent; cancels every registration.
    pub fn close(&self) {
        self.core.close()
    }
}

impl SelectableChannel for ServerSocketChannel {
    fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }
}

impl fmt::Debug for ServerSocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSocketChannel")
            .field("fd", &self.core.raw_fd())
            .field("open", &self.core.is_open())
            .field("blocking", &self.core.is_blocking())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_nonblocking_accept() {
        let listener = ServerSocketChannel::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        listener.configure_blocking(false).unwrap();
        assert!(listener.accept().unwrap().is_none());

        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let accepted = loop {
            if let Some(channel) = listener.accept().unwrap() {
                break channel;
            }
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        };

        assert!(accepted.is_connected());
        assert!(accepted.is_blocking());
        assert_eq!(accepted.local_addr().unwrap(), addr);
        accepted.close();
        listener.close();
    }

    #[test]
    fn test_closed_listener_rejects_accept() {
        let listener = ServerSocketChannel::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        listener.close();
        assert!(!listener.is_open());
        assert!(matches!(listener.accept(), Err(ChannelError::Closed)));
        assert!(matches!(
            listener.local_addr(),
            Err(ChannelError::Closed)
        ));
    }
}
