//! State shared by every handle to one channel.

use std::fmt;
use std::fs::File;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use socket2::Socket;

use crate::channel::ChannelKind;
use crate::error::ChannelError;
use crate::mmap::MapShared;
use crate::select::KeyInner;

/// The owned descriptor.
pub(crate) enum IoObject {
    File(File),
    Socket(Socket),
}

impl IoObject {
    fn raw_fd(&self) -> RawFd {
        match self {
            Self::File(file) => file.as_raw_fd(),
            Self::Socket(socket) => socket.as_raw_fd(),
        }
    }
}

/// The state behind a channel handle.
///
/// Handles clone an `Arc` of this core; selectors only hold weak
/// references to it, so a registration never keeps a channel open.
pub struct ChannelCore {
    kind: ChannelKind,

    /// Descriptor number, kept after close for logging and deregistration.
    fd: RawFd,

    /// `None` once closed. Operations hold the read lock for the duration
    /// of one platform call; close takes the write lock.
    io: RwLock<Option<IoObject>>,

    closed: AtomicBool,
    blocking: AtomicBool,

    /// Set while a non-blocking connect is in progress.
    connect_pending: AtomicBool,
    connected: AtomicBool,

    /// Registrations of this channel, at most one per selector.
    registrations: Mutex<Vec<Weak<KeyInner>>>,

    /// Regions mapped from this channel.
    mappings: Mutex<Vec<Weak<MapShared>>>,
}

impl ChannelCore {
    pub(crate) fn new(kind: ChannelKind, io: IoObject, blocking: bool) -> Arc<Self> {
        let fd = io.raw_fd();
        tracing::debug!("Opened {} channel on fd {}", kind, fd);
        Arc::new(Self {
            kind,
            fd,
            io: RwLock::new(Some(io)),
            closed: AtomicBool::new(false),
            blocking: AtomicBool::new(blocking),
            connect_pending: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            registrations: Mutex::new(Vec::new()),
            mappings: Mutex::new(Vec::new()),
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Acquire)
    }

    pub(crate) fn is_connect_pending(&self) -> bool {
        self.connect_pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_connect_pending(&self, pending: bool) {
        self.connect_pending.store(pending, Ordering::Release);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self) {
        self.connect_pending.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
    }

    /// Runs `f` against the open descriptor.
    pub(crate) fn with_io<R>(
        &self,
        f: impl FnOnce(&IoObject) -> Result<R, ChannelError>,
    ) -> Result<R, ChannelError> {
        let io = self.io.read().unwrap_or_else(PoisonError::into_inner);
        match io.as_ref() {
            Some(io) if self.is_open() => f(io),
            _ => Err(ChannelError::Closed),
        }
    }

    pub(crate) fn with_socket<R>(
        &self,
        f: impl FnOnce(&Socket) -> Result<R, ChannelError>,
    ) -> Result<R, ChannelError> {
        self.with_io(|io| match io {
            IoObject::Socket(socket) => f(socket),
            IoObject::File(_) => Err(ChannelError::unsupported(self.kind, "socket operation")),
        })
    }

    pub(crate) fn with_file<R>(
        &self,
        f: impl FnOnce(&File) -> Result<R, ChannelError>,
    ) -> Result<R, ChannelError> {
        self.with_io(|io| match io {
            IoObject::File(file) => f(file),
            IoObject::Socket(_) => Err(ChannelError::unsupported(self.kind, "file operation")),
        })
    }

    /// Lock over this channel's registrations. Taken before any selector
    /// lock.
    pub(crate) fn registrations(&self) -> MutexGuard<'_, Vec<Weak<KeyInner>>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether some selector still watches this channel.
    fn is_registered(registrations: &[Weak<KeyInner>]) -> bool {
        registrations
            .iter()
            .filter_map(Weak::upgrade)
            .any(|key| !key.is_cancelled())
    }

    /// Switches between blocking and non-blocking mode.
    ///
    /// Files have no non-blocking mode. A channel with a live registration
    /// cannot go back to blocking.
    pub(crate) fn set_blocking(&self, blocking: bool) -> Result<(), ChannelError> {
        if self.kind == ChannelKind::File {
            return Err(ChannelError::unsupported(self.kind, "configure_blocking"));
        }

        let registrations = self.registrations();
        if blocking && Self::is_registered(&registrations) {
            return Err(ChannelError::Blocking);
        }
        self.with_socket(|socket| Ok(socket.set_nonblocking(!blocking)?))?;
        self.blocking.store(blocking, Ordering::Release);
        Ok(())
    }

    /// Records a region mapped from this channel so close can invalidate it.
    pub(crate) fn track_mapping(&self, shared: &Arc<MapShared>) {
        let mut mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);
        mappings.retain(|weak| weak.strong_count() > 0);
        mappings.push(Arc::downgrade(shared));
    }

    /// Closes the channel. Idempotent.
    ///
    /// Order matters: registrations leave their pollers before the
    /// descriptor is released, so a recycled descriptor number can never be
    /// confused with this one. Mapped regions are invalidated next.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Step 1: leave every selector
        let keys: Vec<Arc<KeyInner>> = self
            .registrations()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for key in &keys {
            key.deregister_on_close();
        }

        // Step 2: invalidate views over mapped regions
        let mappings: Vec<_> = self
            .mappings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for shared in mappings.iter().filter_map(Weak::upgrade) {
            shared.invalidate();
        }

        // Step 3: unblock threads parked in blocking socket calls, then
        // release the descriptor once in-flight calls have returned
        if let Some(IoObject::Socket(socket)) = self
            .io
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = socket.shutdown(Shutdown::Both);
        }
        let io = self
            .io
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(io);

        tracing::debug!(
            "Closed {} channel on fd {} ({} registration(s) cancelled)",
            self.kind,
            self.fd,
            keys.len()
        );
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCore")
            .field("kind", &self.kind)
            .field("fd", &self.fd)
            .field("open", &self.is_open())
            .field("blocking", &self.is_blocking())
            .finish()
    }
}
