//! Platform readiness primitives.
//!
//! This module wraps the operating system's event-notification facility
//! behind the [`Poller`] trait:
//! - [`epoll`]: level-triggered `epoll` with an `eventfd` wake source (Linux)
//! - [`poll`]: `poll(2)` over a registry snapshot with a self-pipe wake
//!   source (any Unix)
//!
//! The selector builds on the trait only; which backend is used is a
//! configuration choice.

#[cfg(target_os = "linux")]
pub mod epoll;
pub mod poll;

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Readiness a descriptor is watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

/// Readiness reported for one registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    /// Token supplied when the descriptor was added.
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// An event-notification primitive.
///
/// `add`, `modify`, `delete` and `wake` may be called from any thread,
/// including while another thread is blocked in `wait`.
pub trait Poller: Send + Sync {
    /// Starts watching `fd`, reporting readiness under `token`.
    fn add(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;

    /// Replaces the interest of a watched descriptor.
    fn modify(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;

    /// Stops watching `fd`.
    fn delete(&self, fd: RawFd) -> io::Result<()>;

    /// Blocks until readiness, timeout or wake, appending events to `events`.
    ///
    /// `None` waits indefinitely; a zero duration returns immediately.
    /// Returns `true` when the wait was ended by [`wake`](Self::wake). An
    /// interrupted wait returns `Ok(false)` with no events.
    fn wait(&self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<bool>;

    /// Forces a current or the next `wait` to return immediately.
    fn wake(&self) -> io::Result<()>;
}

/// Which poller implementation a selector uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollerBackend {
    /// `epoll` on Linux, `poll(2)` elsewhere.
    #[default]
    Auto,

    /// `epoll`. Only available on Linux.
    Epoll,

    /// `poll(2)`.
    Poll,
}

/// Creates a poller for the requested backend.
pub fn new_poller(backend: PollerBackend, events_capacity: usize) -> io::Result<Box<dyn Poller>> {
    match backend {
        #[cfg(target_os = "linux")]
        PollerBackend::Auto | PollerBackend::Epoll => {
            Ok(Box::new(epoll::EpollPoller::new(events_capacity)?))
        }
        #[cfg(not(target_os = "linux"))]
        PollerBackend::Auto => Ok(Box::new(poll::PollPoller::new()?)),
        #[cfg(not(target_os = "linux"))]
        PollerBackend::Epoll => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "epoll is only available on Linux",
        )),
        PollerBackend::Poll => Ok(Box::new(poll::PollPoller::new()?)),
    }
}

/// Puts a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK == 0 {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    }
    Ok(())
}

/// Marks a descriptor close-on-exec.
pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    Ok(())
}

/// Converts a wait timeout to milliseconds, rounding up so a short
/// non-zero timeout never turns into a busy poll.
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(duration) => {
            let partial = u128::from(duration.subsec_nanos() % 1_000_000 != 0);
            let ms = duration.as_millis() + partial;
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// Maps a `-1` return to the thread's last OS error.
pub(crate) fn cvt(res: libc::c_int) -> io::Result<libc::c_int> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    /// Runs the backend-independent poller contract against `poller`.
    pub(crate) fn exercise_poller(poller: Arc<dyn Poller>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let fd = listener.as_raw_fd();

        poller
            .add(fd, 7, Interest { readable: true, writable: false })
            .unwrap();

        // Nothing pending yet
        let mut events = Vec::new();
        let woken = poller.wait(&mut events, Some(Duration::ZERO)).unwrap();
        assert!(!woken);
        assert!(events.is_empty());

        // A connection makes the listener readable
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let woken = poller.wait(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(!woken);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, 7);
        assert!(events[0].readable);

        // A wake from another thread ends an indefinite wait
        poller.modify(fd, 7, Interest::default()).unwrap();
        let waker = poller.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            waker.wake().unwrap();
        });
        events.clear();
        let woken = poller.wait(&mut events, None).unwrap();
        handle.join().unwrap();
        assert!(woken);
        assert!(started.elapsed() < Duration::from_secs(5));

        // A wake issued before the wait is not lost
        poller.wake().unwrap();
        events.clear();
        assert!(poller.wait(&mut events, None).unwrap());

        poller.delete(fd).unwrap();
        events.clear();
        assert!(!poller.wait(&mut events, Some(Duration::ZERO)).unwrap());
        assert!(events.is_empty());
    }

    #[test]
    fn test_timeout_rounds_up() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(250))), 250);
        assert_eq!(timeout_ms(Some(Duration::from_secs(u64::MAX))), libc::c_int::MAX);
    }

    #[test]
    fn test_set_nonblocking() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        set_nonblocking(listener.as_raw_fd()).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_auto_backend_works() {
        let poller: Arc<dyn Poller> = Arc::from(new_poller(PollerBackend::Auto, 64).unwrap());
        exercise_poller(poller);
    }
}
