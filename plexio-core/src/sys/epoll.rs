//! Level-triggered `epoll` poller (Linux).

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::sys::{cvt, timeout_ms, Interest, PollEvent, Poller};

/// Token carried by the wake source. Never handed out to registrations.
const WAKE_TOKEN: u64 = u64::MAX;

/// A poller backed by an `epoll` instance and an `eventfd` wake source.
pub struct EpollPoller {
    /// The epoll instance.
    epoll: OwnedFd,

    /// Non-blocking eventfd registered for readability.
    waker: OwnedFd,

    /// Scratch space for `epoll_wait`; only the waiting thread touches it.
    events: Mutex<Vec<libc::epoll_event>>,
}

impl EpollPoller {
    /// Creates an epoll instance that reports at most `capacity` events per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        // Safety: each descriptor is owned as soon as the call succeeds
        let epoll = unsafe { OwnedFd::from_raw_fd(cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))?) };
        let waker = unsafe {
            OwnedFd::from_raw_fd(cvt(libc::eventfd(
                0,
                libc::EFD_CLOEXEC | libc::EFD_NONBLOCK,
            ))?)
        };

        let poller = Self {
            epoll,
            waker,
            events: Mutex::new(Vec::with_capacity(capacity.max(1))),
        };
        poller.ctl(
            libc::EPOLL_CTL_ADD,
            poller.waker.as_raw_fd(),
            libc::EPOLLIN as u32,
            WAKE_TOKEN,
        )?;

        Ok(poller)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, flags: u32, data: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: flags,
            u64: data,
        };
        cvt(unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) })?;
        Ok(())
    }

    /// Resets the eventfd counter so the next wait blocks again.
    fn drain_waker(&self) {
        let mut counter = 0u64;
        // A failed read means the counter was already zero
        let _ = unsafe {
            libc::read(
                self.waker.as_raw_fd(),
                &mut counter as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }
}

fn interest_flags(interest: Interest) -> u32 {
    let mut flags = 0;
    if interest.readable {
        flags |= libc::EPOLLIN | libc::EPOLLRDHUP;
    }
    if interest.writable {
        flags |= libc::EPOLLOUT;
    }
    flags as u32
}

impl Poller for EpollPoller {
    fn add(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest_flags(interest), token as u64)
    }

    fn modify(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest_flags(interest), token as u64)
    }

    fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    fn wait(&self, out: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<bool> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let capacity = events.capacity();

        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                capacity as libc::c_int,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        // Safety: epoll_wait initialized the first `n` entries, n <= capacity
        unsafe { events.set_len(n as usize) };

        let mut woken = false;
        for event in events.iter() {
            let (flags, token) = (event.events, event.u64);
            if token == WAKE_TOKEN {
                woken = true;
                self.drain_waker();
                continue;
            }
            let flags = flags as libc::c_int;
            out.push(PollEvent {
                token: token as usize,
                // A half-closed peer reads as end-of-stream, not as a failure
                readable: flags & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) != 0,
                writable: flags & libc::EPOLLOUT != 0,
                error: flags & libc::EPOLLERR != 0,
                hangup: flags & libc::EPOLLHUP != 0,
            });
        }

        Ok(woken)
    }

    fn wake(&self) -> io::Result<()> {
        let one = 1u64;
        let res = unsafe {
            libc::write(
                self.waker.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            // A saturated counter already guarantees a wake-up
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}
