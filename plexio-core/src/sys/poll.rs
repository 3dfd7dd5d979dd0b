//! Portable `poll(2)` poller.
//!
//! The kernel keeps no interest state for `poll(2)`, so the poller keeps a
//! registry and snapshots it into a `pollfd` array on every wait.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::sys::{cvt, set_cloexec, set_nonblocking, timeout_ms, Interest, PollEvent, Poller};

/// A poller backed by `poll(2)` and a non-blocking self-pipe.
pub struct PollPoller {
    /// Watched descriptors: fd -> (token, interest).
    registry: Mutex<HashMap<RawFd, (usize, Interest)>>,

    /// Read end of the wake pipe, always polled first.
    wake_reader: OwnedFd,

    /// Write end of the wake pipe.
    wake_writer: OwnedFd,
}

impl PollPoller {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;

        // Safety: pipe() returned two fresh descriptors
        let (wake_reader, wake_writer) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        for fd in [&wake_reader, &wake_writer] {
            set_nonblocking(fd.as_raw_fd())?;
            set_cloexec(fd.as_raw_fd())?;
        }

        Ok(Self {
            registry: Mutex::new(HashMap::new()),
            wake_reader,
            wake_writer,
        })
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<RawFd, (usize, Interest)>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain_waker(&self) {
        let mut scratch = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_reader.as_raw_fd(),
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

fn interest_flags(interest: Interest) -> libc::c_short {
    let mut flags = 0;
    if interest.readable {
        flags |= libc::POLLIN;
    }
    if interest.writable {
        flags |= libc::POLLOUT;
    }
    flags
}

impl Poller for PollPoller {
    fn add(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let mut registry = self.registry();
        if registry.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        registry.insert(fd, (token, interest));
        Ok(())
    }

    fn modify(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        match self.registry().get_mut(&fd) {
            Some(entry) => {
                *entry = (token, interest);
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn delete(&self, fd: RawFd) -> io::Result<()> {
        match self.registry().remove(&fd) {
            Some(_) => Ok(()),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn wait(&self, out: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<bool> {
        let mut fds = vec![libc::pollfd {
            fd: self.wake_reader.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let mut tokens = Vec::new();

        // Snapshot the registry so add/delete never wait on a blocked poll
        for (&fd, &(token, interest)) in self.registry().iter() {
            fds.push(libc::pollfd {
                fd,
                events: interest_flags(interest),
                revents: 0,
            });
            tokens.push(token);
        }

        let n = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
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

        let woken = fds[0].revents != 0;
        if woken {
            self.drain_waker();
        }

        for (pollfd, token) in fds[1..].iter().zip(tokens) {
            let revents = pollfd.revents;
            // POLLNVAL: the descriptor was closed while we waited
            if revents == 0 || revents & libc::POLLNVAL != 0 {
                continue;
            }
            out.push(PollEvent {
                token,
                readable: revents & (libc::POLLIN | libc::POLLPRI) != 0,
                writable: revents & libc::POLLOUT != 0,
                error: revents & libc::POLLERR != 0,
                hangup: revents & libc::POLLHUP != 0,
            });
        }

        Ok(woken)
    }

    fn wake(&self) -> io::Result<()> {
        let byte = 1u8;
        let res = unsafe {
            libc::write(
                self.wake_writer.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            // A full pipe already guarantees a wake-up
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::tests::exercise_poller;
    use std::sync::Arc;

    #[test]
    fn test_poll_contract() {
        exercise_poller(Arc::new(PollPoller::new().unwrap()));
    }

    #[test]
    fn test_registry_bookkeeping() {
        let poller = PollPoller::new().unwrap();
        let interest = Interest {
            readable: true,
            writable: false,
        };

        poller.add(10_000, 1, interest).unwrap();
        assert!(poller.add(10_000, 2, interest).is_err());
        poller.modify(10_000, 3, Interest::default()).unwrap();
        poller.delete(10_000).unwrap();
        assert!(poller.delete(10_000).is_err());
        assert!(poller.modify(10_000, 3, interest).is_err());
    }
}
