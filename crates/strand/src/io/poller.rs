//! Edge-triggered epoll wrapper
//!
//! A thin owner of the epoll descriptor. Registrations carry the fd itself
//! as the event payload; the manager re-resolves its per-fd state from the
//! table on dispatch rather than trusting a raw pointer round-trip through
//! the kernel.

use std::io;
use std::os::fd::RawFd;

pub(crate) struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        log::debug!(target: "io", "epoll fd {} created", epfd);
        Ok(Poller { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            log::debug!(target: "io", "epoll_ctl({}, {}, {}, {:#x}): {}", self.epfd, op, fd, events, err);
            return Err(err);
        }
        log::trace!(target: "io", "epoll_ctl({}, {}, {}, {:#x})", self.epfd, op, fd, events);
        Ok(())
    }

    pub(crate) fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub(crate) fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Wait up to `timeout_ms` (-1 blocks indefinitely) for readiness.
    /// An interrupted wait surfaces as `ErrorKind::Interrupted`.
    pub(crate) fn wait(
        &self,
        events: &mut [libc::epoll_event],
        timeout_ms: i32,
    ) -> io::Result<usize> {
        let rc = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        log::debug!(target: "io", "epoll fd {} closed", self.epfd);
        unsafe {
            libc::close(self.epfd);
        }
    }
}

/// The self-pipe used to interrupt a kernel wait from another thread.
/// Only the read end is non-blocking; it is drained fully on each wake.
pub(crate) struct TicklePipe {
    read: RawFd,
    write: RawFd,
}

impl TicklePipe {
    pub(crate) fn new() -> io::Result<TicklePipe> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let pipe = TicklePipe {
            read: fds[0],
            write: fds[1],
        };
        let rc = unsafe { libc::fcntl(pipe.read, libc::F_SETFL, libc::O_NONBLOCK) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(pipe)
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read
    }

    /// Write the single wake byte.
    pub(crate) fn tickle(&self) {
        let rc = unsafe { libc::write(self.write, b"T".as_ptr() as *const libc::c_void, 1) };
        debug_assert_eq!(rc, 1);
    }

    /// Consume every buffered wake byte.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 256];
        loop {
            let rc = unsafe {
                libc::read(self.read, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if rc <= 0 {
                debug_assert!(
                    rc < 0 && io::Error::last_os_error().kind() == io::ErrorKind::WouldBlock
                );
                return;
            }
        }
    }
}

impl Drop for TicklePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tickle_pipe_round_trip() {
        let pipe = TicklePipe::new().unwrap();
        let poller = Poller::new().unwrap();
        poller
            .add(pipe.read_fd(), (libc::EPOLLIN as u32) | (libc::EPOLLET as u32))
            .unwrap();

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
        // Nothing pending yet.
        assert_eq!(poller.wait(&mut events, 0).unwrap(), 0);

        pipe.tickle();
        let n = poller.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        let event_u64 = events[0].u64;
        assert_eq!(event_u64, pipe.read_fd() as u64);
        pipe.drain();

        // Edge-triggered and drained: quiet again.
        assert_eq!(poller.wait(&mut events, 0).unwrap(), 0);
    }
}
