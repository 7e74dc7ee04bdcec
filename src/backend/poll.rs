//! Production backend over the `polling` crate.
//!
//! [`PollBackend`] wraps [`polling::Poller`], which selects the best
//! multiplexing syscall for the platform (epoll on Linux, kqueue on BSD
//! and macOS). Descriptors are keyed by their raw fd value, so readiness
//! notifications map straight back to the reactor's per-fd registry.
//!
//! The poller delivers oneshot notifications: a descriptor is disarmed
//! once it fires. The reactor re-arms via
//! [`reregister`](super::Demultiplexer::reregister) after each dispatch
//! pass, which also keeps a slow callback from being interrupted by a
//! storm of repeat notifications for the same descriptor.

use super::{Demultiplexer, Interest, Readiness};
use polling::{Event as PollEvent, Poller};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Readiness backend built on [`polling::Poller`].
pub struct PollBackend {
    poller: Poller,
    /// Current interest per registered descriptor.
    registrations: HashMap<RawFd, Interest>,
    /// Scratch buffer reused across `wait` calls.
    scratch: Vec<PollEvent>,
}

impl PollBackend {
    /// Creates a new backend.
    ///
    /// # Errors
    ///
    /// Fails if the platform poller cannot be created (for example, out of
    /// file descriptors).
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            registrations: HashMap::new(),
            scratch: Vec::new(),
        })
    }

    /// Converts an interest mask to the poller's event type.
    fn interest_to_poll_event(fd: RawFd, interest: Interest) -> PollEvent {
        let key = usize::try_from(fd).unwrap_or(0);
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => PollEvent::all(key),
            (true, false) => PollEvent::readable(key),
            (false, true) => PollEvent::writable(key),
            (false, false) => PollEvent::none(key),
        }
    }

    /// Converts a poller event back to an interest mask.
    fn poll_event_to_interest(event: &PollEvent) -> Interest {
        let mut ready = Interest::NONE;
        if event.readable {
            ready = ready.add(Interest::READABLE);
        }
        if event.writable {
            ready = ready.add(Interest::WRITABLE);
        }
        ready
    }
}

impl Demultiplexer for PollBackend {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.registrations.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }
        self.poller
            .add(fd, Self::interest_to_poll_event(fd, interest))?;
        self.registrations.insert(fd, interest);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let slot = self.registrations.get_mut(&fd).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "descriptor not registered")
        })?;
        self.poller
            .modify(fd, Self::interest_to_poll_event(fd, interest))?;
        *slot = interest;
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.registrations.remove(&fd).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "descriptor not registered")
        })?;
        self.poller.delete(fd)
    }

    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Readiness>) -> io::Result<usize> {
        self.scratch.clear();
        match self.poller.wait(&mut self.scratch, timeout) {
            Ok(_) => {}
            // A signal during the wait is a spurious wakeup, not a fault.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let mut count = 0;
        for event in &self.scratch {
            let Ok(fd) = RawFd::try_from(event.key) else {
                continue;
            };
            let flags = Self::poll_event_to_interest(event);
            if flags.is_empty() {
                continue;
            }
            ready.push(Readiness::new(fd, flags));
            count += 1;
        }
        Ok(count)
    }

    fn registered_count(&self) -> usize {
        self.registrations.len()
    }
}

impl std::fmt::Debug for PollBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollBackend")
            .field("registered_count", &self.registrations.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn register_and_unregister() {
        init_test_logging();
        let mut backend = PollBackend::new().expect("create backend");
        let (a, _b) = UnixStream::pair().expect("socket pair");

        backend
            .register(a.as_raw_fd(), Interest::READABLE)
            .expect("register");
        assert_eq!(backend.registered_count(), 1);

        let err = backend
            .register(a.as_raw_fd(), Interest::WRITABLE)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        backend.unregister(a.as_raw_fd()).expect("unregister");
        assert_eq!(backend.registered_count(), 0);
        crate::test_complete!("register_and_unregister");
    }

    #[test]
    fn reregister_unknown_fd_fails() {
        init_test_logging();
        let mut backend = PollBackend::new().expect("create backend");
        let err = backend.reregister(999, Interest::READABLE).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        crate::test_complete!("reregister_unknown_fd_fails");
    }

    #[test]
    fn wait_reports_readable_socket() {
        init_test_logging();
        let mut backend = PollBackend::new().expect("create backend");
        let (a, mut b) = UnixStream::pair().expect("socket pair");
        a.set_nonblocking(true).expect("nonblocking");

        backend
            .register(a.as_raw_fd(), Interest::READABLE)
            .expect("register");

        b.write_all(b"ping").expect("write");

        let mut ready = Vec::new();
        let n = backend
            .wait(Some(Duration::from_secs(2)), &mut ready)
            .expect("wait");
        crate::assert_with_log!(n == 1, "one notification", 1, n);
        crate::assert_with_log!(
            ready[0].fd == a.as_raw_fd(),
            "fd matches",
            a.as_raw_fd(),
            ready[0].fd
        );
        assert!(ready[0].ready.is_readable());
        crate::test_complete!("wait_reports_readable_socket");
    }

    #[test]
    fn wait_times_out_with_no_events() {
        init_test_logging();
        let mut backend = PollBackend::new().expect("create backend");
        let mut ready = Vec::new();

        let start = Instant::now();
        let n = backend
            .wait(Some(Duration::from_millis(50)), &mut ready)
            .expect("wait");
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(40));
        crate::test_complete!("wait_times_out_with_no_events");
    }

    #[test]
    fn oneshot_requires_rearm() {
        init_test_logging();
        let mut backend = PollBackend::new().expect("create backend");
        let (a, mut b) = UnixStream::pair().expect("socket pair");
        a.set_nonblocking(true).expect("nonblocking");

        backend
            .register(a.as_raw_fd(), Interest::READABLE)
            .expect("register");
        b.write_all(b"x").expect("write");

        let mut ready = Vec::new();
        backend
            .wait(Some(Duration::from_secs(2)), &mut ready)
            .expect("first wait");
        assert_eq!(ready.len(), 1);

        // Without a re-arm the second wait must time out even though data
        // still sits in the socket buffer.
        ready.clear();
        let n = backend
            .wait(Some(Duration::from_millis(50)), &mut ready)
            .expect("second wait");
        assert_eq!(n, 0);

        backend
            .reregister(a.as_raw_fd(), Interest::READABLE)
            .expect("rearm");
        let n = backend
            .wait(Some(Duration::from_secs(2)), &mut ready)
            .expect("third wait");
        crate::assert_with_log!(n == 1, "fires after rearm", 1, n);
        crate::test_complete!("oneshot_requires_rearm");
    }
}
