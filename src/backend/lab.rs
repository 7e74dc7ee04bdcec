//! Deterministic backend with injected readiness, for tests.
//!
//! [`LabBackend`] never touches the OS. Tests hold a [`LabController`] and
//! inject readiness notifications; `wait` drains whatever injected
//! notifications match a current registration and otherwise sleeps out its
//! timeout. This makes dispatch-order, self-removal, and persistence
//! semantics testable without real sockets.
//!
//! ```
//! use riptide::backend::{Demultiplexer, Interest, LabBackend};
//! use std::time::Duration;
//!
//! let (mut backend, controller) = LabBackend::new();
//! backend.register(5, Interest::READABLE).unwrap();
//! controller.inject(5, Interest::READABLE);
//!
//! let mut ready = Vec::new();
//! let n = backend.wait(Some(Duration::ZERO), &mut ready).unwrap();
//! assert_eq!(n, 1);
//! assert_eq!(ready[0].fd, 5);
//! ```

use super::{Demultiplexer, Interest, Readiness};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Injected {
    queue: VecDeque<Readiness>,
}

/// Test-side handle used to inject readiness into a [`LabBackend`].
#[derive(Debug, Clone)]
pub struct LabController {
    injected: Arc<Mutex<Injected>>,
}

impl LabController {
    /// Queues a readiness notification for `fd`.
    ///
    /// The notification is delivered by the next `wait` call, provided the
    /// descriptor is still registered with an intersecting interest at
    /// that point.
    pub fn inject(&self, fd: RawFd, ready: Interest) {
        self.injected.lock().queue.push_back(Readiness::new(fd, ready));
    }

    /// Number of injected notifications not yet delivered.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.injected.lock().queue.len()
    }
}

/// Deterministic readiness backend for tests.
#[derive(Debug)]
pub struct LabBackend {
    registrations: HashMap<RawFd, Interest>,
    injected: Arc<Mutex<Injected>>,
}

impl LabBackend {
    /// Creates a backend plus the controller that feeds it.
    #[must_use]
    pub fn new() -> (Self, LabController) {
        let injected = Arc::new(Mutex::new(Injected::default()));
        (
            Self {
                registrations: HashMap::new(),
                injected: Arc::clone(&injected),
            },
            LabController { injected },
        )
    }
}

impl Demultiplexer for LabBackend {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.registrations.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }
        self.registrations.insert(fd, interest);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self.registrations.get_mut(&fd) {
            Some(slot) => {
                *slot = interest;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor not registered",
            )),
        }
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.registrations.remove(&fd).map(|_| ()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "descriptor not registered")
        })
    }

    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Readiness>) -> io::Result<usize> {
        let mut count = 0;
        {
            let mut injected = self.injected.lock();
            // Deliver injected notifications in order, keeping the ones
            // whose descriptor is unknown or masked off queued for later.
            let mut retained = VecDeque::new();
            while let Some(notification) = injected.queue.pop_front() {
                let matches = self
                    .registrations
                    .get(&notification.fd)
                    .is_some_and(|interest| {
                        notification.ready.intersects(
                            interest.add(Interest::ERROR).add(Interest::HUP),
                        )
                    });
                if matches {
                    ready.push(notification);
                    count += 1;
                } else {
                    retained.push_back(notification);
                }
            }
            injected.queue = retained;
        }

        if count == 0 {
            if let Some(timeout) = timeout {
                if !timeout.is_zero() {
                    std::thread::sleep(timeout);
                }
            }
        }
        Ok(count)
    }

    fn registered_count(&self) -> usize {
        self.registrations.len()
    }
}
