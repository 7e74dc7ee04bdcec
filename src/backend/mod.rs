//! Readiness-demultiplexing backends.
//!
//! The reactor is agnostic to which multiplexing syscall reports
//! readiness. It consumes a backend through the [`Demultiplexer`]
//! capability contract: register a descriptor with an interest mask, wait
//! up to a timeout, and receive the ordered set of ready descriptors. The
//! concrete implementation is chosen at [`Reactor`](crate::Reactor)
//! construction time, never by conditional compilation inside the core.
//!
//! # Implementations
//!
//! | Backend | Purpose |
//! |---------|---------|
//! | [`PollBackend`] | Production; wraps the `polling` crate (epoll/kqueue) |
//! | [`LabBackend`] | Deterministic injected readiness for tests |
//!
//! # Oneshot semantics
//!
//! Backends are allowed to disarm a descriptor after reporting it ready
//! (the production backend does). The reactor compensates by calling
//! [`Demultiplexer::reregister`] for every descriptor that fired and still
//! has pending interest at the end of a dispatch pass.

pub mod lab;
pub mod poll;

pub use lab::{LabBackend, LabController};
pub use poll::PollBackend;

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Interest flags indicating what readiness to monitor or what was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// No interest.
    pub const NONE: Interest = Interest(0);
    /// Interest in readable events.
    pub const READABLE: Interest = Interest(0b0001);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Interest(0b0010);
    /// An error condition was reported on the descriptor.
    pub const ERROR: Interest = Interest(0b0100);
    /// The peer hung up.
    pub const HUP: Interest = Interest(0b1000);

    /// Returns interest in both readable and writable events.
    #[must_use]
    pub const fn both() -> Self {
        Interest(Self::READABLE.0 | Self::WRITABLE.0)
    }

    /// Returns true if readable interest is set.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writable interest is set.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns true if an error condition is set.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    /// Returns true if hangup is set.
    #[must_use]
    pub const fn is_hup(&self) -> bool {
        self.0 & Self::HUP.0 != 0
    }

    /// Returns true if no flag is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Combines interests.
    #[must_use]
    pub const fn add(self, other: Interest) -> Self {
        Interest(self.0 | other.0)
    }

    /// Removes interest.
    #[must_use]
    pub const fn remove(self, other: Interest) -> Self {
        Interest(self.0 & !other.0)
    }

    /// Returns true if any flag of `other` is set in `self`.
    #[must_use]
    pub const fn intersects(&self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }
}

/// A single readiness notification reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// The descriptor that became ready.
    pub fd: RawFd,
    /// What it became ready for.
    pub ready: Interest,
}

impl Readiness {
    /// Creates a new readiness notification.
    #[must_use]
    pub const fn new(fd: RawFd, ready: Interest) -> Self {
        Self { fd, ready }
    }
}

/// Capability contract for OS readiness demultiplexing.
///
/// Implementations monitor registered descriptors and report which became
/// ready. All errors use `io::Error`; the reactor translates registration
/// failure at startup into a constructor error and treats later failures
/// as per-descriptor faults.
pub trait Demultiplexer {
    /// Registers a descriptor with the given interest.
    ///
    /// Fails with `io::ErrorKind::AlreadyExists` if the descriptor is
    /// already registered.
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Changes (or re-arms) the interest for a registered descriptor.
    ///
    /// Fails with `io::ErrorKind::NotFound` if the descriptor is not
    /// registered.
    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Removes a descriptor from the monitored set.
    fn unregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Waits up to `timeout` for readiness and appends notifications to
    /// `ready`. `None` blocks indefinitely; `Some(Duration::ZERO)` polls.
    ///
    /// Returns the number of notifications appended; `Ok(0)` on timeout.
    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Readiness>) -> io::Result<usize>;

    /// Number of currently registered descriptors.
    fn registered_count(&self) -> usize;
}
