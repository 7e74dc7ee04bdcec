//! Error types for riptide.
//!
//! Error handling follows two propagation paths:
//!
//! - Argument and allocation errors are returned synchronously from the
//!   call that caused them and never corrupt already-committed state (a
//!   failed append leaves a chain at its prior length).
//! - I/O errors and EOF on a watched descriptor are delivered
//!   asynchronously through the owning transport's event callback, because
//!   the dispatch loop is multiplexing many transports and one failed
//!   descriptor must not abort the pass for the others.

use std::io;

/// The error type for reactor and buffer operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A malformed mask, watermark, or timeout was supplied.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Allocation failed while growing a buffer chain.
    #[error("out of memory growing buffer chain")]
    OutOfMemory,

    /// A drain or move requested more bytes than the chain holds.
    #[error("insufficient data: requested {requested}, available {available}")]
    InsufficientData {
        /// Bytes the caller asked for.
        requested: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A syscall failed with something other than would-block.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection.
    #[error("end of stream")]
    Eof,

    /// An armed deadline elapsed without readiness.
    #[error("operation timed out")]
    Timeout,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error is fatal for the direction it occurred
    /// on (everything except would-block, which is never surfaced as an
    /// `Error`).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}
