//! Riptide: reactor-pattern event notification with buffered transports.
//!
//! # Overview
//!
//! Riptide lets a process register interest in descriptor readiness and in
//! timers, wait efficiently for whichever becomes ready first, and dispatch
//! user callbacks. Layered above the raw reactor is a buffered-transport
//! abstraction that turns readiness notifications into byte-stream
//! semantics: incoming bytes accumulate in an input [`BufferChain`] and a
//! callback fires once a configurable amount has accumulated; outgoing
//! bytes queue in an output chain and a callback fires once the queue
//! drains below a configurable level.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         Reactor                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │ Event Slab  │  │ Timer Heap  │  │  Demultiplexer backend  │ │
//! │  │ (registry)  │  │ (deadlines) │  │  (polling / lab)        │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! └──────────────────────────────┬─────────────────────────────────┘
//!                                │ readiness / timeouts
//!                ┌───────────────▼────────────────┐
//!                │        BufferedTransport        │
//!                │  input chain ── watermarks ──   │
//!                │  output chain ─ callbacks  ──   │
//!                └─────────────────────────────────┘
//! ```
//!
//! # Core Guarantees
//!
//! - **Single-threaded dispatch**: callbacks run to completion on the
//!   thread that called [`Reactor::run`]; no implicit parallelism.
//! - **Safe self-removal**: a callback may remove, re-add, or drop the
//!   very event that is invoking it.
//! - **No timer starvation**: every timer whose deadline has passed when a
//!   wait begins fires in that same iteration, even under continuous I/O
//!   readiness.
//! - **Asynchronous I/O failure delivery**: a failing descriptor reports
//!   through its transport's event callback and is disabled for the
//!   failing direction; it never aborts the dispatch pass for others.
//!
//! # Module Structure
//!
//! - [`backend`]: The [`Demultiplexer`](backend::Demultiplexer) capability
//!   trait and its production/test implementations
//! - [`buffer`]: Segmented append/drain-optimized byte container
//! - [`error`]: Error types
//! - [`event`]: Event masks and the registration slab
//! - [`reactor`]: The event base and its wait/dispatch loop
//! - [`timer`]: Deadline min-heap
//! - [`transport`]: Watermark-gated buffered transport
//!
//! # Example
//!
//! ```no_run
//! use riptide::{Reactor, transport::BufferedTransport};
//! use std::os::unix::net::UnixStream;
//!
//! # fn main() -> riptide::Result<()> {
//! let reactor = Reactor::new()?;
//! let (a, b) = UnixStream::pair()?;
//! a.set_nonblocking(true)?;
//!
//! let bev = BufferedTransport::new(&reactor, a)?;
//! bev.set_callbacks(
//!     |t| {
//!         let n = t.input().len();
//!         tracing::info!(bytes = n, "readable");
//!     },
//!     |_t| {},
//!     |_t, ev| tracing::info!(?ev, "transport event"),
//! );
//! bev.enable(riptide::Direction::Read)?;
//! reactor.run()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod backend;
pub mod buffer;
pub mod error;
pub mod event;
pub mod reactor;
pub mod test_utils;
pub mod timer;
pub mod transport;

pub use backend::{Demultiplexer, Interest, Readiness};
pub use buffer::BufferChain;
pub use error::{Error, Result};
pub use event::EventMask;
pub use reactor::{Event, Reactor};
pub use transport::{BufferedTransport, Direction, TransportEvents, Watermark};
