//! Buffered transport: watermark-gated buffered I/O over one descriptor.
//!
//! A [`BufferedTransport`] owns a nonblocking byte stream and a pair of
//! [`BufferChain`]s. While a direction is enabled the transport keeps a
//! persistent reactor event armed for it; each readiness notification
//! performs exactly one `read` or `write` attempt and then consults the
//! direction's [`Watermark`] to decide whether to invoke the user
//! callback, keep waiting, or park the event.
//!
//! # Watermark rules
//!
//! - Read: `on_readable` fires when the input chain holds at least
//!   `max(low, 1)` bytes. The input chain is never filled beyond the high
//!   watermark; at the high mark the read event is parked until the user
//!   drains below it. `high == 0` means unlimited.
//! - Write: `on_writable` fires after a write attempt leaves the output
//!   chain at or below the low watermark (the comparison is configurable,
//!   see [`set_write_low_inclusive`](BufferedTransport::set_write_low_inclusive)).
//!   An empty output chain parks the write event; the next
//!   [`write`](BufferedTransport::write) re-arms it.
//!
//! End of stream, fatal I/O errors, and per-direction timeouts disable
//! the affected direction and are reported through the `on_event`
//! callback as [`TransportEvents`] flags; already-buffered input stays
//! readable throughout.

use crate::buffer::BufferChain;
use crate::error::{Error, Result};
use crate::event::EventMask;
use crate::reactor::{Event, Reactor};
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

/// The I/O object a transport drives: a byte stream with a raw
/// descriptor for readiness registration. Blanket-implemented.
pub trait TransportIo: Read + Write + AsRawFd {}

impl<T: Read + Write + AsRawFd> TransportIo for T {}

/// One side of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The socket-to-input-chain side.
    Read,
    /// The output-chain-to-socket side.
    Write,
}

/// Per-direction callback gating thresholds, in bytes.
///
/// `high == 0` means no high limit; `low == 0` means "any amount" for
/// reads and "fully drained" for writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
    /// Minimum level before the data callback fires.
    pub low: usize,
    /// Maximum level; reads stop filling at this level.
    pub high: usize,
}

/// Condition flags delivered to the `on_event` callback.
///
/// A delivery combines one direction flag with one condition flag, e.g.
/// `READING | EOF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportEvents(u8);

impl TransportEvents {
    /// Empty flag set.
    pub const NONE: TransportEvents = TransportEvents(0);
    /// The condition arose on the read side.
    pub const READING: TransportEvents = TransportEvents(0x01);
    /// The condition arose on the write side.
    pub const WRITING: TransportEvents = TransportEvents(0x02);
    /// The peer closed the stream.
    pub const EOF: TransportEvents = TransportEvents(0x10);
    /// A fatal I/O error occurred; see
    /// [`BufferedTransport::take_error`].
    pub const ERROR: TransportEvents = TransportEvents(0x20);
    /// The direction's timeout elapsed without progress.
    pub const TIMEOUT: TransportEvents = TransportEvents(0x40);

    /// Combines flag sets.
    #[must_use]
    pub const fn add(self, other: TransportEvents) -> Self {
        TransportEvents(self.0 | other.0)
    }

    /// Returns true if any flag of `other` is set.
    #[must_use]
    pub const fn intersects(&self, other: TransportEvents) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if the read-side flag is set.
    #[must_use]
    pub const fn is_reading(&self) -> bool {
        self.intersects(Self::READING)
    }

    /// Returns true if the write-side flag is set.
    #[must_use]
    pub const fn is_writing(&self) -> bool {
        self.intersects(Self::WRITING)
    }

    /// Returns true if the end-of-stream flag is set.
    #[must_use]
    pub const fn is_eof(&self) -> bool {
        self.intersects(Self::EOF)
    }

    /// Returns true if the error flag is set.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.intersects(Self::ERROR)
    }

    /// Returns true if the timeout flag is set.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        self.intersects(Self::TIMEOUT)
    }
}

impl std::ops::BitOr for TransportEvents {
    type Output = TransportEvents;

    fn bitor(self, rhs: TransportEvents) -> TransportEvents {
        self.add(rhs)
    }
}

type DataCallback = Box<dyn FnMut(&BufferedTransport)>;
type EventCallback = Box<dyn FnMut(&BufferedTransport, TransportEvents)>;

/// User callbacks. Each is taken out for the duration of its invocation
/// so a callback may replace the set re-entrantly.
#[derive(Default)]
struct Callbacks {
    on_readable: Option<DataCallback>,
    on_writable: Option<DataCallback>,
    on_event: Option<EventCallback>,
}

struct State {
    read_enabled: bool,
    write_enabled: bool,
    closed: bool,
    read_wm: Watermark,
    write_wm: Watermark,
    write_low_inclusive: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_event: Option<Event>,
    write_event: Option<Event>,
    last_error: Option<io::Error>,
}

pub(crate) struct Shared {
    fd: RawFd,
    io: RefCell<Option<Box<dyn TransportIo>>>,
    input: BufferChain,
    output: BufferChain,
    state: RefCell<State>,
    callbacks: RefCell<Callbacks>,
}

impl Shared {
    /// Bytes the input chain may still take below the high watermark.
    fn read_capacity(&self, state: &State) -> usize {
        if state.read_wm.high == 0 {
            usize::MAX
        } else {
            state.read_wm.high.saturating_sub(self.input.len())
        }
    }

    /// Reconciles the read event with enablement and the high watermark.
    fn sync_read_interest(&self) -> Result<()> {
        let state = self.state.borrow();
        let should = !state.closed && state.read_enabled && self.read_capacity(&state) > 0;
        let Some(event) = state.read_event.as_ref() else {
            return Ok(());
        };
        if should {
            if !event.is_pending() {
                event.add(state.read_timeout)?;
            }
        } else if event.is_pending() {
            event.remove();
        }
        Ok(())
    }

    /// Reconciles the write event: armed only while enabled with bytes to
    /// flush.
    fn sync_write_interest(&self) -> Result<()> {
        let state = self.state.borrow();
        let should = !state.closed && state.write_enabled && !self.output.is_empty();
        let Some(event) = state.write_event.as_ref() else {
            return Ok(());
        };
        if should {
            if !event.is_pending() {
                event.add(state.write_timeout)?;
            }
        } else if event.is_pending() {
            event.remove();
        }
        Ok(())
    }

    fn poke_read(&self) {
        if let Err(e) = self.sync_read_interest() {
            tracing::warn!(fd = self.fd, error = %e, "failed to re-arm read interest");
        }
    }

    fn poke_write(&self) {
        if let Err(e) = self.sync_write_interest() {
            tracing::warn!(fd = self.fd, error = %e, "failed to re-arm write interest");
        }
    }

    fn disable_direction(&self, direction: Direction) {
        let mut state = self.state.borrow_mut();
        match direction {
            Direction::Read => state.read_enabled = false,
            Direction::Write => state.write_enabled = false,
        }
        let event = match direction {
            Direction::Read => state.read_event.as_ref(),
            Direction::Write => state.write_event.as_ref(),
        };
        if let Some(event) = event {
            event.remove();
        }
    }

    fn fire_readable(shared: &Rc<Shared>) {
        let taken = shared.callbacks.borrow_mut().on_readable.take();
        if let Some(mut callback) = taken {
            let handle = BufferedTransport {
                shared: Rc::clone(shared),
            };
            callback(&handle);
            let mut callbacks = shared.callbacks.borrow_mut();
            if callbacks.on_readable.is_none() {
                callbacks.on_readable = Some(callback);
            }
        }
    }

    fn fire_writable(shared: &Rc<Shared>) {
        let taken = shared.callbacks.borrow_mut().on_writable.take();
        if let Some(mut callback) = taken {
            let handle = BufferedTransport {
                shared: Rc::clone(shared),
            };
            callback(&handle);
            let mut callbacks = shared.callbacks.borrow_mut();
            if callbacks.on_writable.is_none() {
                callbacks.on_writable = Some(callback);
            }
        }
    }

    fn fire_event(shared: &Rc<Shared>, events: TransportEvents) {
        let taken = shared.callbacks.borrow_mut().on_event.take();
        if let Some(mut callback) = taken {
            let handle = BufferedTransport {
                shared: Rc::clone(shared),
            };
            callback(&handle, events);
            let mut callbacks = shared.callbacks.borrow_mut();
            if callbacks.on_event.is_none() {
                callbacks.on_event = Some(callback);
            }
        }
    }

    /// One readiness notification on the read side: one `read` attempt,
    /// then watermark evaluation.
    fn handle_read_ready(shared: &Rc<Shared>) {
        let (enabled, closed, low) = {
            let state = shared.state.borrow();
            (state.read_enabled, state.closed, state.read_wm.low)
        };
        if closed || !enabled {
            return;
        }
        let capacity = shared.read_capacity(&shared.state.borrow());
        if capacity == 0 {
            shared.poke_read();
            return;
        }
        let result = {
            let mut io = shared.io.borrow_mut();
            match io.as_mut() {
                Some(io) => shared.input.read_once_from(&mut **io, capacity),
                None => return,
            }
        };
        match result {
            Ok(0) => {
                tracing::debug!(fd = shared.fd, "end of stream");
                shared.disable_direction(Direction::Read);
                Self::fire_event(shared, TransportEvents::READING | TransportEvents::EOF);
            }
            Ok(n) => {
                tracing::trace!(fd = shared.fd, bytes = n, "filled input chain");
                if shared.input.len() >= low.max(1) {
                    Self::fire_readable(shared);
                }
                // The callback may have drained, disabled, or closed; the
                // event parks at the high mark either way.
                shared.poke_read();
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::debug!(fd = shared.fd, error = %e, "read failed");
                shared.state.borrow_mut().last_error = Some(e);
                shared.disable_direction(Direction::Read);
                Self::fire_event(shared, TransportEvents::READING | TransportEvents::ERROR);
            }
        }
    }

    /// One readiness notification on the write side: one `write` attempt
    /// from the head of the output chain.
    fn handle_write_ready(shared: &Rc<Shared>) {
        let (enabled, closed, low, inclusive) = {
            let state = shared.state.borrow();
            (
                state.write_enabled,
                state.closed,
                state.write_wm.low,
                state.write_low_inclusive,
            )
        };
        if closed || !enabled {
            return;
        }
        if shared.output.is_empty() {
            shared.poke_write();
            return;
        }
        let result = {
            let mut io = shared.io.borrow_mut();
            match io.as_mut() {
                Some(io) => shared.output.write_once_to(&mut **io),
                None => return,
            }
        };
        match result {
            Ok(0) => {
                shared.state.borrow_mut().last_error =
                    Some(io::Error::from(io::ErrorKind::WriteZero));
                shared.disable_direction(Direction::Write);
                Self::fire_event(shared, TransportEvents::WRITING | TransportEvents::ERROR);
            }
            Ok(n) => {
                tracing::trace!(fd = shared.fd, bytes = n, "flushed output chain");
                let len = shared.output.len();
                let fire = if inclusive { len <= low } else { len < low };
                if fire {
                    Self::fire_writable(shared);
                }
                shared.poke_write();
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::debug!(fd = shared.fd, error = %e, "write failed");
                shared.state.borrow_mut().last_error = Some(e);
                shared.disable_direction(Direction::Write);
                Self::fire_event(shared, TransportEvents::WRITING | TransportEvents::ERROR);
            }
        }
    }

    /// A direction went idle past its deadline: the direction is disabled
    /// and the condition reported. The descriptor stays open.
    fn handle_timeout(shared: &Rc<Shared>, direction: Direction) {
        let (enabled, closed) = {
            let state = shared.state.borrow();
            match direction {
                Direction::Read => (state.read_enabled, state.closed),
                Direction::Write => (state.write_enabled, state.closed),
            }
        };
        if closed || !enabled {
            return;
        }
        tracing::debug!(fd = shared.fd, ?direction, "transport timeout");
        shared.disable_direction(direction);
        let flag = match direction {
            Direction::Read => TransportEvents::READING,
            Direction::Write => TransportEvents::WRITING,
        };
        Self::fire_event(shared, flag | TransportEvents::TIMEOUT);
    }
}

/// Watermark-gated buffered I/O over one nonblocking descriptor.
///
/// Cloning (cheap) and the handles returned by
/// [`input`](Self::input)/[`output`](Self::output) all refer to the same
/// transport; the descriptor closes when the last reference is gone or
/// [`close`](Self::close) is called.
///
/// A transport starts with the write side enabled (it only does work
/// once the output chain holds bytes) and the read side disabled.
#[derive(Clone)]
pub struct BufferedTransport {
    shared: Rc<Shared>,
}

impl BufferedTransport {
    /// Wraps `io`, which must already be nonblocking, and binds its
    /// readiness events to `reactor`. Nothing is armed until a direction
    /// with work is enabled.
    pub fn new(reactor: &Reactor, io: impl TransportIo + 'static) -> Result<BufferedTransport> {
        let fd = io.as_raw_fd();
        let shared = Rc::new(Shared {
            fd,
            io: RefCell::new(Some(Box::new(io))),
            input: BufferChain::new(),
            output: BufferChain::new(),
            state: RefCell::new(State {
                read_enabled: false,
                write_enabled: true,
                closed: false,
                read_wm: Watermark::default(),
                write_wm: Watermark::default(),
                write_low_inclusive: true,
                read_timeout: None,
                write_timeout: None,
                read_event: None,
                write_event: None,
                last_error: None,
            }),
            callbacks: RefCell::new(Callbacks::default()),
        });

        let weak = Rc::downgrade(&shared);
        let read_event = Event::new(
            reactor,
            Some(fd),
            EventMask::READ | EventMask::PERSIST,
            move |mask| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if mask.is_read() {
                    Shared::handle_read_ready(&shared);
                } else if mask.is_timeout() {
                    Shared::handle_timeout(&shared, Direction::Read);
                }
            },
        )?;
        let weak = Rc::downgrade(&shared);
        let write_event = Event::new(
            reactor,
            Some(fd),
            EventMask::WRITE | EventMask::PERSIST,
            move |mask| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if mask.is_write() {
                    Shared::handle_write_ready(&shared);
                } else if mask.is_timeout() {
                    Shared::handle_timeout(&shared, Direction::Write);
                }
            },
        )?;
        {
            let mut state = shared.state.borrow_mut();
            state.read_event = Some(read_event);
            state.write_event = Some(write_event);
        }
        Ok(BufferedTransport { shared })
    }

    /// Installs the callback set, replacing any previous one.
    ///
    /// `on_readable` fires when the input chain crosses its low
    /// watermark; `on_writable` when the output chain drains to its low
    /// watermark; `on_event` reports EOF, errors, and timeouts.
    pub fn set_callbacks<R, W, E>(&self, on_readable: R, on_writable: W, on_event: E)
    where
        R: FnMut(&BufferedTransport) + 'static,
        W: FnMut(&BufferedTransport) + 'static,
        E: FnMut(&BufferedTransport, TransportEvents) + 'static,
    {
        let mut callbacks = self.shared.callbacks.borrow_mut();
        callbacks.on_readable = Some(Box::new(on_readable));
        callbacks.on_writable = Some(Box::new(on_writable));
        callbacks.on_event = Some(Box::new(on_event));
    }

    /// Enables a direction, arming its event if it has work to do.
    pub fn enable(&self, direction: Direction) -> Result<()> {
        {
            let mut state = self.shared.state.borrow_mut();
            if state.closed {
                return Err(Error::InvalidArgument("transport closed"));
            }
            match direction {
                Direction::Read => state.read_enabled = true,
                Direction::Write => state.write_enabled = true,
            }
        }
        match direction {
            Direction::Read => self.shared.sync_read_interest(),
            Direction::Write => self.shared.sync_write_interest(),
        }
    }

    /// Disables a direction. Buffered input bytes stay readable; buffered
    /// output stays queued for a later re-enable.
    pub fn disable(&self, direction: Direction) {
        self.shared.disable_direction(direction);
    }

    /// Returns true if the direction is currently enabled.
    #[must_use]
    pub fn is_enabled(&self, direction: Direction) -> bool {
        let state = self.shared.state.borrow();
        match direction {
            Direction::Read => state.read_enabled,
            Direction::Write => state.write_enabled,
        }
    }

    /// Sets a direction's watermarks.
    ///
    /// Fails with [`Error::InvalidArgument`] if `high != 0 && low > high`.
    pub fn set_watermark(&self, direction: Direction, low: usize, high: usize) -> Result<()> {
        if high != 0 && low > high {
            return Err(Error::InvalidArgument("low watermark exceeds high"));
        }
        {
            let mut state = self.shared.state.borrow_mut();
            match direction {
                Direction::Read => state.read_wm = Watermark { low, high },
                Direction::Write => state.write_wm = Watermark { low, high },
            }
        }
        if direction == Direction::Read {
            // A lowered high mark can park reads; a raised one resumes.
            self.shared.sync_read_interest()?;
        }
        Ok(())
    }

    /// Selects the write-side low watermark comparison: inclusive
    /// (`len <= low`, the default) or strict (`len < low`).
    pub fn set_write_low_inclusive(&self, inclusive: bool) {
        self.shared.state.borrow_mut().write_low_inclusive = inclusive;
    }

    /// Sets or clears a direction's inactivity timeout.
    ///
    /// An armed direction is rescheduled immediately; when the timeout
    /// elapses without progress, `on_event` receives the direction flag
    /// plus [`TransportEvents::TIMEOUT`] and the direction is disabled.
    pub fn set_timeout(&self, direction: Direction, timeout: Option<Duration>) -> Result<()> {
        let state = self.shared.state.borrow();
        let event = match direction {
            Direction::Read => state.read_event.as_ref(),
            Direction::Write => state.write_event.as_ref(),
        };
        if let Some(event) = event {
            if event.is_pending() {
                event.add(timeout)?;
            }
        }
        drop(state);
        let mut state = self.shared.state.borrow_mut();
        match direction {
            Direction::Read => state.read_timeout = timeout,
            Direction::Write => state.write_timeout = timeout,
        }
        Ok(())
    }

    /// Appends bytes to the output chain and arms the write side if
    /// enabled.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.shared.state.borrow().closed {
            return Err(Error::InvalidArgument("transport closed"));
        }
        self.shared.output.append(bytes)?;
        self.shared.sync_write_interest()
    }

    /// Removes and returns exactly `n` bytes from the input chain.
    ///
    /// Draining below the read high watermark resumes a parked read.
    pub fn read(&self, n: usize) -> Result<Vec<u8>> {
        let bytes = self.shared.input.remove(n)?;
        self.shared.poke_read();
        Ok(bytes)
    }

    /// Handle onto the input chain.
    #[must_use]
    pub fn input(&self) -> InputChain {
        InputChain {
            shared: Rc::clone(&self.shared),
        }
    }

    /// Handle onto the output chain.
    #[must_use]
    pub fn output(&self) -> OutputChain {
        OutputChain {
            shared: Rc::clone(&self.shared),
        }
    }

    /// Takes the `io::Error` behind the most recent
    /// [`TransportEvents::ERROR`] delivery.
    #[must_use]
    pub fn take_error(&self) -> Option<io::Error> {
        self.shared.state.borrow_mut().last_error.take()
    }

    /// Detaches both events and closes the descriptor. Idempotent; safe
    /// from inside any of this transport's callbacks. Buffered input
    /// remains readable through [`read`](Self::read).
    pub fn close(&self) {
        let io = {
            let mut state = self.shared.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            state.read_enabled = false;
            state.write_enabled = false;
            if let Some(event) = state.read_event.as_ref() {
                event.remove();
            }
            if let Some(event) = state.write_event.as_ref() {
                event.remove();
            }
            self.shared.io.borrow_mut().take()
        };
        drop(io);
        tracing::debug!(fd = self.shared.fd, "transport closed");
    }
}

impl std::fmt::Debug for BufferedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedTransport")
            .field("fd", &self.shared.fd)
            .field("input_len", &self.shared.input.len())
            .field("output_len", &self.shared.output.len())
            .finish_non_exhaustive()
    }
}

/// Handle onto a transport's input chain. Draining operations resume a
/// read parked at the high watermark.
pub struct InputChain {
    shared: Rc<Shared>,
}

impl InputChain {
    /// Bytes buffered and not yet consumed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.input.len()
    }

    /// Returns true if no input is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.input.is_empty()
    }

    /// Number of segments in the chain.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.shared.input.segment_count()
    }

    /// Zero-copy views of the first `n` bytes; see
    /// [`BufferChain::peek_with`].
    pub fn peek_with<R>(&self, n: usize, f: impl FnOnce(&[&[u8]]) -> R) -> Result<R> {
        self.shared.input.peek_with(n, f)
    }

    /// Removes and returns the first `n` bytes.
    pub fn remove(&self, n: usize) -> Result<Vec<u8>> {
        let bytes = self.shared.input.remove(n)?;
        self.shared.poke_read();
        Ok(bytes)
    }

    /// Discards the first `n` bytes.
    pub fn drain(&self, n: usize) -> Result<()> {
        self.shared.input.drain(n)?;
        self.shared.poke_read();
        Ok(())
    }

    /// Moves the first `n` bytes into `other`; see
    /// [`BufferChain::move_to`].
    pub fn move_to(&self, other: &BufferChain, n: usize) -> Result<()> {
        self.shared.input.move_to(other, n)?;
        self.shared.poke_read();
        Ok(())
    }
}

/// Handle onto a transport's output chain. Appending re-arms a write
/// event parked on an empty chain.
pub struct OutputChain {
    shared: Rc<Shared>,
}

impl OutputChain {
    /// Bytes queued and not yet flushed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.output.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.output.is_empty()
    }

    /// Number of segments in the chain.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.shared.output.segment_count()
    }

    /// Queues bytes for writing.
    pub fn append(&self, bytes: &[u8]) -> Result<()> {
        self.shared.output.append(bytes)?;
        self.shared.poke_write();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Interest, LabBackend, LabController};
    use crate::test_utils::init_test_logging;
    use std::cell::Cell;
    use std::collections::VecDeque;

    /// Scripted byte stream: reads pop queued results, writes accept up
    /// to a per-call budget.
    struct ScriptState {
        reads: VecDeque<io::Result<Vec<u8>>>,
        written: Vec<u8>,
        accept: usize,
    }

    struct ScriptedIo {
        fd: RawFd,
        state: Rc<RefCell<ScriptState>>,
    }

    impl Read for ScriptedIo {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.state.borrow_mut();
            match state.reads.pop_front() {
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
                Some(Err(e)) => Err(e),
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        state.reads.push_front(Ok(data[n..].to_vec()));
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for ScriptedIo {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut state = self.state.borrow_mut();
            let n = buf.len().min(state.accept);
            if n == 0 && !buf.is_empty() {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            state.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AsRawFd for ScriptedIo {
        fn as_raw_fd(&self) -> RawFd {
            self.fd
        }
    }

    struct Fixture {
        reactor: Reactor,
        controller: LabController,
        transport: BufferedTransport,
        script: Rc<RefCell<ScriptState>>,
    }

    const FD: RawFd = 21;

    fn fixture() -> Fixture {
        let (backend, controller) = LabBackend::new();
        let reactor = Reactor::builder()
            .backend(backend)
            .build()
            .expect("build reactor");
        let script = Rc::new(RefCell::new(ScriptState {
            reads: VecDeque::new(),
            written: Vec::new(),
            accept: usize::MAX,
        }));
        let io = ScriptedIo {
            fd: FD,
            state: Rc::clone(&script),
        };
        let transport = BufferedTransport::new(&reactor, io).expect("create transport");
        Fixture {
            reactor,
            controller,
            transport,
            script,
        }
    }

    fn counting_callbacks(
        transport: &BufferedTransport,
    ) -> (Rc<Cell<usize>>, Rc<Cell<usize>>, Rc<Cell<TransportEvents>>) {
        let readable = Rc::new(Cell::new(0));
        let writable = Rc::new(Cell::new(0));
        let events = Rc::new(Cell::new(TransportEvents::NONE));
        let r = Rc::clone(&readable);
        let w = Rc::clone(&writable);
        let e = Rc::clone(&events);
        transport.set_callbacks(
            move |_| r.set(r.get() + 1),
            move |_| w.set(w.get() + 1),
            move |_, flags| e.set(e.get().add(flags)),
        );
        (readable, writable, events)
    }

    #[test]
    fn readiness_fills_input_and_fires_on_readable() {
        init_test_logging();
        let fx = fixture();
        let (readable, _writable, _events) = counting_callbacks(&fx.transport);
        fx.transport.enable(Direction::Read).expect("enable");

        fx.script.borrow_mut().reads.push_back(Ok(b"hello".to_vec()));
        fx.controller.inject(FD, Interest::READABLE);
        fx.reactor.run_once().expect("run");

        crate::assert_with_log!(readable.get() == 1, "on_readable fired", 1, readable.get());
        assert_eq!(fx.transport.read(5).expect("read"), b"hello");
        crate::test_complete!("readiness_fills_input_and_fires_on_readable");
    }

    #[test]
    fn low_watermark_defers_on_readable_until_reached() {
        init_test_logging();
        let fx = fixture();
        let (readable, _writable, _events) = counting_callbacks(&fx.transport);
        fx.transport
            .set_watermark(Direction::Read, 10, 0)
            .expect("watermark");
        fx.transport.enable(Direction::Read).expect("enable");

        fx.script.borrow_mut().reads.push_back(Ok(b"abc".to_vec()));
        fx.controller.inject(FD, Interest::READABLE);
        fx.reactor.run_once().expect("first run");
        crate::assert_with_log!(readable.get() == 0, "below low, deferred", 0, readable.get());
        assert_eq!(fx.transport.input().len(), 3);

        fx.script
            .borrow_mut()
            .reads
            .push_back(Ok(b"defghij".to_vec()));
        fx.controller.inject(FD, Interest::READABLE);
        fx.reactor.run_once().expect("second run");
        crate::assert_with_log!(readable.get() == 1, "at low, fired", 1, readable.get());
        assert_eq!(fx.transport.read(10).expect("read"), b"abcdefghij");
        crate::test_complete!("low_watermark_defers_on_readable_until_reached");
    }

    #[test]
    fn high_watermark_caps_reads_and_parks_until_drained() {
        init_test_logging();
        let fx = fixture();
        let (readable, _writable, _events) = counting_callbacks(&fx.transport);
        fx.transport
            .set_watermark(Direction::Read, 0, 8)
            .expect("watermark");
        fx.transport.enable(Direction::Read).expect("enable");

        fx.script.borrow_mut().reads.push_back(Ok(vec![9u8; 100]));
        fx.controller.inject(FD, Interest::READABLE);
        fx.reactor.run_once().expect("run");

        // One read attempt, capped to the remaining room below high.
        crate::assert_with_log!(
            fx.transport.input().len() == 8,
            "capped at high",
            8,
            fx.transport.input().len()
        );
        assert_eq!(readable.get(), 1);
        // Parked at the high mark.
        assert_eq!(fx.reactor.pending_events(), 0);

        // Draining below high resumes the read event.
        fx.transport.read(4).expect("drain");
        assert_eq!(fx.reactor.pending_events(), 1);
        crate::test_complete!("high_watermark_caps_reads_and_parks_until_drained");
    }

    #[test]
    fn eof_disables_read_and_reports_event() {
        init_test_logging();
        let fx = fixture();
        let (readable, _writable, events) = counting_callbacks(&fx.transport);
        fx.transport.enable(Direction::Read).expect("enable");

        fx.script.borrow_mut().reads.push_back(Ok(b"tail".to_vec()));
        fx.script.borrow_mut().reads.push_back(Ok(Vec::new()));
        fx.controller.inject(FD, Interest::READABLE);
        fx.reactor.run_once().expect("data run");
        fx.controller.inject(FD, Interest::READABLE);
        fx.reactor.run_once().expect("eof run");

        assert!(events.get().is_eof());
        assert!(events.get().is_reading());
        assert!(!fx.transport.is_enabled(Direction::Read));
        // Already-buffered bytes stay readable after EOF.
        assert_eq!(readable.get(), 1);
        assert_eq!(fx.transport.read(4).expect("buffered"), b"tail");
        crate::test_complete!("eof_disables_read_and_reports_event");
    }

    #[test]
    fn read_error_disables_direction_and_is_takeable() {
        init_test_logging();
        let fx = fixture();
        let (_readable, _writable, events) = counting_callbacks(&fx.transport);
        fx.transport.enable(Direction::Read).expect("enable");

        fx.script
            .borrow_mut()
            .reads
            .push_back(Err(io::Error::from(io::ErrorKind::ConnectionReset)));
        fx.controller.inject(FD, Interest::READABLE);
        fx.reactor.run_once().expect("run");

        assert!(events.get().is_error());
        assert!(events.get().is_reading());
        assert!(!fx.transport.is_enabled(Direction::Read));
        let err = fx.transport.take_error().expect("stored error");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(fx.transport.take_error().is_none());
        crate::test_complete!("read_error_disables_direction_and_is_takeable");
    }

    #[test]
    fn write_drains_output_and_fires_on_writable() {
        init_test_logging();
        let fx = fixture();
        let (_readable, writable, _events) = counting_callbacks(&fx.transport);

        fx.transport.write(b"hello").expect("queue");
        assert_eq!(fx.reactor.pending_events(), 1);

        fx.controller.inject(FD, Interest::WRITABLE);
        fx.reactor.run_once().expect("run");

        assert_eq!(fx.script.borrow().written, b"hello");
        crate::assert_with_log!(writable.get() == 1, "on_writable fired", 1, writable.get());
        // Empty output parks the write event.
        assert_eq!(fx.reactor.pending_events(), 0);

        // The next append re-arms it.
        fx.transport.write(b"again").expect("queue again");
        assert_eq!(fx.reactor.pending_events(), 1);
        crate::test_complete!("write_drains_output_and_fires_on_writable");
    }

    #[test]
    fn partial_write_stays_armed_without_firing() {
        init_test_logging();
        let fx = fixture();
        let (_readable, writable, _events) = counting_callbacks(&fx.transport);
        fx.script.borrow_mut().accept = 3;

        fx.transport.write(b"0123456789").expect("queue");
        fx.controller.inject(FD, Interest::WRITABLE);
        fx.reactor.run_once().expect("run");

        assert_eq!(fx.script.borrow().written, b"012");
        assert_eq!(fx.transport.output().len(), 7);
        crate::assert_with_log!(writable.get() == 0, "still above low", 0, writable.get());
        assert_eq!(fx.reactor.pending_events(), 1);
        crate::test_complete!("partial_write_stays_armed_without_firing");
    }

    #[test]
    fn write_low_boundary_is_configurable() {
        init_test_logging();
        let fx = fixture();
        let (_readable, writable, _events) = counting_callbacks(&fx.transport);
        fx.transport
            .set_watermark(Direction::Write, 5, 0)
            .expect("watermark");
        fx.script.borrow_mut().accept = 5;

        // Inclusive default: len == low fires.
        fx.transport.write(b"0123456789").expect("queue");
        fx.controller.inject(FD, Interest::WRITABLE);
        fx.reactor.run_once().expect("run");
        assert_eq!(fx.transport.output().len(), 5);
        crate::assert_with_log!(writable.get() == 1, "inclusive fires at low", 1, writable.get());

        // Strict: len == low does not fire.
        fx.transport.set_write_low_inclusive(false);
        fx.transport.write(b"01234").expect("queue");
        fx.script.borrow_mut().accept = 5;
        fx.controller.inject(FD, Interest::WRITABLE);
        fx.reactor.run_once().expect("run");
        assert_eq!(fx.transport.output().len(), 5);
        crate::assert_with_log!(writable.get() == 1, "strict holds at low", 1, writable.get());
        crate::test_complete!("write_low_boundary_is_configurable");
    }

    #[test]
    fn read_timeout_disables_and_reports() {
        init_test_logging();
        let fx = fixture();
        let (_readable, _writable, events) = counting_callbacks(&fx.transport);
        fx.transport
            .set_timeout(Direction::Read, Some(Duration::from_millis(5)))
            .expect("timeout");
        fx.transport.enable(Direction::Read).expect("enable");

        // No readiness arrives; the lab backend sleeps out the wait.
        fx.reactor.run_once().expect("run");

        assert!(events.get().is_timeout());
        assert!(events.get().is_reading());
        assert!(!events.get().is_writing());
        assert!(!fx.transport.is_enabled(Direction::Read));
        assert_eq!(fx.reactor.pending_events(), 0);
        crate::test_complete!("read_timeout_disables_and_reports");
    }

    #[test]
    fn invalid_watermark_is_rejected() {
        init_test_logging();
        let fx = fixture();
        let err = fx
            .transport
            .set_watermark(Direction::Read, 10, 5)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        // high == 0 lifts the limit, so any low is fine.
        fx.transport
            .set_watermark(Direction::Read, 10, 0)
            .expect("unlimited high");
        crate::test_complete!("invalid_watermark_is_rejected");
    }

    #[test]
    fn close_from_callback_is_safe() {
        init_test_logging();
        let fx = fixture();
        let closed_in_callback = Rc::new(Cell::new(false));
        let flag = Rc::clone(&closed_in_callback);
        fx.transport.set_callbacks(
            move |transport| {
                transport.close();
                flag.set(true);
            },
            |_| {},
            |_, _| {},
        );
        fx.transport.enable(Direction::Read).expect("enable");

        fx.script.borrow_mut().reads.push_back(Ok(b"data".to_vec()));
        fx.controller.inject(FD, Interest::READABLE);
        fx.reactor.run_once().expect("run");

        assert!(closed_in_callback.get());
        assert_eq!(fx.reactor.pending_events(), 0);
        assert!(fx.transport.enable(Direction::Read).is_err());
        // Buffered input survives the close.
        assert_eq!(fx.transport.read(4).expect("buffered"), b"data");
        crate::test_complete!("close_from_callback_is_safe");
    }

    #[test]
    fn disable_read_preserves_buffered_input() {
        init_test_logging();
        let fx = fixture();
        let (_readable, _writable, _events) = counting_callbacks(&fx.transport);
        fx.transport.enable(Direction::Read).expect("enable");

        fx.script.borrow_mut().reads.push_back(Ok(b"kept".to_vec()));
        fx.controller.inject(FD, Interest::READABLE);
        fx.reactor.run_once().expect("run");

        fx.transport.disable(Direction::Read);
        assert!(!fx.transport.is_enabled(Direction::Read));
        assert_eq!(fx.transport.read(4).expect("buffered"), b"kept");
        crate::test_complete!("disable_read_preserves_buffered_input");
    }

    #[test]
    fn output_handle_append_rearms_write() {
        init_test_logging();
        let fx = fixture();
        let output = fx.transport.output();
        assert!(output.is_empty());
        assert_eq!(fx.reactor.pending_events(), 0);

        output.append(b"queued").expect("append");
        assert_eq!(output.len(), 6);
        assert_eq!(fx.reactor.pending_events(), 1);
        crate::test_complete!("output_handle_append_rearms_write");
    }
}
