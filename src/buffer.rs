//! Segmented byte container backing buffered transports.
//!
//! A [`BufferChain`] is a growable byte container built from linked
//! fixed-size segments. Appends amortize to O(1) by reusing tail spare
//! capacity, drains remove bytes from the front and reclaim fully-consumed
//! segments, and [`move_to`](BufferChain::move_to) transfers whole
//! segments between chains by reference when alignment permits.
//!
//! A chain serializes its own mutators behind a single mutex, so one chain
//! may be shared across threads (a transport fills the input chain on the
//! reactor thread while another thread drains it). This does not make the
//! reactor itself thread-safe.
//!
//! # Example
//!
//! ```
//! use riptide::BufferChain;
//!
//! let chain = BufferChain::new();
//! chain.append(b"hello world").unwrap();
//! chain.drain(6).unwrap();
//! let rest = chain.remove(5).unwrap();
//! assert_eq!(rest, b"world");
//! assert!(chain.is_empty());
//! ```

use crate::error::{Error, Result};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::io::{Read, Write};

/// Fixed capacity of one segment.
pub const SEGMENT_CAPACITY: usize = 4096;

/// One memory segment: `data[start..]` holds the readable bytes.
#[derive(Debug)]
struct Segment {
    data: Vec<u8>,
    start: usize,
}

impl Segment {
    fn with_capacity() -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(SEGMENT_CAPACITY)
            .map_err(|_| Error::OutOfMemory)?;
        Ok(Self { data, start: 0 })
    }

    fn readable(&self) -> &[u8] {
        &self.data[self.start..]
    }

    fn len(&self) -> usize {
        self.data.len() - self.start
    }

    fn spare(&self) -> usize {
        SEGMENT_CAPACITY.saturating_sub(self.data.len())
    }
}

#[derive(Debug, Default)]
struct ChainInner {
    segments: VecDeque<Segment>,
    len: usize,
}

impl ChainInner {
    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        // Allocate everything up front so a failure leaves the chain at
        // its prior length.
        let tail_spare = self.segments.back().map_or(0, Segment::spare);
        let overflow = bytes.len().saturating_sub(tail_spare);
        let needed = overflow.div_ceil(SEGMENT_CAPACITY);
        self.segments
            .try_reserve(needed)
            .map_err(|_| Error::OutOfMemory)?;
        let mut fresh: Vec<Segment> = Vec::new();
        fresh.try_reserve(needed).map_err(|_| Error::OutOfMemory)?;
        for _ in 0..needed {
            fresh.push(Segment::with_capacity()?);
        }

        let mut rest = bytes;
        if tail_spare > 0 {
            let tail = self.segments.back_mut().expect("tail has spare");
            let take = tail_spare.min(rest.len());
            tail.data.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        for mut segment in fresh {
            let take = SEGMENT_CAPACITY.min(rest.len());
            segment.data.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            self.segments.push_back(segment);
        }
        debug_assert!(rest.is_empty());
        self.len += bytes.len();
        Ok(())
    }

    fn drain(&mut self, n: usize) -> Result<()> {
        if n > self.len {
            return Err(Error::InsufficientData {
                requested: n,
                available: self.len,
            });
        }
        let mut remaining = n;
        while remaining > 0 {
            let front = self.segments.front_mut().expect("length accounted");
            let available = front.len();
            if available <= remaining {
                // Fully consumed: reclaim the segment without touching its
                // neighbours.
                remaining -= available;
                self.segments.pop_front();
            } else {
                front.start += remaining;
                remaining = 0;
            }
        }
        self.len -= n;
        Ok(())
    }
}

/// A segmented, append/drain-optimized byte container.
#[derive(Debug, Default)]
pub struct BufferChain {
    inner: Mutex<ChainInner>,
}

impl BufferChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of readable bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    /// Returns true if the chain holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of segments currently linked. Diagnostic; lets tests observe
    /// that segment transfer did not copy.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Appends bytes to the back of the chain.
    ///
    /// Fails with [`Error::OutOfMemory`] only on true allocation failure,
    /// in which case the chain is left at its prior length.
    pub fn append(&self, bytes: &[u8]) -> Result<()> {
        self.inner.lock().append(bytes)
    }

    /// Removes exactly `n` bytes from the front.
    ///
    /// Fails with [`Error::InsufficientData`] — leaving the chain
    /// unchanged — if fewer than `n` bytes are available.
    pub fn drain(&self, n: usize) -> Result<()> {
        self.inner.lock().drain(n)
    }

    /// Removes and returns the first `n` bytes.
    pub fn remove(&self, n: usize) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        if n > inner.len {
            return Err(Error::InsufficientData {
                requested: n,
                available: inner.len,
            });
        }
        let mut out = Vec::new();
        out.try_reserve_exact(n).map_err(|_| Error::OutOfMemory)?;
        let mut remaining = n;
        for segment in &inner.segments {
            if remaining == 0 {
                break;
            }
            let take = segment.len().min(remaining);
            out.extend_from_slice(&segment.readable()[..take]);
            remaining -= take;
        }
        inner.drain(n).expect("length checked");
        Ok(out)
    }

    /// Calls `f` with zero-copy views of the first `n` bytes: one slice if
    /// they are contiguous, an ordered sequence if they span segments.
    pub fn peek_with<R>(&self, n: usize, f: impl FnOnce(&[&[u8]]) -> R) -> Result<R> {
        let inner = self.inner.lock();
        if n > inner.len {
            return Err(Error::InsufficientData {
                requested: n,
                available: inner.len,
            });
        }
        let mut views: SmallVec<[&[u8]; 4]> = SmallVec::new();
        let mut remaining = n;
        for segment in &inner.segments {
            if remaining == 0 {
                break;
            }
            let take = segment.len().min(remaining);
            views.push(&segment.readable()[..take]);
            remaining -= take;
        }
        Ok(f(&views))
    }

    /// Moves the first `n` bytes of `self` to the back of `other`.
    ///
    /// Whole leading segments move by reference without copying; a partial
    /// trailing amount is copied. Fails with [`Error::InsufficientData`]
    /// if `self` holds fewer than `n` bytes and with
    /// [`Error::InvalidArgument`] when `other` is the same chain.
    pub fn move_to(&self, other: &BufferChain, n: usize) -> Result<()> {
        if std::ptr::eq(self, other) {
            return Err(Error::InvalidArgument("cannot move a chain into itself"));
        }
        // Address-ordered acquisition keeps concurrent opposite-direction
        // moves deadlock-free.
        let self_first = std::ptr::from_ref(self) as usize <= std::ptr::from_ref(other) as usize;
        let (mut src, mut dst) = if self_first {
            (self.inner.lock(), other.inner.lock())
        } else {
            let dst = other.inner.lock();
            (self.inner.lock(), dst)
        };

        if n > src.len {
            return Err(Error::InsufficientData {
                requested: n,
                available: src.len,
            });
        }
        let mut remaining = n;
        while remaining > 0 {
            let front_len = src.segments.front().expect("length accounted").len();
            if front_len <= remaining {
                let segment = src.segments.pop_front().expect("front exists");
                src.len -= front_len;
                dst.len += front_len;
                remaining -= front_len;
                dst.segments.push_back(segment);
            } else {
                let bytes: Vec<u8> = {
                    let front = src.segments.front().expect("front exists");
                    front.readable()[..remaining].to_vec()
                };
                dst.append(&bytes)?;
                src.drain(remaining).expect("length checked");
                remaining = 0;
            }
        }
        Ok(())
    }

    /// Performs exactly one `read` attempt from `reader` into the tail of
    /// the chain, up to `max` bytes (further capped by the tail segment's
    /// spare room).
    ///
    /// Returns the number of bytes appended; `Ok(0)` means end of stream
    /// (or `max == 0`). Would-block surfaces as the reader's error.
    pub fn read_once_from<R: Read + ?Sized>(
        &self,
        reader: &mut R,
        max: usize,
    ) -> std::io::Result<usize> {
        if max == 0 {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        if inner.segments.back().map_or(0, Segment::spare) == 0 {
            let segment = Segment::with_capacity().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::OutOfMemory, "buffer chain growth failed")
            })?;
            inner.segments.push_back(segment);
        }
        let tail = inner.segments.back_mut().expect("tail pushed above");
        let room = tail.spare().min(max);
        let written = tail.data.len();
        tail.data.resize(written + room, 0);
        match reader.read(&mut tail.data[written..written + room]) {
            Ok(n) => {
                tail.data.truncate(written + n);
                if tail.len() == 0 {
                    // A fresh segment that received nothing is dropped so
                    // EOF probing does not accrete empty segments.
                    if tail.start == 0 && written == 0 {
                        inner.segments.pop_back();
                    }
                }
                inner.len += n;
                Ok(n)
            }
            Err(e) => {
                tail.data.truncate(written);
                if written == 0 && tail.start == 0 {
                    inner.segments.pop_back();
                }
                Err(e)
            }
        }
    }

    /// Performs exactly one `write` attempt of the chain's first segment
    /// to `writer`, draining what was written.
    ///
    /// Returns the number of bytes drained; `Ok(0)` if the chain is empty.
    pub fn write_once_to<W: Write + ?Sized>(&self, writer: &mut W) -> std::io::Result<usize> {
        let mut inner = self.inner.lock();
        let Some(front) = inner.segments.front() else {
            return Ok(0);
        };
        let n = writer.write(front.readable())?;
        inner.drain(n).expect("wrote at most the front segment");
        Ok(n)
    }
}
