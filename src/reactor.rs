//! The event base: registry, timers, and the wait/dispatch loop.
//!
//! A [`Reactor`] owns the event registry, the [`TimerHeap`], and a boxed
//! [`Demultiplexer`] backend. User code creates [`Event`]s bound to the
//! reactor, arms them with [`Event::add`], and drives everything with
//! [`Reactor::run`].
//!
//! # Dispatch algorithm
//!
//! Each iteration:
//!
//! 1. Compute the earliest pending deadline across the timer heap.
//! 2. Ask the backend to wait up to that duration for readiness.
//! 3. For each reported-ready descriptor, look up interested events and
//!    mark them active.
//! 4. Pop every timer whose deadline has passed and mark its event active.
//! 5. Invoke each active event's callback exactly once. Non-persistent
//!    events are unregistered *before* their callback runs, so a callback
//!    that re-adds its own event starts a fresh registration. Persistent
//!    events with a timeout re-arm their deadline.
//! 6. Re-arm backend interest for every descriptor that fired and still
//!    has pending interest (the production backend is oneshot).
//!
//! The loop ends when no events remain pending or [`Reactor::stop`] was
//! requested. `stop` never interrupts an in-flight callback.
//!
//! # Re-entrancy
//!
//! Callbacks may add, remove, re-add, or drop any event — including the
//! one whose callback is executing. The dispatch path holds no registry
//! borrow while a callback runs and re-checks each active event's
//! registration (by generation) immediately before invoking it, so a
//! removal from inside an earlier callback in the same pass suppresses the
//! later invocation. Calling `run` from inside a callback is refused with
//! [`Error::InvalidArgument`].

use crate::backend::{Demultiplexer, Interest, PollBackend, Readiness};
use crate::error::{Error, Result};
use crate::event::{EventId, EventMask, EventSlab};
use crate::timer::TimerHeap;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Default capacity for the per-iteration readiness buffer.
const DEFAULT_MAX_READY: usize = 64;

type Callback = Rc<RefCell<dyn FnMut(EventMask)>>;

/// One registered event.
struct EventSlot {
    fd: Option<RawFd>,
    mask: EventMask,
    callback: Callback,
    timeout: Option<Duration>,
    /// Current timer arming; heap entries with an older generation are
    /// stale and get discarded on pop.
    timer_generation: u64,
    pending: bool,
}

/// Per-descriptor bookkeeping.
#[derive(Default)]
struct FdEntry {
    events: SmallVec<[EventId; 2]>,
    registered: bool,
}

#[derive(Default)]
struct Registry {
    slots: EventSlab<EventSlot>,
    fds: HashMap<RawFd, FdEntry>,
    pending_count: usize,
}

impl Registry {
    /// Union of the directions wanted by still-pending events on `fd`.
    fn interest_for(&self, entry: &FdEntry) -> Interest {
        let mut interest = Interest::NONE;
        for &id in &entry.events {
            let Some(slot) = self.slots.get(id) else {
                continue;
            };
            if !slot.pending {
                continue;
            }
            if slot.mask.is_read() {
                interest = interest.add(Interest::READABLE);
            }
            if slot.mask.is_write() {
                interest = interest.add(Interest::WRITABLE);
            }
        }
        interest
    }
}

pub(crate) struct Inner {
    backend: RefCell<Box<dyn Demultiplexer>>,
    registry: RefCell<Registry>,
    timers: RefCell<TimerHeap>,
    next_timer_generation: Cell<u64>,
    stop_requested: Cell<bool>,
    dispatching: Cell<bool>,
    max_ready: usize,
}

impl Inner {
    fn bump_timer_generation(&self) -> u64 {
        let generation = self.next_timer_generation.get().wrapping_add(1);
        self.next_timer_generation.set(generation);
        generation
    }

    /// Reconciles backend registration for `fd` with the union of pending
    /// interest. Called with the registry lock held.
    fn sync_fd(&self, registry: &mut Registry, fd: RawFd) -> std::io::Result<()> {
        let Some(entry) = registry.fds.get(&fd) else {
            return Ok(());
        };
        let was_registered = entry.registered;
        let has_events = !entry.events.is_empty();
        let interest = registry.interest_for(entry);

        let mut backend = self.backend.borrow_mut();
        if interest.is_empty() {
            // Bookkeeping first: even if the backend call fails (the
            // descriptor may already be closed), the registration is gone.
            if has_events {
                registry.fds.get_mut(&fd).expect("entry exists").registered = false;
            } else {
                registry.fds.remove(&fd);
            }
            if was_registered {
                backend.unregister(fd)?;
            }
        } else if was_registered {
            backend.reregister(fd, interest)?;
        } else {
            backend.register(fd, interest)?;
            registry.fds.get_mut(&fd).expect("entry exists").registered = true;
        }
        Ok(())
    }

    /// Cancels a pending registration. Safe to call mid-dispatch; the
    /// pending flag flip is what suppresses an already-selected callback.
    fn detach(&self, registry: &mut Registry, id: EventId) {
        let Some(slot) = registry.slots.get_mut(id) else {
            return;
        };
        if !slot.pending {
            return;
        }
        slot.pending = false;
        slot.timer_generation = self.bump_timer_generation();
        let fd = slot.fd;
        registry.pending_count -= 1;
        if let Some(fd) = fd {
            if let Some(entry) = registry.fds.get_mut(&fd) {
                entry.events.retain(|e| *e != id);
            }
            if let Err(e) = self.sync_fd(registry, fd) {
                // The descriptor may already be closed by the owner; the
                // registration is gone either way.
                tracing::debug!(fd, error = %e, "backend unregister failed during detach");
            }
        }
    }
}

/// The object owning the wait/dispatch loop and all registered interests.
///
/// Cloning a `Reactor` clones a handle to the same event base; the base is
/// destroyed when the last handle (and every event bound to it) is gone.
/// A reactor is single-threaded: it is not `Send`, and callbacks run to
/// completion on the thread that called [`run`](Self::run).
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Reactor {
    /// Creates a reactor over the default production backend.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Returns a builder for configuring the backend.
    #[must_use]
    pub fn builder() -> ReactorBuilder {
        ReactorBuilder {
            backend: None,
            max_ready: DEFAULT_MAX_READY,
        }
    }

    /// Number of events currently pending (armed).
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.inner.registry.borrow().pending_count
    }

    /// Requests loop termination after the current iteration completes.
    ///
    /// Never interrupts an in-flight callback.
    pub fn stop(&self) {
        self.inner.stop_requested.set(true);
    }

    /// Runs the dispatch loop until no events remain pending or
    /// [`stop`](Self::stop) is requested.
    pub fn run(&self) -> Result<()> {
        loop {
            if self.inner.stop_requested.get() {
                break;
            }
            if self.pending_events() == 0 {
                break;
            }
            self.run_once()?;
        }
        self.inner.stop_requested.set(false);
        Ok(())
    }

    /// Runs exactly one wait/dispatch iteration.
    ///
    /// Blocks until readiness, the earliest timer deadline, or — with no
    /// timers armed — indefinitely until readiness.
    pub fn run_once(&self) -> Result<()> {
        let inner = &*self.inner;
        if inner.dispatching.get() {
            return Err(Error::InvalidArgument("run is not reentrant"));
        }

        // (1) Earliest pending deadline bounds the wait.
        let wait_timeout = inner
            .timers
            .borrow()
            .peek_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));

        // (2) Wait for readiness.
        let mut ready: Vec<Readiness> = Vec::with_capacity(inner.max_ready);
        inner.backend.borrow_mut().wait(wait_timeout, &mut ready)?;
        tracing::trace!(
            notifications = ready.len(),
            timeout = ?wait_timeout,
            "wait returned"
        );

        // (3) Readiness → active events.
        let mut active: Vec<(EventId, EventMask)> = Vec::new();
        let mut fired_fds: Vec<RawFd> = Vec::new();
        {
            let registry = inner.registry.borrow();
            for notification in &ready {
                let Some(entry) = registry.fds.get(&notification.fd) else {
                    continue;
                };
                fired_fds.push(notification.fd);
                // Error and hangup wake both directions so the owner can
                // observe the condition through its own syscall.
                let faulted = notification.ready.is_error() || notification.ready.is_hup();
                for &id in &entry.events {
                    let Some(slot) = registry.slots.get(id) else {
                        continue;
                    };
                    if !slot.pending {
                        continue;
                    }
                    let mut triggered = EventMask::NONE;
                    if slot.mask.is_read() && (notification.ready.is_readable() || faulted) {
                        triggered = triggered.add(EventMask::READ);
                    }
                    if slot.mask.is_write() && (notification.ready.is_writable() || faulted) {
                        triggered = triggered.add(EventMask::WRITE);
                    }
                    if triggered != EventMask::NONE {
                        merge_active(&mut active, id, triggered);
                    }
                }
            }
        }

        // (4) Expired timers. Every deadline that has passed by now — and
        // therefore every deadline passed at wait start — fires in this
        // iteration, so continuous readiness cannot starve timers.
        let now = Instant::now();
        let expired = inner.timers.borrow_mut().pop_expired(now);
        {
            let registry = inner.registry.borrow();
            for exp in expired {
                let Some(slot) = registry.slots.get(exp.event) else {
                    continue;
                };
                if slot.pending && slot.timer_generation == exp.generation {
                    merge_active(&mut active, exp.event, EventMask::TIMEOUT);
                }
            }
        }

        // (5) Invoke callbacks, one per active event.
        let _guard = DispatchGuard::enter(&inner.dispatching);
        for (id, triggered) in active {
            let invocation = {
                let mut registry = inner.registry.borrow_mut();
                let Some(slot) = registry.slots.get_mut(id) else {
                    continue; // freed by an earlier callback this pass
                };
                if !slot.pending {
                    continue; // removed by an earlier callback this pass
                }
                let deliver = triggered.and(slot.mask.add(EventMask::TIMEOUT));
                if deliver == EventMask::NONE {
                    continue;
                }
                let callback = Rc::clone(&slot.callback);
                if slot.mask.is_persistent() {
                    // A persistent event's timeout restarts on every fire.
                    if let Some(timeout) = slot.timeout {
                        let generation = inner.bump_timer_generation();
                        slot.timer_generation = generation;
                        inner.timers.borrow_mut().insert(id, generation, now + timeout);
                    }
                } else {
                    inner.detach(&mut registry, id);
                }
                Some((callback, deliver))
            };
            if let Some((callback, deliver)) = invocation {
                tracing::trace!(?id, ?deliver, "dispatching event");
                (callback.borrow_mut())(deliver);
            }
        }
        drop(_guard);

        // (6) Re-arm oneshot interest for descriptors that fired.
        {
            let mut registry = inner.registry.borrow_mut();
            fired_fds.sort_unstable();
            fired_fds.dedup();
            for fd in fired_fds {
                if let Err(e) = inner.sync_fd(&mut registry, fd) {
                    tracing::warn!(fd, error = %e, "failed to re-arm descriptor");
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("pending_events", &self.pending_events())
            .finish_non_exhaustive()
    }
}

/// Accumulates trigger flags so each event is invoked exactly once per
/// iteration even when both readiness and a timeout selected it.
fn merge_active(active: &mut Vec<(EventId, EventMask)>, id: EventId, mask: EventMask) {
    if let Some(entry) = active.iter_mut().find(|(other, _)| *other == id) {
        entry.1 = entry.1.add(mask);
    } else {
        active.push((id, mask));
    }
}

/// Resets the dispatch flag even if a callback panics.
struct DispatchGuard<'a>(&'a Cell<bool>);

impl<'a> DispatchGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Builder for [`Reactor`].
pub struct ReactorBuilder {
    backend: Option<Box<dyn Demultiplexer>>,
    max_ready: usize,
}

impl ReactorBuilder {
    /// Selects the readiness backend. Defaults to [`PollBackend`].
    #[must_use]
    pub fn backend(mut self, backend: impl Demultiplexer + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    /// Caps how many readiness notifications one iteration processes.
    #[must_use]
    pub fn max_ready(mut self, max_ready: usize) -> Self {
        self.max_ready = max_ready.max(1);
        self
    }

    /// Builds the reactor. Backend creation failure is a constructor
    /// error.
    pub fn build(self) -> Result<Reactor> {
        let backend = match self.backend {
            Some(backend) => backend,
            None => Box::new(PollBackend::new()?),
        };
        Ok(Reactor {
            inner: Rc::new(Inner {
                backend: RefCell::new(backend),
                registry: RefCell::new(Registry::default()),
                timers: RefCell::new(TimerHeap::new()),
                next_timer_generation: Cell::new(0),
                stop_requested: Cell::new(false),
                dispatching: Cell::new(false),
                max_ready: self.max_ready,
            }),
        })
    }
}

/// A registered interest in descriptor readiness and/or a deadline,
/// paired with a callback.
///
/// The handle owns the registration: dropping it detaches and frees the
/// event. The opaque-argument slot of classic callback APIs is subsumed by
/// closure capture. An event belongs to exactly one reactor, fixed at
/// creation.
///
/// # Lifecycle
///
/// Created detached → *pending* after [`add`](Self::add) → *active* while
/// its callback executes → back to pending if persistent, detached
/// otherwise.
pub struct Event {
    inner: Weak<Inner>,
    id: EventId,
}

impl Event {
    /// Creates a detached event bound to `reactor`.
    ///
    /// `fd` is the descriptor to watch (required when `mask` names a
    /// direction); the callback receives the triggered flags, possibly
    /// including [`EventMask::TIMEOUT`].
    pub fn new<F>(
        reactor: &Reactor,
        fd: Option<RawFd>,
        mask: EventMask,
        callback: F,
    ) -> Result<Event>
    where
        F: FnMut(EventMask) + 'static,
    {
        if fd.is_none() && !mask.is_directionless() {
            return Err(Error::InvalidArgument(
                "read/write interest requires a descriptor",
            ));
        }
        let mask = mask.remove(EventMask::TIMEOUT);
        let mut registry = reactor.inner.registry.borrow_mut();
        let id = registry.slots.insert(EventSlot {
            fd,
            mask,
            callback: Rc::new(RefCell::new(callback)),
            timeout: None,
            timer_generation: 0,
            pending: false,
        });
        Ok(Event {
            inner: Rc::downgrade(&reactor.inner),
            id,
        })
    }

    /// Arms the event, optionally with a deadline.
    ///
    /// Fails with [`Error::InvalidArgument`] if the mask names no
    /// direction and no timeout is given. Re-adding a pending event
    /// reschedules its timeout.
    pub fn add(&self, timeout: Option<Duration>) -> Result<()> {
        let inner = self
            .inner
            .upgrade()
            .ok_or(Error::InvalidArgument("reactor destroyed"))?;
        let mut registry = inner.registry.borrow_mut();
        let slot = registry
            .slots
            .get_mut(self.id)
            .ok_or(Error::InvalidArgument("event freed"))?;
        if slot.mask.is_directionless() && timeout.is_none() {
            return Err(Error::InvalidArgument(
                "event needs a direction or a timeout",
            ));
        }
        slot.timeout = timeout;
        let generation = inner.bump_timer_generation();
        slot.timer_generation = generation;
        if let Some(timeout) = timeout {
            inner
                .timers
                .borrow_mut()
                .insert(self.id, generation, Instant::now() + timeout);
        }
        let fd = slot.fd;
        let was_pending = slot.pending;
        slot.pending = true;
        if !was_pending {
            registry.pending_count += 1;
            if let Some(fd) = fd {
                let entry = registry.fds.entry(fd).or_default();
                if !entry.events.contains(&self.id) {
                    entry.events.push(self.id);
                }
            }
        }
        if let Some(fd) = fd {
            inner.sync_fd(&mut registry, fd)?;
        }
        tracing::trace!(id = ?self.id, ?fd, ?timeout, "event armed");
        Ok(())
    }

    /// Cancels the registration. Idempotent; safe from inside any
    /// callback, including this event's own. After it returns, the
    /// callback will not run again until re-added — even if the event was
    /// already selected as ready in the current iteration.
    pub fn remove(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut registry = inner.registry.borrow_mut();
        inner.detach(&mut registry, self.id);
    }

    /// Returns true if the event is armed.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let registry = inner.registry.borrow();
        registry.slots.get(self.id).is_some_and(|slot| slot.pending)
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut registry = inner.registry.borrow_mut();
        inner.detach(&mut registry, self.id);
        registry.slots.remove(self.id);
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("pending", &self.is_pending())
            .finish()
    }
}
