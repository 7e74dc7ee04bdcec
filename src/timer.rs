//! Timer heap for deadline management.
//!
//! A min-heap of (deadline, event, generation) entries giving the reactor
//! the next wake-up time. Cancellation is lazy: re-arming or removing an
//! event bumps its timer generation, and stale heap entries are discarded
//! when popped. A stale entry at the head can shorten one wait, which is a
//! benign spurious wakeup.

use crate::event::EventId;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// A timer entry in the heap.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    event: EventId,
    /// Matches the owning event slot's timer generation; entries with a
    /// stale generation are discarded at pop time.
    generation: u64,
    /// Insertion order tiebreak so equal deadlines fire FIFO.
    seq: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An expired timer popped from the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    /// The event whose deadline passed.
    pub event: EventId,
    /// The generation the entry was armed with.
    pub generation: u64,
}

/// A min-heap of timers ordered by deadline.
#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerHeap {
    /// Creates a new empty timer heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries in the heap, including stale ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if the heap is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Arms a deadline for an event.
    pub fn insert(&mut self, event: EventId, generation: u64, deadline: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            event,
            generation,
            seq,
        });
    }

    /// Returns the earliest armed deadline, if any.
    #[must_use]
    pub fn peek_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops all entries whose deadline has passed (deadline <= now), in
    /// deadline order. Stale-generation filtering is the caller's job; the
    /// heap does not know which events are still pending.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<Expired> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry exists");
            expired.push(Expired {
                event: entry.event,
                generation: entry.generation,
            });
        }
        expired
    }

    /// Clears all entries.
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventId;
    use std::time::Duration;

    fn id(n: u32) -> EventId {
        EventId::new(n, 0)
    }

    #[test]
    fn earliest_first() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        heap.insert(id(1), 0, base + Duration::from_millis(100));
        heap.insert(id(2), 0, base + Duration::from_millis(50));
        heap.insert(id(3), 0, base + Duration::from_millis(150));

        assert_eq!(heap.peek_deadline(), Some(base + Duration::from_millis(50)));

        let expired = heap.pop_expired(base + Duration::from_millis(100));
        let events: Vec<_> = expired.iter().map(|e| e.event).collect();
        assert_eq!(events, vec![id(2), id(1)]);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mut heap = TimerHeap::new();
        let deadline = Instant::now();
        heap.insert(id(7), 0, deadline);
        heap.insert(id(8), 0, deadline);
        heap.insert(id(9), 0, deadline);

        let events: Vec<_> = heap.pop_expired(deadline).iter().map(|e| e.event).collect();
        assert_eq!(events, vec![id(7), id(8), id(9)]);
    }

    #[test]
    fn nothing_expires_before_deadline() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        heap.insert(id(1), 0, base + Duration::from_secs(10));
        assert!(heap.pop_expired(base).is_empty());
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn generations_survive_pop() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        heap.insert(id(1), 41, now);
        let expired = heap.pop_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].generation, 41);
    }
}
