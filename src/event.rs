//! Event masks and the registration slab.
//!
//! [`EventMask`] names what an event is interested in (read, write,
//! persistence) and, on delivery, what actually triggered (plus
//! `TIMEOUT`). [`EventSlab`] maps compact [`EventId`]s to registration
//! slots with a free list for O(1) allocation and a generation counter so
//! a freed-and-reused slot never honors a stale id.

/// Interest/trigger flags for an event.
///
/// On registration, `READ`/`WRITE` select descriptor readiness and
/// `PERSIST` keeps the event registered after it fires. On delivery the
/// callback receives the triggered subset, possibly including `TIMEOUT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u8);

impl EventMask {
    /// Empty mask.
    pub const NONE: EventMask = EventMask(0);
    /// Interest in descriptor readability.
    pub const READ: EventMask = EventMask(0b0001);
    /// Interest in descriptor writability.
    pub const WRITE: EventMask = EventMask(0b0010);
    /// Delivery-only flag: the event's deadline elapsed.
    pub const TIMEOUT: EventMask = EventMask(0b0100);
    /// The event stays registered after firing.
    pub const PERSIST: EventMask = EventMask(0b1000);

    /// Returns true if the read flag is set.
    #[must_use]
    pub const fn is_read(&self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// Returns true if the write flag is set.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    /// Returns true if the timeout flag is set.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        self.0 & Self::TIMEOUT.0 != 0
    }

    /// Returns true if the persist flag is set.
    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        self.0 & Self::PERSIST.0 != 0
    }

    /// Returns true if neither direction flag is set.
    #[must_use]
    pub const fn is_directionless(&self) -> bool {
        self.0 & (Self::READ.0 | Self::WRITE.0) == 0
    }

    /// Combines masks.
    #[must_use]
    pub const fn add(self, other: EventMask) -> Self {
        EventMask(self.0 | other.0)
    }

    /// Removes flags.
    #[must_use]
    pub const fn remove(self, other: EventMask) -> Self {
        EventMask(self.0 & !other.0)
    }

    /// Returns true if any flag of `other` is set.
    #[must_use]
    pub const fn intersects(&self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns the intersection of the two masks.
    #[must_use]
    pub const fn and(self, other: EventMask) -> Self {
        EventMask(self.0 & other.0)
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        self.add(rhs)
    }
}

/// Compact identifier for an event registration slot.
///
/// Encodes a slab index and a generation; the generation catches
/// use-after-free where a freed slot is reallocated and a stale id would
/// otherwise reference the wrong registration.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EventId {
    index: u32,
    generation: u32,
}

impl EventId {
    /// Creates an id from its raw parts.
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the slab index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Returns the generation.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

/// Sentinel for end of the free list.
const FREE_END: u32 = u32::MAX;

#[derive(Debug)]
enum Entry<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: u32, generation: u32 },
}

/// Slab allocator mapping [`EventId`]s to registration slots.
#[derive(Debug)]
pub struct EventSlab<T> {
    entries: Vec<Entry<T>>,
    free_head: u32,
    len: usize,
}

impl<T> Default for EventSlab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventSlab<T> {
    /// Creates an empty slab.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: FREE_END,
            len: 0,
        }
    }

    /// Returns the number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a value, reusing a free slot when available.
    pub fn insert(&mut self, value: T) -> EventId {
        self.len += 1;
        if self.free_head != FREE_END {
            let index = self.free_head;
            let slot = &mut self.entries[index as usize];
            let (next_free, generation) = match slot {
                Entry::Vacant {
                    next_free,
                    generation,
                } => (*next_free, *generation),
                Entry::Occupied { .. } => unreachable!("free list points at occupied slot"),
            };
            self.free_head = next_free;
            let generation = generation.wrapping_add(1);
            *slot = Entry::Occupied { value, generation };
            EventId::new(index, generation)
        } else {
            let index = u32::try_from(self.entries.len()).expect("slab capacity exceeded");
            self.entries.push(Entry::Occupied {
                value,
                generation: 0,
            });
            EventId::new(index, 0)
        }
    }

    /// Returns a reference to the value for `id`, if the id is current.
    #[must_use]
    pub fn get(&self, id: EventId) -> Option<&T> {
        match self.entries.get(id.index as usize) {
            Some(Entry::Occupied { value, generation }) if *generation == id.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Returns a mutable reference to the value for `id`, if current.
    pub fn get_mut(&mut self, id: EventId) -> Option<&mut T> {
        match self.entries.get_mut(id.index as usize) {
            Some(Entry::Occupied { value, generation }) if *generation == id.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Removes and returns the value for `id`, if the id is current.
    pub fn remove(&mut self, id: EventId) -> Option<T> {
        let slot = self.entries.get_mut(id.index as usize)?;
        match slot {
            Entry::Occupied { generation, .. } if *generation == id.generation => {
                let generation = *generation;
                let old = std::mem::replace(
                    slot,
                    Entry::Vacant {
                        next_free: self.free_head,
                        generation,
                    },
                );
                self.free_head = id.index;
                self.len -= 1;
                match old {
                    Entry::Occupied { value, .. } => Some(value),
                    Entry::Vacant { .. } => unreachable!("matched occupied above"),
                }
            }
            _ => None,
        }
    }

    /// Iterates over occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = (EventId, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { value, generation } => Some((
                    EventId::new(u32::try_from(index).expect("slab index fits"), *generation),
                    value,
                )),
                Entry::Vacant { .. } => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    #[test]
    fn mask_flags_compose() {
        init_test_logging();
        let mask = EventMask::READ | EventMask::PERSIST;
        assert!(mask.is_read());
        assert!(mask.is_persistent());
        assert!(!mask.is_write());
        assert!(!mask.is_timeout());

        let mask = mask.remove(EventMask::PERSIST);
        assert!(!mask.is_persistent());
        crate::test_complete!("mask_flags_compose");
    }

    #[test]
    fn directionless_detection() {
        init_test_logging();
        assert!(EventMask::NONE.is_directionless());
        assert!(EventMask::PERSIST.is_directionless());
        assert!(!EventMask::READ.is_directionless());
        assert!(!(EventMask::WRITE | EventMask::PERSIST).is_directionless());
        crate::test_complete!("directionless_detection");
    }

    #[test]
    fn slab_insert_get_remove() {
        init_test_logging();
        let mut slab: EventSlab<&'static str> = EventSlab::new();
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_eq!(slab.len(), 2);
        assert_eq!(slab.get(a), Some(&"a"));
        assert_eq!(slab.get(b), Some(&"b"));

        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.get(a), None);
        assert_eq!(slab.len(), 1);
        crate::test_complete!("slab_insert_get_remove");
    }

    #[test]
    fn stale_id_does_not_match_reused_slot() {
        init_test_logging();
        let mut slab: EventSlab<u32> = EventSlab::new();
        let first = slab.insert(1);
        slab.remove(first);

        let second = slab.insert(2);
        // Slot is reused but the generation moved on.
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert_eq!(slab.get(first), None);
        assert_eq!(slab.remove(first), None);
        assert_eq!(slab.get(second), Some(&2));
        crate::test_complete!("stale_id_does_not_match_reused_slot");
    }

    #[test]
    fn iter_visits_occupied_slots_only() {
        init_test_logging();
        let mut slab: EventSlab<u32> = EventSlab::new();
        let a = slab.insert(10);
        let _b = slab.insert(20);
        let c = slab.insert(30);
        slab.remove(a);

        let mut values: Vec<u32> = slab.iter().map(|(_, v)| *v).collect();
        values.sort_unstable();
        assert_eq!(values, vec![20, 30]);
        assert!(slab.iter().any(|(id, _)| id == c));
        crate::test_complete!("iter_visits_occupied_slots_only");
    }
}
