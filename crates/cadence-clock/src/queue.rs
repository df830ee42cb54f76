//! Priority queue of events bound to absolute time.
//!
//! Removal is lazy: the heap keeps stale slots and a side table records
//! which slot is live for each id. Stale slots are skipped when they reach
//! the top and swept out when they outnumber live ones.

use crate::events::{Event, EventId, EventType};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Sort key: due time, then priority, then id.
#[derive(Clone, Copy, Debug)]
struct Key {
    seconds: f64,
    event_type: EventType,
    event_id: EventId,
}

impl Key {
    fn of(event: &Event) -> Self {
        Self {
            seconds: event.seconds,
            event_type: event.event_type,
            event_id: event.event_id,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .total_cmp(&other.seconds)
            .then(self.event_type.cmp(&other.event_type))
            .then(self.event_id.cmp(&other.event_id))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

#[derive(Debug)]
struct Slot {
    key: Key,
    stamp: u64,
    event: Event,
}

// Reversed so that BinaryHeap pops the earliest key first.
impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then(other.stamp.cmp(&self.stamp))
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Slot {}

/// Events ordered by `(seconds, event_type, event_id)`, at most one per id.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Slot>,
    live: HashMap<EventId, u64>,
    next_stamp: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event, replacing any queued event with the same id.
    pub fn put(&mut self, event: Event) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.live.insert(event.event_id, stamp);
        self.heap.push(Slot {
            key: Key::of(&event),
            stamp,
            event,
        });
        self.compact();
    }

    /// Drop the event with this id. Unknown ids are ignored.
    pub fn remove(&mut self, event_id: EventId) -> bool {
        let removed = self.live.remove(&event_id).is_some();
        if removed {
            self.compact();
        }
        removed
    }

    /// Remove and return the earliest live event.
    pub fn pop_min(&mut self) -> Option<Event> {
        while let Some(slot) = self.heap.pop() {
            if self.is_live(&slot) {
                self.live.remove(&slot.event.event_id);
                return Some(slot.event);
            }
        }
        None
    }

    /// The earliest live event, without removing it.
    pub fn peek_min(&mut self) -> Option<&Event> {
        self.prune_top();
        self.heap.peek().map(|slot| &slot.event)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn contains(&self, event_id: EventId) -> bool {
        self.live.contains_key(&event_id)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    fn is_live(&self, slot: &Slot) -> bool {
        self.live.get(&slot.event.event_id) == Some(&slot.stamp)
    }

    fn prune_top(&mut self) {
        while let Some(slot) = self.heap.peek() {
            if self.is_live(slot) {
                break;
            }
            self.heap.pop();
        }
    }

    fn compact(&mut self) {
        if self.heap.len() > 2 * self.live.len().max(16) {
            let live = &self.live;
            self.heap
                .retain(|slot| live.get(&slot.event.event_id) == Some(&slot.stamp));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Change, Payload};

    fn event(id: u64, seconds: f64, event_type: EventType) -> Event {
        Event {
            event_id: EventId::new(id),
            event_type,
            seconds,
            offset: None,
            measure: None,
            payload: Payload::Change(Change::default()),
        }
    }

    fn drain(queue: &mut EventQueue) -> Vec<u64> {
        std::iter::from_fn(|| queue.pop_min())
            .map(|e| e.event_id.get())
            .collect()
    }

    #[test]
    fn test_orders_by_seconds_type_then_id() {
        let mut queue = EventQueue::new();
        queue.put(event(5, 1.0, EventType::SCHEDULE));
        queue.put(event(4, 1.0, EventType::CHANGE));
        queue.put(event(3, 0.5, EventType::SCHEDULE));
        queue.put(event(2, 1.0, EventType::SCHEDULE));
        queue.put(event(1, 2.0, EventType::CHANGE));
        assert_eq!(drain(&mut queue), vec![3, 4, 2, 5, 1]);
    }

    #[test]
    fn test_put_replaces_same_id() {
        let mut queue = EventQueue::new();
        queue.put(event(1, 1.0, EventType::SCHEDULE));
        queue.put(event(2, 2.0, EventType::SCHEDULE));
        queue.put(event(1, 3.0, EventType::SCHEDULE));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek_min().map(|e| e.event_id.get()), Some(2));
        let last = {
            queue.pop_min();
            queue.pop_min().unwrap()
        };
        assert_eq!(last.seconds, 3.0);
        assert!(queue.pop_min().is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut queue = EventQueue::new();
        queue.put(event(1, 1.0, EventType::SCHEDULE));
        queue.put(event(2, 0.5, EventType::SCHEDULE));
        assert!(queue.remove(EventId::new(2)));
        assert!(!queue.remove(EventId::new(2)));
        assert!(!queue.remove(EventId::new(9)));
        assert!(!queue.contains(EventId::new(2)));
        assert_eq!(queue.peek_min().map(|e| e.event_id.get()), Some(1));
        assert_eq!(drain(&mut queue), vec![1]);
    }

    #[test]
    fn test_compaction_keeps_live_events() {
        let mut queue = EventQueue::new();
        for round in 0..50 {
            for id in 0..10 {
                queue.put(event(id, (round * 10 + id) as f64, EventType::SCHEDULE));
            }
        }
        assert_eq!(queue.len(), 10);
        assert!(queue.heap.len() <= 2 * 16 + 1);
        assert_eq!(drain(&mut queue), (0..10).collect::<Vec<_>>());
    }
}
