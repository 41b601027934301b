//! Per-worker ordered event queue
//!
//! Events are ordered by absolute trigger time, ties broken by insertion
//! order. Exactly one worker owns each queue; all mutation happens under the
//! owning worker's lock.

use crate::scheduler::Event;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::SystemTime;

/// Entry in the event heap
struct QueueEntry {
    /// Absolute time at or after which the event is eligible to run
    trigger: SystemTime,
    /// Insertion sequence, tie-break for equal trigger times
    seq: u64,
    /// The queued event
    event: Event,
}

// Reverse ordering for min-heap (earliest trigger first, then lowest seq)
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .trigger
            .cmp(&self.trigger)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.trigger == other.trigger && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

/// An ordered sequence of events owned by exactly one worker
pub struct EventQueue {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

impl EventQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Insert an event with the given trigger time
    pub fn push(&mut self, event: Event, trigger: SystemTime) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry {
            trigger,
            seq,
            event,
        });
    }

    /// Pop the earliest event if its trigger time is at or before `now`
    ///
    /// Returns the event together with its trigger time; self-rescheduling
    /// events compute their next trigger from it, not from `now`.
    pub fn pop_due(&mut self, now: SystemTime) -> Option<(Event, SystemTime)> {
        match self.heap.peek() {
            Some(entry) if entry.trigger <= now => {
                let entry = self.heap.pop()?;
                Some((entry.event, entry.trigger))
            }
            _ => None,
        }
    }

    /// Trigger time of the earliest queued event
    pub fn next_trigger(&self) -> Option<SystemTime> {
        self.heap.peek().map(|entry| entry.trigger)
    }

    /// Remove and return every event matching the predicate
    ///
    /// Used for cancellation (a cleared timer's pending event, a closed
    /// port's traffic). The caller is responsible for discarding the
    /// returned events.
    pub fn remove_if(&mut self, pred: impl Fn(&Event) -> bool) -> Vec<Event> {
        let mut kept = Vec::with_capacity(self.heap.len());
        let mut removed = Vec::new();
        for entry in self.heap.drain() {
            if pred(&entry.event) {
                removed.push(entry.event);
            } else {
                kept.push(entry);
            }
        }
        self.heap = kept.into();
        removed
    }

    /// Remove and return every queued event, earliest first
    pub fn drain(&mut self) -> Vec<Event> {
        let heap = std::mem::take(&mut self.heap);
        heap.into_sorted_vec()
            .into_iter()
            .rev()
            .map(|entry| entry.event)
            .collect()
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Callback, Value};
    use std::time::Duration;

    fn message(tag: f64) -> Event {
        Event::Message {
            target: Callback::from_raw(1),
            data: Value::Number(tag),
        }
    }

    fn tag_of(event: &Event) -> f64 {
        match event {
            Event::Message { data, .. } => data.as_number().unwrap(),
            _ => panic!("unexpected event kind"),
        }
    }

    #[test]
    fn test_trigger_order_with_insertion_tiebreak() {
        let base = SystemTime::now();
        let mut queue = EventQueue::new();

        // A(5), B(5), C(3), D(10) inserted in that order
        queue.push(message(1.0), base + Duration::from_millis(5));
        queue.push(message(2.0), base + Duration::from_millis(5));
        queue.push(message(3.0), base + Duration::from_millis(3));
        queue.push(message(4.0), base + Duration::from_millis(10));

        let now = base + Duration::from_millis(20);
        let order: Vec<f64> = std::iter::from_fn(|| queue.pop_due(now))
            .map(|(event, _)| tag_of(&event))
            .collect();

        // C, A, B, D
        assert_eq!(order, vec![3.0, 1.0, 2.0, 4.0]);
    }

    #[test]
    fn test_pop_due_respects_trigger_time() {
        let base = SystemTime::now();
        let mut queue = EventQueue::new();
        queue.push(message(1.0), base + Duration::from_secs(60));

        assert!(queue.pop_due(base).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_trigger(), Some(base + Duration::from_secs(60)));

        let (_, trigger) = queue.pop_due(base + Duration::from_secs(61)).unwrap();
        assert_eq!(trigger, base + Duration::from_secs(60));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_if_keeps_order() {
        let base = SystemTime::now();
        let mut queue = EventQueue::new();
        for i in 0..6 {
            queue.push(message(i as f64), base + Duration::from_millis(i));
        }

        let removed = queue.remove_if(|event| tag_of(event) % 2.0 == 0.0);
        assert_eq!(removed.len(), 3);
        assert_eq!(queue.len(), 3);

        let now = base + Duration::from_secs(1);
        let order: Vec<f64> = std::iter::from_fn(|| queue.pop_due(now))
            .map(|(event, _)| tag_of(&event))
            .collect();
        assert_eq!(order, vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_drain_returns_all_earliest_first() {
        let base = SystemTime::now();
        let mut queue = EventQueue::new();
        queue.push(message(2.0), base + Duration::from_millis(20));
        queue.push(message(1.0), base + Duration::from_millis(10));

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(tag_of(&drained[0]), 1.0);
        assert_eq!(tag_of(&drained[1]), 2.0);
        assert!(queue.is_empty());
    }
}
