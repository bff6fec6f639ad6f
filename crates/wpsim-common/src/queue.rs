//! Time-ordered event queue with cancellation.

use crate::{Event, EventId, SimTime};
use std::collections::{BinaryHeap, HashSet};

/// Min-heap of events ordered by time, then by posting order.
///
/// Cancelled events stay in the heap and are skipped when popped.
#[derive(Default)]
pub struct EventQueue {
    heap: BinaryHeap<Event>,
    cancelled: HashSet<EventId>,
}

impl EventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an event.
    pub fn push(&mut self, event: Event) {
        self.heap.push(event);
    }

    /// Schedule several events.
    pub fn extend(&mut self, events: impl IntoIterator<Item = Event>) {
        self.heap.extend(events);
    }

    /// Mark events as cancelled.
    pub fn cancel_all(&mut self, ids: impl IntoIterator<Item = EventId>) {
        self.cancelled.extend(ids);
    }

    /// Pop the earliest live event.
    pub fn pop(&mut self) -> Option<Event> {
        while let Some(event) = self.heap.pop() {
            if self.cancelled.remove(&event.id) {
                continue;
            }
            return Some(event);
        }
        None
    }

    /// Time of the earliest queued event, cancelled or not.
    pub fn peek_time(&self) -> Option<SimTime> {
        self.heap.peek().map(|e| e.time)
    }

    /// Number of queued events, including cancelled ones not yet skipped.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
