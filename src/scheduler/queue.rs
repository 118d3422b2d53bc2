//! Time-ordered trigger queue.
//!
//! Orders registered runs by trigger time, breaking ties by priority
//! (higher first) then run id. Entries are popped lazily: the scheduler
//! re-checks a run's registration and status when its entry surfaces, so
//! stale entries for cancelled or re-queued runs fall out harmlessly.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub trigger_time: DateTime<Utc>,
    pub priority: i32,
    pub run_id: i64,
}

// BinaryHeap is a max-heap; invert so the earliest trigger time wins.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .trigger_time
            .cmp(&self.trigger_time)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.run_id.cmp(&self.run_id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TriggerQueue {
    heap: BinaryHeap<QueueEntry>,
}

impl TriggerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, run_id: i64, trigger_time: DateTime<Utc>, priority: i32) {
        self.heap.push(QueueEntry {
            trigger_time,
            priority,
            run_id,
        });
    }

    /// Pop the next entry whose trigger time has elapsed.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<QueueEntry> {
        match self.heap.peek() {
            Some(entry) if entry.trigger_time <= now => self.heap.pop(),
            _ => None,
        }
    }

    /// Earliest trigger time still queued.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|entry| entry.trigger_time)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn pops_in_time_order() {
        let now = Utc::now();
        let mut queue = TriggerQueue::new();
        queue.push(1, now + Duration::seconds(30), 0);
        queue.push(2, now, 0);
        queue.push(3, now + Duration::seconds(10), 0);

        assert_eq!(queue.pop_due(now).unwrap().run_id, 2);
        assert!(queue.pop_due(now).is_none(), "future entries stay queued");

        let later = now + Duration::seconds(60);
        assert_eq!(queue.pop_due(later).unwrap().run_id, 3);
        assert_eq!(queue.pop_due(later).unwrap().run_id, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn ties_break_by_priority_then_run_id() {
        let now = Utc::now();
        let mut queue = TriggerQueue::new();
        queue.push(10, now, 0);
        queue.push(11, now, 5);
        queue.push(12, now, 5);

        assert_eq!(queue.pop_due(now).unwrap().run_id, 11);
        assert_eq!(queue.pop_due(now).unwrap().run_id, 12);
        assert_eq!(queue.pop_due(now).unwrap().run_id, 10);
    }

    #[test]
    fn next_deadline_tracks_earliest() {
        let now = Utc::now();
        let mut queue = TriggerQueue::new();
        assert!(queue.next_deadline().is_none());

        queue.push(1, now + Duration::seconds(30), 0);
        queue.push(2, now + Duration::seconds(5), 0);
        assert_eq!(queue.next_deadline(), Some(now + Duration::seconds(5)));
    }

    #[test]
    fn clear_empties_the_queue() {
        let now = Utc::now();
        let mut queue = TriggerQueue::new();
        queue.push(1, now, 0);
        queue.push(2, now, 0);
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.pop_due(now).is_none());
    }
}
