//! Single-threaded "fire after N ms" timer queue.
//!
//! The queue never reads a wall clock: the owner feeds it the current time
//! (elapsed since an arbitrary origin) and pops whatever has become due. The
//! control thread feeds it `Instant::elapsed`, tests feed it virtual time.
//! Each popped entry moves the queue clock to that entry's deadline, so work
//! scheduled from inside a handler is relative to when the handler was due.
//! An owner on a wall clock calls [`Scheduler::advance_clock`] with the real
//! time before running each handler, so follow-up work counts from when the
//! handler actually ran.

use std::{cmp::Ordering, collections::BinaryHeap, time::Duration};

struct Entry<E> {
    due: Duration,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Entry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<E> Eq for Entry<E> {}

impl<E> PartialOrd for Entry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Entry<E> {
    // Reversed so the max-heap yields the earliest deadline, FIFO among equals.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct Scheduler<E> {
    now: Duration,
    seq: u64,
    queue: BinaryHeap<Entry<E>>,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            seq: 0,
            queue: BinaryHeap::new(),
        }
    }

    /// Current queue time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Queue `event` to fire `after` the current queue time.
    pub fn schedule(&mut self, after: Duration, event: E) {
        self.seq += 1;
        self.queue.push(Entry {
            due: self.now + after,
            seq: self.seq,
            event,
        });
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.queue.peek().map(|entry| entry.due)
    }

    /// Pop the earliest event due at or before `until`.
    pub fn pop_due(&mut self, until: Duration) -> Option<E> {
        if self.queue.peek()?.due > until {
            return None;
        }
        let entry = self.queue.pop()?;
        self.now = self.now.max(entry.due);
        Some(entry.event)
    }

    /// Move the queue clock forward to `until` once nothing else is due.
    pub fn advance_clock(&mut self, until: Duration) {
        self.now = self.now.max(until);
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
