//! Monotonic timer queue for the worker loop
//!
//! `mio` has no timers of its own; the worker derives its poll timeout from
//! the earliest pending deadline and sweeps expired entries each turn.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

pub type TimerId = u64;

/// Deadline-ordered queue of events with cancellable handles. Cancellation
/// removes the payload; the heap entry is discarded lazily on expiry.
#[derive(Debug)]
pub struct TimerQueue<E> {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, E>,
    next_id: TimerId,
}

impl<E> TimerQueue<E> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn schedule(&mut self, after: Duration, event: E) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((Instant::now() + after, id)));
        self.entries.insert(id, event);
        id
    }

    /// Cancels a pending timer, returning its event if it had not fired.
    pub fn cancel(&mut self, id: TimerId) -> Option<E> {
        self.entries.remove(&id)
    }

    /// Whether the timer is still pending (not fired, not cancelled).
    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Duration until the earliest pending deadline, `None` when idle.
    /// Already-due deadlines report zero.
    pub fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if !self.entries.contains_key(&id) {
                self.heap.pop();
                continue;
            }
            return Some(deadline.saturating_duration_since(now));
        }
        None
    }

    /// Pops every event whose deadline has passed.
    pub fn expired(&mut self, now: Instant) -> Vec<E> {
        let mut out = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(event) = self.entries.remove(&id) {
                out.push(event);
            }
        }
        out
    }
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::TimerQueue;
    use std::time::{Duration, Instant};

    #[test]
    fn expired_pops_due_events_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.schedule(Duration::from_millis(0), "a");
        q.schedule(Duration::from_millis(0), "b");
        q.schedule(Duration::from_secs(60), "later");
        let now = Instant::now() + Duration::from_millis(1);
        assert_eq!(vec!["a", "b"], q.expired(now));
        assert!(q.is_scheduled(2));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut q = TimerQueue::new();
        let id = q.schedule(Duration::from_millis(0), "x");
        assert_eq!(Some("x"), q.cancel(id));
        let now = Instant::now() + Duration::from_millis(1);
        assert!(q.expired(now).is_empty());
    }

    #[test]
    fn next_timeout_skips_cancelled_heads() {
        let mut q = TimerQueue::new();
        let id = q.schedule(Duration::from_millis(1), "soon");
        q.schedule(Duration::from_secs(30), "later");
        q.cancel(id);
        let timeout = q.next_timeout(Instant::now()).unwrap();
        assert!(timeout > Duration::from_secs(20));
    }

    #[test]
    fn next_timeout_is_none_when_idle() {
        let mut q: TimerQueue<()> = TimerQueue::new();
        assert_eq!(None, q.next_timeout(Instant::now()));
    }
}
