//! Min-heap timer storage keyed by absolute expiry.

// Layer 1: Standard library imports
use std::time::Duration;

/// Stable identity of a scheduled timer.
///
/// Handles stay valid until the timer fires or is cancelled; a handle for a
/// fired timer simply no longer matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Entry<T> {
    /// Absolute expiry in epoch seconds; 0 is shorthand for "immediately".
    when: i64,
    id: TimerId,
    payload: T,
}

/// Min-heap of one-shot timers ordered by absolute wall-clock expiry.
///
/// The heap owns opaque payloads rather than callbacks: [`TimerHeap::tick`]
/// pops everything due and hands the payloads back for dispatch. Anything a
/// dispatched handler schedules — even with an expiry already in the past —
/// lands in the heap for the *next* drain, never the current one.
///
/// Ties on equal `when` pop in unspecified order.
#[derive(Debug)]
pub struct TimerHeap<T> {
    entries: Vec<Entry<T>>,
    next_id: u64,
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerHeap<T> {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no timers are pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Schedules a timer at absolute time `when` (epoch seconds).
    ///
    /// A `when` of 0 means "as soon as possible": the timer is due on the
    /// next drain and its `fired_at` is the drain's `now`.
    pub fn add(&mut self, when: i64, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry { when, id, payload });
        self.sift_up(self.entries.len() - 1);
        id
    }

    /// Cancels a pending timer, returning its payload if it was still queued.
    ///
    /// The scan is O(n); at supervisor scale (a few timers per child) that
    /// beats maintaining a back-index.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let i = self.entries.iter().position(|e| e.id == id)?;
        Some(self.remove(i).payload)
    }

    /// Scheduled expiry of a pending timer; `None` once fired or cancelled.
    pub fn expiration(&self, id: TimerId) -> Option<i64> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.when)
    }

    /// Pops every timer due at `now` and returns `(payload, fired_at)` pairs
    /// in expiry order.
    ///
    /// `fired_at` is the scheduled time, so handlers can base rescheduling
    /// on it and avoid drift; the 0 sentinel is substituted with `now`.
    pub fn tick(&mut self, now: i64) -> Vec<(T, i64)> {
        let mut due = Vec::new();
        while let Some(top) = self.entries.first() {
            if top.when > now {
                break;
            }
            let entry = self.remove(0);
            let fired_at = if entry.when == 0 { now } else { entry.when };
            due.push((entry.payload, fired_at));
        }
        due
    }

    /// Delay until the next expiry, clipped to at least 1 µs and at most
    /// 1 s. The clip bounds worst-case latency for signal delivery and new
    /// registrations. An empty heap yields a 1-hour sentinel.
    pub fn next_delay(&self, now: i64) -> Duration {
        let top = match self.entries.first() {
            Some(entry) => entry,
            None => return Duration::from_secs(3600),
        };
        let remaining = top.when - now;
        if remaining >= 1 {
            Duration::from_secs(1)
        } else {
            Duration::from_micros(1)
        }
    }

    fn remove(&mut self, i: usize) -> Entry<T> {
        let entry = self.entries.swap_remove(i);
        if i < self.entries.len() {
            let i = self.sift_up(i);
            self.sift_down(i);
        }
        entry
    }

    fn sift_up(&mut self, mut i: usize) -> usize {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.entries[i].when < self.entries[parent].when {
                self.entries.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
        i
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let a = i * 2 + 1;
            let b = i * 2 + 2;
            let mut min = i;
            if a < self.entries.len() && self.entries[a].when < self.entries[min].when {
                min = a;
            }
            if b < self.entries.len() && self.entries[b].when < self.entries[min].when {
                min = b;
            }
            if min == i {
                break;
            }
            self.entries.swap(i, min);
            i = min;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_tick_in_order() {
        let mut heap = TimerHeap::new();
        heap.add(30, "c");
        heap.add(10, "a");
        heap.add(20, "b");

        let due = heap.tick(25);
        assert_eq!(due, vec![("a", 10), ("b", 20)]);
        assert_eq!(heap.len(), 1);

        let due = heap.tick(30);
        assert_eq!(due, vec![("c", 30)]);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_add_then_cancel_restores_prior_state() {
        let mut heap = TimerHeap::new();
        heap.add(10, "keep");
        heap.add(20, "keep2");

        let id = heap.add(15, "gone");
        assert_eq!(heap.cancel(id), Some("gone"));
        assert_eq!(heap.len(), 2);

        let due = heap.tick(100);
        let payloads: Vec<&str> = due.iter().map(|(p, _)| *p).collect();
        assert_eq!(payloads, vec!["keep", "keep2"]);
    }

    #[test]
    fn test_cancel_unknown_id_is_noop() {
        let mut heap = TimerHeap::new();
        let id = heap.add(10, 1);
        assert_eq!(heap.cancel(id), Some(1));
        assert_eq!(heap.cancel(id), None);
    }

    #[test]
    fn test_zero_sentinel_fires_with_now() {
        let mut heap = TimerHeap::new();
        heap.add(0, "asap");
        let due = heap.tick(1234);
        assert_eq!(due, vec![("asap", 1234)]);
    }

    #[test]
    fn test_past_due_fires_with_scheduled_time() {
        let mut heap = TimerHeap::new();
        heap.add(100, "late");
        let due = heap.tick(5000);
        assert_eq!(due, vec![("late", 100)]);
    }

    #[test]
    fn test_expiration_readback() {
        let mut heap = TimerHeap::new();
        let id = heap.add(42, ());
        assert_eq!(heap.expiration(id), Some(42));
        heap.tick(42);
        assert_eq!(heap.expiration(id), None);
    }

    #[test]
    fn test_next_delay_clipped_to_one_second() {
        let mut heap = TimerHeap::new();
        heap.add(1000, ());
        assert_eq!(heap.next_delay(10), Duration::from_secs(1));
    }

    #[test]
    fn test_next_delay_floor_one_microsecond() {
        let mut heap = TimerHeap::new();
        heap.add(10, ());
        // Due or overdue timers still yield a positive wait.
        assert_eq!(heap.next_delay(10), Duration::from_micros(1));
        assert_eq!(heap.next_delay(500), Duration::from_micros(1));
    }

    #[test]
    fn test_next_delay_empty_sentinel() {
        let heap: TimerHeap<()> = TimerHeap::new();
        assert_eq!(heap.next_delay(0), Duration::from_secs(3600));
    }

    #[test]
    fn test_many_timers_drain_sorted() {
        let mut heap = TimerHeap::new();
        for when in [9, 3, 7, 1, 8, 2, 6, 4, 5, 10] {
            heap.add(when, when);
        }
        let due = heap.tick(10);
        let fired: Vec<i64> = due.iter().map(|(_, at)| *at).collect();
        assert_eq!(fired, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }
}
