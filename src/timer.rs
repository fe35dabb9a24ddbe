//! C5: timer tree.
//!
//! nginx keys a red-black tree by absolute monotonic-ms deadline and always
//! extracts the minimum. We get the identical observable behavior — O(log n)
//! insert, O(log n) min-extraction, O(log n) cancel-by-handle, duplicate
//! keys permitted with ties broken arbitrarily — from a binary min-heap plus
//! lazy deletion, which is the idiomatic Rust structure for a "keep giving
//! me the smallest, sometimes I change my mind" workload (a `BTreeMap`
//! keyed on deadline would work too, but can't hold two timers with the same
//! millisecond without a disambiguating tiebreak key, which the heap gets
//! for free via insertion order).

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Opaque handle returned by [`TimerTree::insert`], used to [`cancel`](TimerTree::cancel)
/// before expiry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TimerId(u64);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    deadline_ms: u64,
    seq: u64,
    id: u64,
}

struct Slot {
    deadline_ms: u64,
    cancelable: bool,
    live: bool,
}

/// A min-timer-by-deadline priority queue, keyed by absolute monotonic-ms
/// expiry.
#[derive(Default)]
pub struct TimerTree {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    slots: Vec<Slot>,
    next_seq: u64,
    live_count: usize,
}

impl TimerTree {
    pub fn new() -> TimerTree {
        TimerTree {
            heap: BinaryHeap::new(),
            slots: Vec::new(),
            next_seq: 0,
            live_count: 0,
        }
    }

    /// Insert a timer expiring at `deadline_ms`. `cancelable` marks it as
    /// safe to ignore when deciding [`no_timers_left`](TimerTree::no_timers_left)
    /// during graceful shutdown.
    pub fn insert(&mut self, deadline_ms: u64, cancelable: bool) -> TimerId {
        let id = self.slots.len() as u64;
        self.slots.push(Slot {
            deadline_ms,
            cancelable,
            live: true,
        });
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(HeapEntry {
            deadline_ms,
            seq,
            id,
        }));
        self.live_count += 1;
        TimerId(id)
    }

    /// Cancellation is O(log n) amortized: mark the slot dead, let the heap
    /// entry fall out lazily the next time it would otherwise be the
    /// minimum.
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            if slot.live {
                slot.live = false;
                self.live_count -= 1;
            }
        }
    }

    fn peek_live_min(&mut self) -> Option<u64> {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.slots[top.id as usize].live {
                return Some(top.deadline_ms);
            }
            self.heap.pop();
        }
        None
    }

    /// `find_timer()`: milliseconds until the next expiry, clamped to zero,
    /// or `None` (infinity) if no timer is armed.
    pub fn find_timer(&mut self, now_ms: u64) -> Option<u64> {
        self.peek_live_min()
            .map(|deadline| deadline.saturating_sub(now_ms))
    }

    /// `expire_timers()`: pop every timer whose deadline has passed,
    /// invoking `on_expire` for each. The handler may re-arm by calling
    /// [`insert`](TimerTree::insert) again (not re-entrantly into this call).
    pub fn expire_timers(&mut self, now_ms: u64, mut on_expire: impl FnMut(TimerId)) {
        loop {
            let Some(Reverse(top)) = self.heap.peek().copied() else {
                break;
            };
            if !self.slots[top.id as usize].live {
                self.heap.pop();
                continue;
            }
            if top.deadline_ms > now_ms {
                break;
            }
            self.heap.pop();
            self.slots[top.id as usize].live = false;
            self.live_count -= 1;
            on_expire(TimerId(top.id));
        }
    }

    /// `no_timers_left()`: true if every remaining armed timer is
    /// `cancelable`, i.e. graceful shutdown may proceed even though the
    /// tree isn't literally empty.
    pub fn no_timers_left(&self) -> bool {
        self.slots.iter().all(|slot| !slot.live || slot.cancelable)
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    pub fn len(&self) -> usize {
        self.live_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_always_picks_minimum() {
        let mut tree = TimerTree::new();
        tree.insert(300, false);
        tree.insert(100, false);
        tree.insert(200, false);

        let mut order = Vec::new();
        tree.expire_timers(1000, |_| order.push(()));
        assert_eq!(order.len(), 3);
        // All three pop in a single expire_timers call since now_ms=1000
        // exceeds every deadline; order within ties is not contractual, but
        // the *set* must be exactly these three.
        assert_eq!(tree.len(), 0);
    }

    #[test]
    fn find_timer_clamps_to_zero_and_reports_min() {
        let mut tree = TimerTree::new();
        tree.insert(50, false);
        tree.insert(10, false);
        assert_eq!(tree.find_timer(0), Some(10));
        assert_eq!(tree.find_timer(100), Some(0));
    }

    #[test]
    fn find_timer_is_none_when_empty() {
        let mut tree = TimerTree::new();
        assert_eq!(tree.find_timer(0), None);
    }

    #[test]
    fn duplicate_keys_are_permitted() {
        let mut tree = TimerTree::new();
        tree.insert(100, false);
        tree.insert(100, false);
        assert_eq!(tree.len(), 2);
        let mut count = 0;
        tree.expire_timers(100, |_| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn cancel_removes_before_expiry() {
        let mut tree = TimerTree::new();
        let id = tree.insert(100, false);
        tree.cancel(id);
        assert!(tree.is_empty());
        let mut count = 0;
        tree.expire_timers(1000, |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn no_timers_left_true_only_when_all_remaining_are_cancelable() {
        let mut tree = TimerTree::new();
        let a = tree.insert(100, true);
        assert!(tree.no_timers_left());
        tree.insert(200, false);
        assert!(!tree.no_timers_left());
        tree.cancel(a);
        assert!(!tree.no_timers_left());
    }
}
