use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::task::Waker;
use std::time::Instant;

use slab::Slab;

/// Deadline-ordered timer queue.
///
/// Entries in the heap are only hints; the slab slot is authoritative. A
/// canceled or re-armed slot leaves a stale heap entry behind, which is
/// skipped at fire time by comparing deadlines. Stale entries can make the
/// reactor wake early, never late.
pub(crate) struct Timers {
    heap: RefCell<BinaryHeap<Reverse<(Instant, usize)>>>,
    slots: RefCell<Slab<Slot>>,
}

struct Slot {
    deadline: Instant,
    waker: Waker,
}

#[derive(Debug)]
pub(crate) struct TimerKey(usize);

impl Timers {
    pub(crate) fn new() -> Timers {
        Timers {
            heap: RefCell::new(BinaryHeap::new()),
            slots: RefCell::new(Slab::new()),
        }
    }

    pub(crate) fn register(&self, deadline: Instant, waker: Waker) -> TimerKey {
        let key = self.slots.borrow_mut().insert(Slot { deadline, waker });
        self.heap.borrow_mut().push(Reverse((deadline, key)));
        TimerKey(key)
    }

    pub(crate) fn update_waker(&self, key: &TimerKey, waker: &Waker) {
        if let Some(slot) = self.slots.borrow_mut().get_mut(key.0) {
            if !slot.waker.will_wake(waker) {
                slot.waker = waker.clone();
            }
        }
    }

    pub(crate) fn cancel(&self, key: TimerKey) {
        let mut slots = self.slots.borrow_mut();
        if slots.contains(key.0) {
            slots.remove(key.0);
        }
    }

    /// Nearest deadline hint for the reactor poll timeout.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.borrow().peek().map(|Reverse((dl, _))| *dl)
    }

    /// Wake every slot whose deadline has passed.
    pub(crate) fn fire_due(&self, now: Instant) {
        loop {
            let due = {
                let mut heap = self.heap.borrow_mut();
                match heap.peek() {
                    Some(Reverse((dl, _))) if *dl <= now => heap.pop(),
                    _ => return,
                }
            };
            let Some(Reverse((deadline, key))) = due else {
                return;
            };
            let mut slots = self.slots.borrow_mut();
            let fire = matches!(slots.get(key), Some(slot) if slot.deadline == deadline);
            if fire {
                let slot = slots.remove(key);
                drop(slots);
                slot.waker.wake();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counting_waker() -> (Waker, Arc<AtomicUsize>) {
        struct Count(Arc<AtomicUsize>);
        impl futures_util::task::ArcWake for Count {
            fn wake_by_ref(arc_self: &Arc<Self>) {
                arc_self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let hits = Arc::new(AtomicUsize::new(0));
        (
            futures_util::task::waker(Arc::new(Count(hits.clone()))),
            hits,
        )
    }

    #[test]
    fn fires_in_deadline_order() {
        let timers = Timers::new();
        let now = Instant::now();
        let (w1, h1) = counting_waker();
        let (w2, h2) = counting_waker();
        let _k1 = timers.register(now + Duration::from_millis(10), w1);
        let _k2 = timers.register(now + Duration::from_millis(20), w2);

        timers.fire_due(now + Duration::from_millis(15));
        assert_eq!(h1.load(Ordering::SeqCst), 1);
        assert_eq!(h2.load(Ordering::SeqCst), 0);

        timers.fire_due(now + Duration::from_millis(25));
        assert_eq!(h2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn canceled_slot_does_not_fire() {
        let timers = Timers::new();
        let now = Instant::now();
        let (w, hits) = counting_waker();
        let key = timers.register(now + Duration::from_millis(5), w);
        timers.cancel(key);
        timers.fire_due(now + Duration::from_millis(10));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stale_heap_entry_skipped_after_rearm() {
        let timers = Timers::new();
        let now = Instant::now();
        let (w1, _h1) = counting_waker();
        let key = timers.register(now + Duration::from_millis(5), w1);
        timers.cancel(key);
        // Reuses the slab slot with a later deadline; the old heap entry is
        // now stale and must not fire the new slot early.
        let (w2, h2) = counting_waker();
        let _key2 = timers.register(now + Duration::from_millis(50), w2);
        timers.fire_due(now + Duration::from_millis(10));
        assert_eq!(h2.load(Ordering::SeqCst), 0);
        timers.fire_due(now + Duration::from_millis(60));
        assert_eq!(h2.load(Ordering::SeqCst), 1);
    }
}
