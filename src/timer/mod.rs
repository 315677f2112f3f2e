//! Scheduled-callback queues draining on timer-channel expiry.
//!
//! Both implementations share one contract: `add` returns a stable id,
//! `cancel` is best-effort (a concurrently firing callback still runs
//! to completion), and `process` fires everything due at or before the
//! moment it snapshots the clock. The heap is optimal for few,
//! dispersed timers; the wheel trades a little firing precision for
//! O(1) inserts when many nearly identical delays are in flight.
//!
//! Cancellation is carried by ownership: the id table holds the only
//! strong reference to an entry, and the heap or wheel buckets hold
//! weak ones. Cancelling drops the strong reference; dangling
//! placements are skipped lazily when they surface.

use std::sync::Arc;

use crate::channel::TimerChannel;
use crate::options::TimerQueueType;
use crate::time::Duration;

mod heap;
mod wheel;

pub(crate) use self::heap::HeapTimerQueue;
pub(crate) use self::wheel::WheelTimerQueue;

/// A scheduled callback. Periodic entries fire it repeatedly, so it
/// must be callable more than once.
pub(crate) type TimerCallback = Box<dyn Fn() + Send + Sync + 'static>;

pub(crate) enum TimerQueue {
    Heap(HeapTimerQueue),
    Wheel(WheelTimerQueue),
}

impl TimerQueue {
    pub(crate) fn new(kind: TimerQueueType, channel: Arc<TimerChannel>) -> TimerQueue {
        match kind {
            TimerQueueType::Heap => TimerQueue::Heap(HeapTimerQueue::new(channel)),
            TimerQueueType::HashWheel => TimerQueue::Wheel(WheelTimerQueue::new(channel)),
        }
    }

    /// Schedules a callback after `delay`; a zero `interval` means
    /// one-shot, anything else refires that often. Returns the
    /// cancellation id.
    pub(crate) fn add(&self, delay: Duration, interval: Duration, callback: TimerCallback) -> u64 {
        match self {
            TimerQueue::Heap(q) => q.add(delay, interval, callback),
            TimerQueue::Wheel(q) => q.add(delay, interval, callback),
        }
    }

    pub(crate) fn cancel(&self, id: u64) {
        match self {
            TimerQueue::Heap(q) => q.cancel(id),
            TimerQueue::Wheel(q) => q.cancel(id),
        }
    }

    /// Fires everything due. Only the loop thread calls this, from the
    /// timer channel's expiry hook.
    pub(crate) fn process(&self) {
        match self {
            TimerQueue::Heap(q) => q.process(),
            TimerQueue::Wheel(q) => q.process(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration as StdDuration;

    fn variants() -> Vec<TimerQueue> {
        [TimerQueueType::Heap, TimerQueueType::HashWheel]
            .into_iter()
            .map(|kind| TimerQueue::new(kind, Arc::new(TimerChannel::new().unwrap())))
            .collect()
    }

    #[test]
    fn one_shot_fires_once() {
        for queue in variants() {
            let hits = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&hits);
            queue.add(
                Duration::ZERO,
                Duration::ZERO,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );

            thread::sleep(StdDuration::from_millis(1));
            queue.process();
            assert_eq!(hits.load(Ordering::SeqCst), 1);

            // Already removed: further drains never refire it.
            thread::sleep(StdDuration::from_millis(1));
            queue.process();
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn cancelled_entry_never_fires() {
        for queue in variants() {
            let hits = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&hits);
            let id = queue.add(
                Duration::from_millis(1),
                Duration::ZERO,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
            queue.cancel(id);

            thread::sleep(StdDuration::from_millis(5));
            queue.process();
            assert_eq!(hits.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn unexpired_entry_stays_queued() {
        for queue in variants() {
            let hits = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&hits);
            queue.add(
                Duration::from_secs(60),
                Duration::ZERO,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
            queue.process();
            assert_eq!(hits.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn periodic_entry_refires() {
        for queue in variants() {
            let hits = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&hits);
            queue.add(
                Duration::ZERO,
                Duration::from_millis(1),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );

            for _ in 0..3 {
                thread::sleep(StdDuration::from_millis(2));
                queue.process();
            }
            let fired = hits.load(Ordering::SeqCst);
            assert!(fired >= 2, "periodic timer fired {} times", fired);
        }
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        for queue in variants() {
            let a = queue.add(Duration::from_secs(1), Duration::ZERO, Box::new(|| {}));
            let b = queue.add(Duration::from_secs(1), Duration::ZERO, Box::new(|| {}));
            assert!(b > a);
        }
    }
}
