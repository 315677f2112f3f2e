use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::channel::TimerChannel;
use crate::time::{Duration, Timestamp};
use crate::timer::TimerCallback;

/// Width of one wheel slot.
const TICK: Duration = Duration::from_millis(100);
/// Slots per rotation; one rotation spans `TICK * BUCKETS` of real
/// time, entries further out carry a rounds count.
const BUCKETS: usize = 600;

struct Entry {
    id: u64,
    interval: Duration,
    callback: TimerCallback,
}

struct Placement {
    // Full rotations left until this entry is due.
    rounds: u64,
    entry: Weak<Entry>,
}

impl PartialEq for Placement {
    fn eq(&self, other: &Placement) -> bool {
        self.rounds == other.rounds
    }
}

impl Eq for Placement {}

impl PartialOrd for Placement {
    fn partial_cmp(&self, other: &Placement) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Placement {
    // Reversed so the std max-heap pops the fewest rounds first.
    fn cmp(&self, other: &Placement) -> CmpOrdering {
        other.rounds.cmp(&self.rounds)
    }
}

#[derive(Default)]
struct Bucket {
    heap: Mutex<BinaryHeap<Placement>>,
}

impl Bucket {
    fn push(&self, rounds: u64, entry: Weak<Entry>) {
        self.heap.lock().unwrap().push(Placement { rounds, entry });
    }

    /// Pops the next entry due within `rounds` rotations, skipping
    /// cancelled placements. `None` once the bucket has nothing due.
    fn pop_due(&self, rounds: u64) -> Option<Arc<Entry>> {
        let mut heap = self.heap.lock().unwrap();
        loop {
            match heap.peek() {
                Some(top) if top.rounds <= rounds => {}
                _ => return None,
            }
            let placement = heap.pop().unwrap();
            if let Some(entry) = placement.entry.upgrade() {
                return Some(entry);
            }
        }
    }
}

/// Timer queue backed by a hashed timing wheel.
///
/// An entry expiring at `e` lands in bucket `(e / TICK) % BUCKETS`
/// carrying `e / TICK / BUCKETS` as its rounds count; a sweep visits
/// every slot between the previous and the current tick and fires
/// whatever has no rotations left. Inserts are O(1) and a tick's work
/// is proportional to what actually expired.
pub(crate) struct WheelTimerQueue {
    channel: Arc<TimerChannel>,
    counter: AtomicU64,
    last: Mutex<Timestamp>,
    buckets: Vec<Bucket>,
    table: Mutex<HashMap<u64, Arc<Entry>>>,
}

impl WheelTimerQueue {
    pub(crate) fn new(channel: Arc<TimerChannel>) -> WheelTimerQueue {
        let now = Timestamp::now();
        let queue = WheelTimerQueue {
            channel,
            counter: AtomicU64::new(0),
            last: Mutex::new(now),
            buckets: (0..BUCKETS).map(|_| Bucket::default()).collect(),
            table: Mutex::new(HashMap::new()),
        };
        queue.channel.wake_at(now + TICK);
        queue
    }

    fn ticks(ts: Timestamp) -> u64 {
        ts.as_micros() / TICK.as_micros() as u64
    }

    fn rounds(ts: Timestamp) -> u64 {
        Self::ticks(ts) / BUCKETS as u64
    }

    // Quantized down to the enclosing tick boundary.
    fn tick_floor(ts: Timestamp) -> Timestamp {
        let tick = TICK.as_micros() as u64;
        Timestamp::from_micros(ts.as_micros() / tick * tick)
    }

    fn insert(&self, expire: Timestamp, entry: &Arc<Entry>) {
        let bucket = Self::ticks(expire) as usize % BUCKETS;
        self.buckets[bucket].push(Self::rounds(expire), Arc::downgrade(entry));
    }

    pub(crate) fn add(&self, delay: Duration, interval: Duration, callback: TimerCallback) -> u64 {
        let expire = Timestamp::now() + delay;
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = Arc::new(Entry {
            id,
            interval,
            callback,
        });

        self.insert(expire, &entry);
        self.table.lock().unwrap().insert(id, entry);
        // At or before the deadline, on a tick boundary.
        self.channel.wake_at(Self::tick_floor(expire));
        id
    }

    pub(crate) fn cancel(&self, id: u64) {
        self.table.lock().unwrap().remove(&id);
    }

    pub(crate) fn process(&self) {
        let now = Timestamp::now();
        let rounds = Self::rounds(now);

        let (first, last) = {
            let mut list = self.last.lock().unwrap();
            let first = Self::ticks(*list);
            *list = now;
            (first, Self::ticks(now) + 1)
        };

        if last - first < BUCKETS as u64 {
            for tick in first..last {
                self.sweep(&self.buckets[tick as usize % BUCKETS], rounds, now);
            }
        } else {
            // The loop stalled for a full rotation; every slot is due
            // for inspection.
            for bucket in &self.buckets {
                self.sweep(bucket, rounds, now);
            }
        }

        self.channel.wake_at(Self::tick_floor(now + TICK));
    }

    fn sweep(&self, bucket: &Bucket, rounds: u64, now: Timestamp) {
        while let Some(entry) = bucket.pop_due(rounds) {
            if entry.interval > Duration::ZERO {
                self.insert(now + entry.interval, &entry);
            } else {
                self.table.lock().unwrap().remove(&entry.id);
            }
            // Outside the bucket and table locks.
            (entry.callback)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn placement_math() {
        let tick = TICK.as_micros() as u64;
        let ts = Timestamp::from_micros(tick * (BUCKETS as u64 * 2 + 3) + 17);
        assert_eq!(WheelTimerQueue::ticks(ts), BUCKETS as u64 * 2 + 3);
        assert_eq!(WheelTimerQueue::rounds(ts), 2);
        assert_eq!(
            WheelTimerQueue::tick_floor(ts),
            Timestamp::from_micros(tick * (BUCKETS as u64 * 2 + 3))
        );
    }

    #[test]
    fn far_future_entry_waits_for_its_round() {
        let queue = WheelTimerQueue::new(Arc::new(TimerChannel::new().unwrap()));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        // One full rotation away: lands in the current bucket but one
        // round out.
        queue.add(
            TICK * BUCKETS as i64,
            Duration::ZERO,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        queue.process();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bursts_of_identical_delays_all_fire() {
        let queue = WheelTimerQueue::new(Arc::new(TimerChannel::new().unwrap()));
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..1_000 {
            let counter = Arc::clone(&hits);
            queue.add(
                Duration::ZERO,
                Duration::ZERO,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
        queue.process();
        assert_eq!(hits.load(Ordering::SeqCst), 1_000);
    }
}
