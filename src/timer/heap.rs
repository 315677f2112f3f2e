use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::channel::TimerChannel;
use crate::time::{Duration, Timestamp};
use crate::timer::TimerCallback;

struct Entry {
    id: u64,
    interval: Duration,
    callback: TimerCallback,
}

struct Timeout {
    expire: Timestamp,
    // Breaks expiry ties so equal deadlines fire in insertion order.
    seq: u64,
    entry: Weak<Entry>,
}

impl PartialEq for Timeout {
    fn eq(&self, other: &Timeout) -> bool {
        self.expire == other.expire && self.seq == other.seq
    }
}

impl Eq for Timeout {}

impl PartialOrd for Timeout {
    fn partial_cmp(&self, other: &Timeout) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timeout {
    // Reversed so the std max-heap pops the earliest deadline.
    fn cmp(&self, other: &Timeout) -> CmpOrdering {
        other
            .expire
            .cmp(&self.expire)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Timeout>,
    table: HashMap<u64, Arc<Entry>>,
}

/// Timer queue backed by a binary heap keyed on absolute expiry.
///
/// The heap holds weak placements; the id table owns the entries.
/// `cancel` drops the strong reference and the heap skips the dangling
/// placement when it surfaces.
pub(crate) struct HeapTimerQueue {
    channel: Arc<TimerChannel>,
    counter: AtomicU64,
    seq: AtomicU64,
    state: Mutex<State>,
}

impl HeapTimerQueue {
    pub(crate) fn new(channel: Arc<TimerChannel>) -> HeapTimerQueue {
        HeapTimerQueue {
            channel,
            counter: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            state: Mutex::new(State::default()),
        }
    }

    pub(crate) fn add(&self, delay: Duration, interval: Duration, callback: TimerCallback) -> u64 {
        let expire = Timestamp::now() + delay;
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = Arc::new(Entry {
            id,
            interval,
            callback,
        });

        {
            let mut state = self.state.lock().unwrap();
            state.heap.push(Timeout {
                expire,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                entry: Arc::downgrade(&entry),
            });
            state.table.insert(id, entry);
        }
        self.channel.wake_at(expire);
        id
    }

    pub(crate) fn cancel(&self, id: u64) {
        self.state.lock().unwrap().table.remove(&id);
    }

    pub(crate) fn process(&self) {
        let now = Timestamp::now();

        // Stage everything due, then invoke outside the lock so a
        // callback can schedule or cancel without deadlocking.
        let mut due = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            while let Some(top) = state.heap.peek() {
                if top.expire > now {
                    break;
                }
                due.push(state.heap.pop().unwrap().entry);
            }
        }

        for placement in due {
            let entry = match placement.upgrade() {
                Some(entry) => entry,
                // Cancelled; skip the dangling placement.
                None => continue,
            };

            (entry.callback)();

            if entry.interval > Duration::ZERO {
                let expire = now + entry.interval;
                self.state.lock().unwrap().heap.push(Timeout {
                    expire,
                    seq: self.seq.fetch_add(1, Ordering::Relaxed),
                    entry: Arc::downgrade(&entry),
                });
                self.channel.wake_at(expire);
            } else {
                self.state.lock().unwrap().table.remove(&entry.id);
            }
        }

        // Whatever is due next must get its own wake-up: the dispatch
        // that brought us here reset the channel's armed deadline.
        let next = self.state.lock().unwrap().heap.peek().map(|t| t.expire);
        if let Some(expire) = next {
            self.channel.wake_at(expire);
        }
    }
}
