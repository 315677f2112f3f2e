//! The event loop: one selector, one wake-up channel, one timer
//! channel, one task queue, one timer queue, and the registrations of
//! every attached channel — driven by exactly one thread.

use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, trace, warn};

use crate::channel::{Channel, EventChannel, TimerChannel};
use crate::event::Interest;
use crate::options::EventLoopOptions;
use crate::queue::{EventQueue, Task};
use crate::selector::Selector;
use crate::time::{Duration, Timestamp};
use crate::timer::TimerQueue;
use crate::token::Token;
use crate::util::Latch;

const LOOPING: u32 = 0b001;
const JOINABLE: u32 = 0b010;
const CLOSED: u32 = 0b100;

/// Reserved registration of the wake-up channel.
pub(crate) const WAKER: Token = Token(usize::MAX - 1);
/// Reserved registration of the timer channel.
pub(crate) const TIMER: Token = Token(usize::MAX - 2);

thread_local! {
    // The loop inner driven by this thread, if any. `run` installs it
    // for its whole lifetime, which makes the under-loop check a
    // single pointer compare with no synchronization.
    static CURRENT: Cell<*const Inner> = const { Cell::new(ptr::null()) };
}

struct Registration {
    channel: Arc<dyn Channel>,
    on_deregister: Option<Task>,
}

struct Inner {
    options: EventLoopOptions,
    selector: Mutex<Selector>,
    event_channel: Arc<EventChannel>,
    timer_channel: Arc<TimerChannel>,
    event_queue: EventQueue,
    timer_queue: TimerQueue,
    channels: Mutex<HashMap<Token, Registration>>,
    next_token: AtomicUsize,
    state: AtomicU32,
    close_latch: Latch,
}

/// A single-threaded reactor.
///
/// One thread calls [`run`](EventLoop::run) and becomes the loop thread
/// for the loop's lifetime: every channel dispatch, queued task and
/// timer callback executes serially on it. All `schedule*` entry points
/// and [`close`](EventLoop::close) may be called from any thread.
///
/// The handle is cheaply cloneable; clones share the same loop.
///
/// # Examples
///
/// ```
/// use nio::EventLoop;
/// use std::sync::mpsc;
///
/// let event_loop = EventLoop::new().unwrap();
///
/// let driver = event_loop.clone();
/// let thread = std::thread::spawn(move || driver.run());
///
/// let (tx, rx) = mpsc::channel();
/// event_loop.schedule(move || tx.send(42).unwrap());
/// assert_eq!(rx.recv().unwrap(), 42);
///
/// event_loop.close();
/// event_loop.join();
/// thread.join().unwrap();
/// ```
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

impl EventLoop {
    /// Creates a loop with default options.
    pub fn new() -> io::Result<EventLoop> {
        EventLoop::with_options(EventLoopOptions::default())
    }

    /// Creates a loop with the given options.
    pub fn with_options(options: EventLoopOptions) -> io::Result<EventLoop> {
        let event_channel = Arc::new(EventChannel::new()?);
        let timer_channel = Arc::new(TimerChannel::new()?);

        let mut selector = Selector::new(options.selector_type)?;
        selector.add(WAKER, event_channel.fd(), Interest::READABLE)?;
        selector.add(TIMER, timer_channel.fd(), Interest::READABLE)?;

        let event_queue = EventQueue::new(options.event_queue_type, Arc::clone(&event_channel));
        let timer_queue = TimerQueue::new(options.timer_queue_type, Arc::clone(&timer_channel));

        let mut channels: HashMap<Token, Registration> = HashMap::new();
        channels.insert(
            WAKER,
            Registration {
                channel: Arc::clone(&event_channel) as Arc<dyn Channel>,
                on_deregister: None,
            },
        );
        channels.insert(
            TIMER,
            Registration {
                channel: Arc::clone(&timer_channel) as Arc<dyn Channel>,
                on_deregister: None,
            },
        );

        let inner = Arc::new(Inner {
            options,
            selector: Mutex::new(selector),
            event_channel,
            timer_channel,
            event_queue,
            timer_queue,
            channels: Mutex::new(channels),
            next_token: AtomicUsize::new(0),
            state: AtomicU32::new(0),
            close_latch: Latch::new(1),
        });

        // The dispatch hooks hold weak references: the channels must
        // not keep their own loop alive.
        let weak = Arc::downgrade(&inner);
        inner.event_channel.set_on_wake(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.event_queue.process();
            }
        }));
        let weak = Arc::downgrade(&inner);
        inner.timer_channel.set_on_expiry(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.timer_queue.process();
            }
        }));

        trace!("created event loop");
        Ok(EventLoop { inner })
    }

    /// Drives the loop until [`close`](EventLoop::close).
    ///
    /// The calling thread becomes the loop thread. If the loop is
    /// already being driven this returns immediately.
    pub fn run(&self) {
        let mut state = self.inner.state.load(Ordering::Acquire);
        loop {
            // Refuse a second driver, and refuse to start a loop that
            // was already closed.
            if state & (LOOPING | CLOSED) != 0 {
                return;
            }
            match self.inner.state.compare_exchange(
                state,
                LOOPING | JOINABLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }

        trace!("event loop running");
        CURRENT.with(|current| current.set(Arc::as_ptr(&self.inner)));

        while self.inner.state.load(Ordering::Acquire) & LOOPING != 0 {
            let mut batch = {
                let mut selector = self.inner.selector.lock().unwrap();
                if let Err(err) = selector.select(self.inner.options.select_timeout) {
                    error!("selector wait failed: {}", err);
                    continue;
                }
                selector.ready().to_vec()
            };
            let now = Timestamp::now();

            if batch.len() > 1 {
                // Wake-ups and timer expirations dispatch before
                // socket readiness within the same wake.
                let channels = self.inner.channels.lock().unwrap();
                batch.sort_by_key(|(token, _)| {
                    std::cmp::Reverse(
                        channels
                            .get(token)
                            .map_or(0, |registration| registration.channel.priority()),
                    )
                });
            }

            for (token, ready) in batch {
                // A dispatch earlier in this batch may have
                // deregistered the channel.
                let channel = {
                    let channels = self.inner.channels.lock().unwrap();
                    channels
                        .get(&token)
                        .map(|registration| Arc::clone(&registration.channel))
                };
                if let Some(channel) = channel {
                    channel.handle_events(ready, now);
                }
            }
        }

        // A close that lands between a dispatch and the state check
        // leaves its teardown task (and anything scheduled just before
        // it) undrained; run the queue one last time so every task
        // enqueued before the close is accounted for.
        self.inner.event_queue.process();

        CURRENT.with(|current| current.set(ptr::null()));
        trace!("event loop stopped");
    }

    /// Requests the loop to stop.
    ///
    /// The loop finishes its current iteration, runs a final task that
    /// deregisters its own channels, and releases joiners. Idempotent
    /// and callable from any thread.
    pub fn close(&self) {
        let prev = self.inner.state.fetch_or(CLOSED, Ordering::AcqRel);
        if prev & CLOSED != 0 {
            return;
        }
        self.inner.state.fetch_and(!LOOPING, Ordering::AcqRel);

        if prev & LOOPING == 0 {
            // Never started, and `run` now refuses, so no loop thread
            // will ever drain the queue. Anything already enqueued
            // still has to execute exactly once; drain it here, posing
            // as the loop thread so re-posting entry points run inline
            // instead of requeueing forever. The marker is restored in
            // case the closing thread drives another loop.
            let previous = CURRENT.with(|current| current.replace(Arc::as_ptr(&self.inner)));
            self.inner.event_queue.process();
            CURRENT.with(|current| current.set(previous));

            self.inner.close_latch.count_down();
            return;
        }

        trace!("event loop shutting down");
        let inner = Arc::clone(&self.inner);
        self.schedule(move || {
            {
                let mut selector = inner.selector.lock().unwrap();
                let _ = selector.remove(WAKER);
                let _ = selector.remove(TIMER);
            }
            {
                let mut channels = inner.channels.lock().unwrap();
                channels.remove(&WAKER);
                channels.remove(&TIMER);
            }
            inner.close_latch.count_down();
        });
    }

    /// Blocks until a closed loop has fully stopped. Returns
    /// immediately if the loop was never started.
    pub fn join(&self) {
        if self.inner.state.load(Ordering::Acquire) & JOINABLE == 0 {
            return;
        }
        self.inner.close_latch.wait();
    }

    /// True while `run` is being driven and `close` has not been
    /// requested.
    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) & LOOPING != 0
    }

    /// True when the calling thread is this loop's thread.
    pub fn is_under_loop(&self) -> bool {
        CURRENT.with(|current| ptr::eq(current.get(), Arc::as_ptr(&self.inner)))
    }

    /// Enqueues a task to run on the loop thread.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.event_queue.push(Box::new(task));
    }

    /// Runs `task` inline when already on the loop thread, otherwise
    /// enqueues it.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_under_loop() {
            task();
        } else {
            self.schedule(task);
        }
    }

    /// Schedules `callback` to run once after `delay`. Returns an id
    /// accepted by [`schedule_cancel`](EventLoop::schedule_cancel).
    pub fn schedule_after<F>(&self, delay: Duration, callback: F) -> u64
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .timer_queue
            .add(delay, Duration::ZERO, Box::new(callback))
    }

    /// Schedules `callback` to first run after `delay` and then every
    /// `interval`.
    pub fn schedule_every<F>(&self, delay: Duration, interval: Duration, callback: F) -> u64
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.timer_queue.add(delay, interval, Box::new(callback))
    }

    /// Cancels a scheduled callback. Best-effort: a callback already
    /// firing runs to completion. Idempotent.
    pub fn schedule_cancel(&self, id: u64) {
        self.inner.timer_queue.cancel(id);
    }

    pub(crate) fn next_token(&self) -> Token {
        Token(self.inner.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Adds a channel to the selector, interested in nothing until its
    /// owner widens the interest. Off-thread callers are re-posted onto
    /// the loop. `on_register` runs after a successful registration;
    /// `on_deregister` is kept and invoked when the channel leaves the
    /// loop.
    pub(crate) fn register(
        &self,
        channel: Arc<dyn Channel>,
        token: Token,
        on_register: Option<Task>,
        on_deregister: Option<Task>,
    ) {
        if !self.is_under_loop() {
            let this = self.clone();
            self.schedule(move || this.register(channel, token, on_register, on_deregister));
            return;
        }

        trace!("registering channel {:?}", token);
        {
            let mut selector = self.inner.selector.lock().unwrap();
            if selector.contains(token) {
                return;
            }
            selector
                .add(token, channel.fd(), Interest::NONE)
                .expect("failed to register channel with selector");
        }
        self.inner.channels.lock().unwrap().insert(
            token,
            Registration {
                channel,
                on_deregister,
            },
        );
        if let Some(hook) = on_register {
            hook();
        }
    }

    /// Removes a channel. The stored deregistration hook runs first,
    /// then `done`. A token that is not registered is a no-op, which
    /// makes repeated teardown paths safe.
    pub(crate) fn deregister(&self, token: Token, done: Option<Task>) {
        if !self.is_under_loop() {
            let this = self.clone();
            self.schedule(move || this.deregister(token, done));
            return;
        }

        trace!("deregistering channel {:?}", token);
        {
            let mut selector = self.inner.selector.lock().unwrap();
            if selector.contains(token) {
                if let Err(err) = selector.remove(token) {
                    warn!("failed to deregister {:?}: {}", token, err);
                }
            }
        }
        let registration = self.inner.channels.lock().unwrap().remove(&token);
        if let Some(registration) = registration {
            if let Some(hook) = registration.on_deregister {
                hook();
            }
        }
        // Runs even when there was nothing to remove, so callers
        // awaiting the completion never hang on a repeated teardown.
        if let Some(done) = done {
            done();
        }
    }

    /// Pushes a changed interest set through to the selector. Loop
    /// thread only.
    pub(crate) fn update_interest(&self, token: Token, interest: Interest) {
        debug_assert!(self.is_under_loop());
        let mut selector = self.inner.selector.lock().unwrap();
        if let Err(err) = selector.update(token, interest) {
            warn!("failed to update interest of {:?}: {}", token, err);
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.load(Ordering::Relaxed);
        f.debug_struct("EventLoop")
            .field("looping", &(state & LOOPING != 0))
            .field("joinable", &(state & JOINABLE != 0))
            .finish()
    }
}
