use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::trace;

use crate::channel::Channel;
use crate::poller::{self, Poller};
use crate::sys::Waker;
use crate::timer::{self, Timer, TimerCallback, TimerId, TimerQueue};
use crate::timestamp::Timestamp;

/// A closure posted to a loop; it runs on the loop's thread with the loop in
/// scope, after the poll-dispatch pass that received it.
pub type Task = Box<dyn FnOnce(&EventLoop) + Send>;

const POLL_TIMEOUT_MS: i32 = 10_000;

thread_local! {
    /// Set while `EventLoop::run` is executing on this thread, so same-thread
    /// posts can run their task immediately instead of queueing it.
    static CURRENT_LOOP: Cell<*const EventLoop> = const { Cell::new(ptr::null()) };
    /// One loop per thread, enforced at construction.
    static LOOP_ON_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// State reachable from other threads.
struct LoopShared {
    thread: ThreadId,
    waker: Waker,
    pending: Mutex<Vec<Task>>,
    quit: AtomicBool,
    looping: AtomicBool,
    calling_pending: AtomicBool,
    next_anchor: AtomicU64,
}

/// A cheap, cloneable, `Send` handle to an [`EventLoop`].
///
/// Everything that may be called from outside the loop's thread goes through
/// the handle: posting tasks, scheduling timers, quitting. A handle stays
/// valid after its loop has finished running; tasks posted then are simply
/// never executed.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Whether the calling thread is the one the loop lives on.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    /// Run `f` on the loop's thread: immediately when called from a callback
    /// on that thread, otherwise queued for the loop's next drain pass.
    pub fn run_in_loop<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        let mut f = Some(f);
        self.with_loop_if_current(|event_loop| (f.take().unwrap())(event_loop));
        if let Some(f) = f.take() {
            self.queue_in_loop(f);
        }
    }

    /// Queue `f` for the loop's next drain pass, waking the loop when the
    /// caller is off-thread or the loop is already mid-drain (a task queued
    /// by another task must not be lost until the next poll timeout).
    pub fn queue_in_loop<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push(Box::new(f));
        }
        // Skipping the wake-up is only sound when the loop itself queued the
        // task during its dispatch pass: the drain that follows will pick it
        // up. Everything else (off-thread callers, tasks queued mid-drain,
        // tasks queued before the loop started) needs the eventfd poke.
        if !self.is_in_loop_thread()
            || self.shared.calling_pending.load(Ordering::Acquire)
            || !self.shared.looping.load(Ordering::Acquire)
        {
            self.shared.waker.wake();
        }
    }

    /// Ask the loop to exit after its current iteration. Cooperative: the
    /// running callback finishes and pending tasks are drained first.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.shared.waker.wake();
        }
    }

    /// Schedule `cb` to run once at `when`.
    pub fn run_at<F>(&self, when: Timestamp, cb: F) -> TimerId
    where
        F: FnMut(&EventLoop) + Send + 'static,
    {
        self.schedule(when, None, Box::new(cb))
    }

    /// Schedule `cb` to run once, `delay` from now.
    pub fn run_after<F>(&self, delay: Duration, cb: F) -> TimerId
    where
        F: FnMut(&EventLoop) + Send + 'static,
    {
        self.schedule(Timestamp::now() + delay, None, Box::new(cb))
    }

    /// Schedule `cb` to run every `interval`, first firing one interval from
    /// now.
    pub fn run_every<F>(&self, interval: Duration, cb: F) -> TimerId
    where
        F: FnMut(&EventLoop) + Send + 'static,
    {
        self.schedule(Timestamp::now() + interval, Some(interval), Box::new(cb))
    }

    /// Cancel a scheduled timer. Safe from any thread, and from inside the
    /// timer's own callback; a repeating timer cancelled there stops firing.
    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move |event_loop| event_loop.cancel_timer(id));
    }

    fn schedule(
        &self,
        when: Timestamp,
        interval: Option<Duration>,
        cb: TimerCallback,
    ) -> TimerId {
        let sequence = timer::next_sequence();
        self.run_in_loop(move |event_loop| {
            event_loop.add_timer(Timer::new(sequence, when, interval, cb));
        });
        TimerId::new(sequence)
    }

    /// Run `f` with the loop if, and only if, this thread is currently
    /// inside that loop's `run`.
    pub(crate) fn with_loop_if_current<R>(&self, f: impl FnOnce(&EventLoop) -> R) -> Option<R> {
        CURRENT_LOOP.with(|current| {
            let current = current.get();
            if current.is_null() {
                return None;
            }
            // SAFETY: the pointer is published by `EventLoop::run` on this
            // thread for the duration of the loop and cleared before `run`
            // returns; `EventLoop` is `!Send`, so the loop it points at
            // lives on this very thread and cannot go away beneath us.
            let event_loop = unsafe { &*current };
            if Arc::ptr_eq(&event_loop.handle.shared, &self.shared) {
                Some(f(event_loop))
            } else {
                None
            }
        })
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .finish()
    }
}

/// One thread, one loop: poll for readiness, dispatch channel callbacks,
/// drain pending tasks, repeat.
///
/// The loop is pinned to the thread that constructed it (it is `!Send`), and
/// at most one loop may exist per thread. Everything it owns (demultiplexer,
/// timer queue, channels, anchored residents) is touched only from that
/// thread; other threads talk to it through its [`LoopHandle`], which posts
/// closures and wakes the loop through an eventfd registered in its own
/// demultiplexer.
pub struct EventLoop {
    handle: LoopHandle,
    poller: RefCell<Box<dyn Poller>>,
    timers: RefCell<TimerQueue>,
    wake_channel: Rc<Channel>,
    timer_channel: Rc<Channel>,
    /// Loop-resident objects (connections, acceptors, connectors) keyed by a
    /// never-reused id, so `Send` tasks can address them.
    anchors: RefCell<HashMap<u64, Rc<dyn Any>>>,
}

impl EventLoop {
    /// Create a loop on the current thread. Panics if this thread already
    /// has one.
    pub fn new() -> io::Result<EventLoop> {
        let poller = poller::from_env()?;
        let waker = Waker::new()?;
        let timers = TimerQueue::new()?;

        LOOP_ON_THREAD.with(|flag| {
            assert!(
                !flag.get(),
                "another EventLoop already exists on thread {:?}",
                thread::current().id()
            );
            flag.set(true);
        });

        let shared = Arc::new(LoopShared {
            thread: thread::current().id(),
            waker,
            pending: Mutex::new(Vec::new()),
            quit: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            next_anchor: AtomicU64::new(1),
        });

        let wake_channel = Channel::new(shared.waker.as_raw_fd());
        let timer_channel = Channel::new(timers.fd().as_raw_fd());
        let event_loop = EventLoop {
            handle: LoopHandle {
                shared: Arc::clone(&shared),
            },
            poller: RefCell::new(poller),
            timers: RefCell::new(timers),
            wake_channel: Rc::clone(&wake_channel),
            timer_channel: Rc::clone(&timer_channel),
            anchors: RefCell::new(HashMap::new()),
        };

        wake_channel.set_read_callback(move |_, _| shared.waker.drain());
        wake_channel.enable_reading(&event_loop);
        timer_channel.set_read_callback(|event_loop, _| event_loop.expire_timers());
        timer_channel.enable_reading(&event_loop);

        trace!("created EventLoop on {:?}", event_loop.handle.shared.thread);
        Ok(event_loop)
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.handle.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "loop-only operation called from {:?}; the loop lives on {:?}",
            thread::current().id(),
            self.handle.shared.thread
        );
    }

    /// Run the loop until [`quit`](LoopHandle::quit).
    pub fn run(&self) {
        self.assert_in_loop_thread();
        let shared = &self.handle.shared;
        assert!(
            !shared.looping.swap(true, Ordering::AcqRel),
            "EventLoop::run called re-entrantly"
        );
        trace!("EventLoop starts looping");

        let _current = CurrentGuard::new(self);
        let mut active: Vec<Rc<Channel>> = Vec::new();
        while !shared.quit.load(Ordering::Acquire) {
            active.clear();
            let time = self.poller.borrow_mut().poll(POLL_TIMEOUT_MS, &mut active);
            for channel in &active {
                channel.handle_event(self, time);
            }
            self.run_pending_tasks();
        }

        trace!("EventLoop stops looping");
        shared.looping.store(false, Ordering::Release);
    }

    /// See [`LoopHandle::run_in_loop`]; on the loop object itself a
    /// same-thread call always runs immediately.
    pub fn run_in_loop<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        if self.is_in_loop_thread() {
            f(self);
        } else {
            self.handle.queue_in_loop(f);
        }
    }

    pub fn queue_in_loop<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.handle.queue_in_loop(f);
    }

    pub fn quit(&self) {
        self.handle.quit();
    }

    pub fn run_at<F>(&self, when: Timestamp, cb: F) -> TimerId
    where
        F: FnMut(&EventLoop) + Send + 'static,
    {
        self.handle.run_at(when, cb)
    }

    pub fn run_after<F>(&self, delay: Duration, cb: F) -> TimerId
    where
        F: FnMut(&EventLoop) + Send + 'static,
    {
        self.handle.run_after(delay, cb)
    }

    pub fn run_every<F>(&self, interval: Duration, cb: F) -> TimerId
    where
        F: FnMut(&EventLoop) + Send + 'static,
    {
        self.handle.run_every(interval, cb)
    }

    pub fn cancel(&self, id: TimerId) {
        self.handle.cancel(id);
    }

    pub(crate) fn update_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    #[allow(dead_code)]
    pub(crate) fn has_channel(&self, channel: &Rc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    /// Keep a loop-affine object alive and addressable by id from `Send`
    /// tasks. Ids are never reused.
    pub(crate) fn anchor(&self, object: Rc<dyn Any>) -> u64 {
        self.assert_in_loop_thread();
        let id = self.handle.shared.next_anchor.fetch_add(1, Ordering::Relaxed);
        self.anchors.borrow_mut().insert(id, object);
        id
    }

    pub(crate) fn anchored<T: Any>(&self, id: u64) -> Option<Rc<T>> {
        let object = self.anchors.borrow().get(&id).cloned()?;
        object.downcast::<T>().ok()
    }

    pub(crate) fn unanchor<T: Any>(&self, id: u64) -> Option<Rc<T>> {
        self.assert_in_loop_thread();
        let object = self.anchors.borrow_mut().remove(&id)?;
        object.downcast::<T>().ok()
    }

    fn run_pending_tasks(&self) {
        let shared = &self.handle.shared;
        shared.calling_pending.store(true, Ordering::Release);
        // Snapshot then run: tasks queued by a running task land in the next
        // drain (and wake the loop), not in this iteration.
        let tasks = mem::take(&mut *shared.pending.lock().unwrap());
        for task in tasks {
            task(self);
        }
        shared.calling_pending.store(false, Ordering::Release);
    }

    fn expire_timers(&self) {
        let now = Timestamp::now();
        let expired = {
            let mut timers = self.timers.borrow_mut();
            timers.read_expirations();
            timers.extract_expired(now)
        };
        // The queue is unborrowed while callbacks run, so they may add or
        // cancel timers freely.
        for timer in &expired {
            timer.run(self);
        }
        self.timers.borrow_mut().after_expired(expired, now);
    }

    fn add_timer(&self, timer: Rc<Timer>) {
        self.timers.borrow_mut().add(timer);
    }

    fn cancel_timer(&self, id: TimerId) {
        self.timers.borrow_mut().cancel(id);
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.handle.shared.thread)
            .field("wake_fd", &self.wake_channel.fd())
            .field("timer_fd", &self.timer_channel.fd())
            .finish()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        LOOP_ON_THREAD.with(|flag| flag.set(false));
    }
}

struct CurrentGuard;

impl CurrentGuard {
    fn new(event_loop: &EventLoop) -> CurrentGuard {
        CURRENT_LOOP.with(|current| current.set(event_loop as *const EventLoop));
        CurrentGuard
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|current| current.set(ptr::null()));
    }
}
