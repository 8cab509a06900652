use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::trace;

use crate::event_loop::EventLoop;
use crate::sys::TimerFd;
use crate::timestamp::Timestamp;

/// Work scheduled through [`run_at`](crate::LoopHandle::run_at) and friends;
/// runs on the owning loop's thread with that loop in scope.
pub type TimerCallback = Box<dyn FnMut(&EventLoop) + Send>;

/// Process-wide counter distinguishing every timer ever created.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Identifies a scheduled timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    sequence: u64,
}

impl TimerId {
    pub(crate) fn new(sequence: u64) -> TimerId {
        TimerId { sequence }
    }
}

pub(crate) struct Timer {
    sequence: u64,
    expiration: Cell<Timestamp>,
    interval: Option<Duration>,
    callback: RefCell<TimerCallback>,
}

impl Timer {
    pub(crate) fn new(
        sequence: u64,
        expiration: Timestamp,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> Rc<Timer> {
        Rc::new(Timer {
            sequence,
            expiration: Cell::new(expiration),
            interval,
            callback: RefCell::new(callback),
        })
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn expiration(&self) -> Timestamp {
        self.expiration.get()
    }

    fn repeats(&self) -> bool {
        self.interval.is_some()
    }

    fn restart(&self, now: Timestamp) {
        let interval = self.interval.expect("restarting a one-shot timer");
        self.expiration.set(now + interval);
    }

    pub(crate) fn run(&self, event_loop: &EventLoop) {
        (self.callback.borrow_mut())(event_loop);
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("sequence", &self.sequence)
            .field("expiration", &self.expiration.get())
            .field("interval", &self.interval)
            .finish()
    }
}

/// Min-ordered timer set for one loop, driven by a single timer descriptor.
///
/// Sequences are unique per timer, so `(expiration, sequence)` is a total
/// order and the sequence alone indexes the active set for cancellation.
/// Timers that expire together fire in creation order.
pub(crate) struct TimerQueue {
    fd: TimerFd,
    timers: BTreeMap<(Timestamp, u64), Rc<Timer>>,
    /// sequence → expiration for every scheduled timer.
    active: HashMap<u64, Timestamp>,
    /// Sequences cancelled while their callback batch is running; they must
    /// not be reinserted by `after_expired`.
    cancelling: HashSet<u64>,
    calling_expired: bool,
}

impl TimerQueue {
    pub(crate) fn new() -> io::Result<TimerQueue> {
        Ok(TimerQueue {
            fd: TimerFd::new()?,
            timers: BTreeMap::new(),
            active: HashMap::new(),
            cancelling: HashSet::new(),
            calling_expired: false,
        })
    }

    pub(crate) fn fd(&self) -> &TimerFd {
        &self.fd
    }

    /// Schedule `timer`, rearming the descriptor when the new timer becomes
    /// the earliest expiration.
    pub(crate) fn add(&mut self, timer: Rc<Timer>) {
        let earliest_changed = self.insert(timer);
        if earliest_changed {
            self.rearm();
        }
    }

    pub(crate) fn cancel(&mut self, id: TimerId) {
        if let Some(expiration) = self.active.remove(&id.sequence) {
            let removed = self.timers.remove(&(expiration, id.sequence));
            debug_assert!(removed.is_some());
            trace!("cancelled timer seq={}", id.sequence);
        } else if self.calling_expired {
            // The timer is in the expired batch currently running; keep it
            // from being rescheduled.
            self.cancelling.insert(id.sequence);
        }
        debug_assert_eq!(self.timers.len(), self.active.len());
    }

    pub(crate) fn read_expirations(&mut self) {
        let count = self.fd.read_expirations();
        trace!("timerfd fired, {} expiration(s)", count);
    }

    /// Move every timer due at `now` out of both indices. The caller runs
    /// their callbacks with the queue unborrowed, so a callback can freely
    /// add or cancel timers, then hands the batch back to
    /// [`after_expired`](TimerQueue::after_expired).
    pub(crate) fn extract_expired(&mut self, now: Timestamp) -> Vec<Rc<Timer>> {
        // Everything strictly below the sentinel is due; sequences are
        // always below u64::MAX.
        let remaining = self.timers.split_off(&(now, u64::MAX));
        let expired: Vec<Rc<Timer>> =
            std::mem::replace(&mut self.timers, remaining).into_values().collect();
        for timer in &expired {
            self.active.remove(&timer.sequence());
        }
        self.calling_expired = true;
        self.cancelling.clear();
        expired
    }

    /// Reschedule repeating timers from the finished batch and rearm the
    /// descriptor to the new earliest expiration.
    pub(crate) fn after_expired(&mut self, expired: Vec<Rc<Timer>>, now: Timestamp) {
        self.calling_expired = false;
        for timer in expired {
            if timer.repeats() && !self.cancelling.contains(&timer.sequence()) {
                timer.restart(now);
                self.insert(timer);
            }
        }
        if !self.timers.is_empty() {
            self.rearm();
        }
    }

    fn insert(&mut self, timer: Rc<Timer>) -> bool {
        let when = timer.expiration();
        let earliest_changed = match self.timers.keys().next() {
            Some(&(earliest, _)) => when < earliest,
            None => true,
        };
        self.active.insert(timer.sequence(), when);
        self.timers.insert((when, timer.sequence()), timer);
        debug_assert_eq!(self.timers.len(), self.active.len());
        earliest_changed
    }

    fn rearm(&self) {
        if let Some(&(earliest, _)) = self.timers.keys().next() {
            self.fd.set_alarm(earliest.duration_since(Timestamp::now()));
        }
    }
}
