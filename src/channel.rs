use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use log::trace;

use crate::event::{Interest, Readiness};
use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

/// Callback fired when the channel's descriptor has inbound data. Receives
/// the time at which the poll returned.
pub type ReadCallback = Box<dyn FnMut(&EventLoop, Timestamp)>;
/// Callback fired for writable, close and error events.
pub type EventCallback = Box<dyn FnMut(&EventLoop)>;

/// Registration bookkeeping maintained by the demultiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    /// Never registered, or removed from the demultiplexer's map.
    New,
    /// Present in the map and registered with the kernel.
    Added,
    /// Present in the map but deregistered because interest became empty.
    Deleted,
}

/// Binds a file descriptor to the events it is interested in and the
/// callbacks those events dispatch to.
///
/// A channel never owns its descriptor; the socket or timer object does. It
/// belongs to exactly one loop and every method must be called on that
/// loop's thread. Changing interest re-registers the channel with the loop's
/// demultiplexer.
pub struct Channel {
    fd: RawFd,
    interest: Cell<Interest>,
    revents: Cell<Readiness>,
    state: Cell<ChannelState>,
    /// Weak handle to the object whose lifetime governs whether callbacks
    /// may still run; upgraded before every dispatch when set.
    tie: RefCell<Option<Weak<dyn Any>>>,
    read_cb: RefCell<Option<ReadCallback>>,
    write_cb: RefCell<Option<EventCallback>>,
    close_cb: RefCell<Option<EventCallback>>,
    error_cb: RefCell<Option<EventCallback>>,
}

impl Channel {
    pub fn new(fd: RawFd) -> Rc<Channel> {
        Rc::new(Channel {
            fd,
            interest: Cell::new(Interest::NONE),
            revents: Cell::new(Readiness::NONE),
            state: Cell::new(ChannelState::New),
            tie: RefCell::new(None),
            read_cb: RefCell::new(None),
            write_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            error_cb: RefCell::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        self.interest.get()
    }

    pub(crate) fn set_revents(&self, revents: Readiness) {
        self.revents.set(revents);
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.set(state);
    }

    pub fn set_read_callback(&self, cb: impl FnMut(&EventLoop, Timestamp) + 'static) {
        *self.read_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut(&EventLoop) + 'static) {
        *self.write_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut(&EventLoop) + 'static) {
        *self.close_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut(&EventLoop) + 'static) {
        *self.error_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// Guard dispatch on the lifetime of `owner`: once the last strong
    /// reference to it is gone, pending events for this channel are dropped
    /// instead of fired.
    pub fn tie(&self, owner: Weak<dyn Any>) {
        *self.tie.borrow_mut() = Some(owner);
    }

    pub fn enable_reading(self: &Rc<Self>, event_loop: &EventLoop) {
        self.interest.set(self.interest.get().add(Interest::READABLE));
        self.update(event_loop);
    }

    pub fn disable_reading(self: &Rc<Self>, event_loop: &EventLoop) {
        self.interest.set(self.interest.get().remove(Interest::READABLE));
        self.update(event_loop);
    }

    pub fn enable_writing(self: &Rc<Self>, event_loop: &EventLoop) {
        self.interest.set(self.interest.get().add(Interest::WRITABLE));
        self.update(event_loop);
    }

    pub fn disable_writing(self: &Rc<Self>, event_loop: &EventLoop) {
        self.interest.set(self.interest.get().remove(Interest::WRITABLE));
        self.update(event_loop);
    }

    pub fn disable_all(self: &Rc<Self>, event_loop: &EventLoop) {
        self.interest.set(Interest::NONE);
        self.update(event_loop);
    }

    pub fn is_reading(&self) -> bool {
        self.interest.get().is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest.get().is_writable()
    }

    fn update(self: &Rc<Self>, event_loop: &EventLoop) {
        event_loop.update_channel(self);
    }

    /// Drop the channel from the demultiplexer. Must happen before the
    /// descriptor is closed.
    pub fn remove(self: &Rc<Self>, event_loop: &EventLoop) {
        event_loop.remove_channel(self);
    }

    /// Dispatch the readiness reported by the last poll.
    pub(crate) fn handle_event(self: &Rc<Self>, event_loop: &EventLoop, time: Timestamp) {
        let tie = self.tie.borrow().clone();
        match tie {
            Some(tie) => {
                // Keep the owner alive across every callback of this
                // dispatch; if it is already gone, the event dies here.
                if let Some(_guard) = tie.upgrade() {
                    self.dispatch(event_loop, time);
                } else {
                    trace!("fd={} owner is gone, dropping event", self.fd);
                }
            }
            None => self.dispatch(event_loop, time),
        }
    }

    fn dispatch(&self, event_loop: &EventLoop, time: Timestamp) {
        let revents = self.revents.get();
        trace!("fd={} handling {:?}", self.fd, revents);

        // A hang-up with nothing left to read means the peer is gone for
        // good. When readable data accompanies the hang-up the read branch
        // drains it and the close arrives through EOF instead.
        if revents.is_hangup() && !revents.has_input() {
            self.invoke(&self.close_cb, event_loop);
        }
        if revents.is_error() {
            self.invoke(&self.error_cb, event_loop);
        }
        if revents.is_readable() {
            if let Some(cb) = self.read_cb.borrow_mut().as_mut() {
                cb(event_loop, time);
            }
        }
        if revents.is_writable() {
            self.invoke(&self.write_cb, event_loop);
        }
    }

    fn invoke(&self, slot: &RefCell<Option<EventCallback>>, event_loop: &EventLoop) {
        if let Some(cb) = slot.borrow_mut().as_mut() {
            cb(event_loop);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest.get())
            .field("state", &self.state.get())
            .finish()
    }
}
