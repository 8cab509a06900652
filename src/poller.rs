use std::collections::HashMap;
use std::env;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use log::{error, trace, warn};

use crate::channel::{Channel, ChannelState};
use crate::event::Readiness;
use crate::sys::syscall;
use crate::timestamp::Timestamp;

/// The I/O demultiplexer behind an event loop: readiness registration on one
/// side, `poll → active channels` on the other. Only the owning loop's
/// thread may touch it.
pub(crate) trait Poller {
    /// Wait up to `timeout_ms` for readiness, append every channel with
    /// reported events to `active` (with its `revents` set) and return the
    /// time at which the wait returned.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Timestamp;

    /// Register, re-register or deregister `channel` according to its
    /// current interest and registration state.
    fn update_channel(&mut self, channel: &Rc<Channel>);

    /// Forget `channel` entirely.
    fn remove_channel(&mut self, channel: &Rc<Channel>);

    fn has_channel(&self, channel: &Rc<Channel>) -> bool;
}

/// Environment variable that would select the `poll(2)` backend. That
/// backend is declared but not shipped, so the epoll demultiplexer is used
/// either way.
const USE_POLL_ENV: &str = "EDDY_USE_POLL";

/// Build the demultiplexer for a new loop.
pub(crate) fn from_env() -> io::Result<Box<dyn Poller>> {
    if env::var_os(USE_POLL_ENV).is_some() {
        warn!(
            "{} is set, but the poll(2) backend is not compiled in; using epoll",
            USE_POLL_ENV
        );
    }
    EpollPoller::new().map(|poller| Box::new(poller) as Box<dyn Poller>)
}

const INITIAL_EVENTS: usize = 16;

pub(crate) struct EpollPoller {
    ep: OwnedFd,
    /// Every channel currently known to this demultiplexer, registered or
    /// parked, keyed by descriptor.
    channels: HashMap<RawFd, Rc<Channel>>,
    events: Vec<libc::epoll_event>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        let ep = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(EpollPoller {
            // SAFETY: `epoll_create1(2)` returned a valid, unowned fd.
            ep: unsafe { OwnedFd::from_raw_fd(ep) },
            channels: HashMap::new(),
            events: Vec::with_capacity(INITIAL_EVENTS),
        })
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let mut event = libc::epoll_event {
            events: channel.interest().to_epoll(),
            u64: channel.fd() as u64,
        };
        let res = syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            op,
            channel.fd(),
            &mut event,
        ));
        if let Err(err) = res {
            if op == libc::EPOLL_CTL_ADD {
                // A channel the kernel refuses to watch can never fire; the
                // loop it belongs to would hang silently.
                panic!("epoll_ctl ADD failed for fd {}: {}", channel.fd(), err);
            }
            error!("epoll_ctl op {} failed for fd {}: {}", op, channel.fd(), err);
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Timestamp {
        let res = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            timeout_ms,
        ));
        match res {
            Ok(n) => {
                let n = n as usize;
                // SAFETY: `epoll_wait` initialised the first `n` entries.
                unsafe { self.events.set_len(n) };
                for event in &self.events {
                    let fd = event.u64 as RawFd;
                    if let Some(channel) = self.channels.get(&fd) {
                        channel.set_revents(Readiness::from_epoll(event.events));
                        active.push(Rc::clone(channel));
                    }
                }
                if n == self.events.capacity() {
                    // Full array: there may be more readiness than fits, so
                    // double for the next wait.
                    self.events.reserve_exact(n);
                }
                trace!("{} event(s) reported", n);
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("epoll_wait failed: {}", err),
        }
        Timestamp::now()
    }

    fn update_channel(&mut self, channel: &Rc<Channel>) {
        let state = channel.state();
        trace!(
            "update channel fd={} interest={:?} state={:?}",
            channel.fd(),
            channel.interest(),
            state
        );
        match state {
            ChannelState::New | ChannelState::Deleted => {
                if state == ChannelState::New {
                    self.channels.insert(channel.fd(), Rc::clone(channel));
                }
                channel.set_state(ChannelState::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            ChannelState::Added => {
                if channel.interest().is_empty() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_state(ChannelState::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Rc<Channel>) {
        trace!("remove channel fd={}", channel.fd());
        if self.channels.remove(&channel.fd()).is_some() && channel.state() == ChannelState::Added
        {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_state(ChannelState::New);
    }

    fn has_channel(&self, channel: &Rc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|found| Rc::ptr_eq(found, channel))
    }
}
