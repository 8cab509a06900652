use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::addr::InetAddr;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::socket::TcpSock;

/// Invoked on the loop with the connected descriptor once a connect attempt
/// succeeds.
pub(crate) type ConnectedCallback = Box<dyn FnMut(&EventLoop, OwnedFd)>;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

/// Drives a non-blocking `connect` with exponential-backoff retry.
///
/// Lives anchored on its client's loop; every method runs on that loop's
/// thread. While the connect is in flight the socket's writability is
/// watched through a throwaway channel; on writability `SO_ERROR` decides
/// between success, retry and giving up.
pub(crate) struct Connector {
    server_addr: InetAddr,
    /// Whether a connection is still wanted; cleared by `stop`.
    connect: Cell<bool>,
    state: Cell<State>,
    socket: RefCell<Option<TcpSock>>,
    channel: RefCell<Option<Rc<Channel>>>,
    retry_delay: Cell<Duration>,
    connected_cb: RefCell<Option<ConnectedCallback>>,
    /// This connector's anchor id on its loop, so retry timers can find it
    /// again without holding it alive.
    anchor_id: Cell<u64>,
}

impl Connector {
    pub(crate) fn new(server_addr: InetAddr) -> Rc<Connector> {
        Rc::new(Connector {
            server_addr,
            connect: Cell::new(false),
            state: Cell::new(State::Disconnected),
            socket: RefCell::new(None),
            channel: RefCell::new(None),
            retry_delay: Cell::new(INIT_RETRY_DELAY),
            connected_cb: RefCell::new(None),
            anchor_id: Cell::new(0),
        })
    }

    pub(crate) fn set_anchor_id(&self, id: u64) {
        self.anchor_id.set(id);
    }

    pub(crate) fn set_connected_callback(&self, cb: ConnectedCallback) {
        *self.connected_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn start(self: &Rc<Self>, event_loop: &EventLoop) {
        self.connect.set(true);
        self.start_in_loop(event_loop);
    }

    pub(crate) fn start_in_loop(self: &Rc<Self>, event_loop: &EventLoop) {
        event_loop.assert_in_loop_thread();
        if !self.connect.get() {
            debug!("connector for {} is stopped", self.server_addr);
            return;
        }
        // A redundant start while an attempt is in flight or already
        // succeeded must not touch the live socket and channel.
        if self.state.get() != State::Disconnected {
            debug!(
                "connector for {} is already {:?}",
                self.server_addr,
                self.state.get()
            );
            return;
        }
        self.do_connect(event_loop);
    }

    /// Reset the backoff and connect again. Loop thread only.
    pub(crate) fn restart(self: &Rc<Self>, event_loop: &EventLoop) {
        event_loop.assert_in_loop_thread();
        self.state.set(State::Disconnected);
        self.retry_delay.set(INIT_RETRY_DELAY);
        self.connect.set(true);
        self.start_in_loop(event_loop);
    }

    /// Stop connecting. An in-flight attempt is torn down; an established
    /// connection is unaffected.
    pub(crate) fn stop(self: &Rc<Self>, event_loop: &EventLoop) {
        self.connect.set(false);
        if self.state.get() == State::Connecting {
            self.state.set(State::Disconnected);
            self.detach_channel(event_loop);
            let socket = self.socket.borrow_mut().take();
            if let Some(socket) = socket {
                // With `connect` cleared this only closes the socket.
                self.retry(event_loop, socket);
            }
        }
    }

    fn do_connect(self: &Rc<Self>, event_loop: &EventLoop) {
        let socket = match TcpSock::new() {
            Ok(socket) => socket,
            Err(err) => panic!("failed to create connect socket: {}", err),
        };
        let result = socket.connect(&self.server_addr);
        let errno = match &result {
            Ok(()) => 0,
            Err(err) => err.raw_os_error().unwrap_or(0),
        };
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => {
                self.connecting(event_loop, socket);
            }
            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => {
                self.retry(event_loop, socket);
            }
            libc::EACCES | libc::EPERM | libc::EAFNOSUPPORT | libc::EALREADY | libc::EBADF
            | libc::EFAULT | libc::ENOTSOCK => {
                error!("connect to {} failed: {:?}", self.server_addr, result);
            }
            _ => {
                error!(
                    "unexpected error connecting to {}: {:?}",
                    self.server_addr, result
                );
            }
        }
    }

    fn connecting(self: &Rc<Self>, event_loop: &EventLoop, socket: TcpSock) {
        self.state.set(State::Connecting);
        let channel = Channel::new(socket.as_raw_fd());
        *self.socket.borrow_mut() = Some(socket);

        let weak = Rc::downgrade(self);
        channel.set_write_callback(move |event_loop| {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write(event_loop);
            }
        });
        let weak = Rc::downgrade(self);
        channel.set_error_callback(move |event_loop| {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error(event_loop);
            }
        });

        channel.enable_writing(event_loop);
        *self.channel.borrow_mut() = Some(channel);
    }

    /// Deregister and drop the connect channel. The dispatch pass still
    /// holds a strong reference while one of its callbacks is on the stack,
    /// so the channel is destroyed only after the handler returns.
    fn detach_channel(&self, event_loop: &EventLoop) {
        if let Some(channel) = self.channel.borrow_mut().take() {
            channel.disable_all(event_loop);
            channel.remove(event_loop);
        }
    }

    fn handle_write(self: &Rc<Self>, event_loop: &EventLoop) {
        if self.state.get() != State::Connecting {
            debug_assert_eq!(self.state.get(), State::Disconnected);
            return;
        }
        self.detach_channel(event_loop);
        let socket = self
            .socket
            .borrow_mut()
            .take()
            .expect("connecting without a socket");

        match socket.take_error() {
            Ok(Some(err)) => {
                warn!("SO_ERROR after connect to {}: {}", self.server_addr, err);
                self.retry(event_loop, socket);
            }
            Err(err) => {
                warn!("failed to read SO_ERROR: {}", err);
                self.retry(event_loop, socket);
            }
            Ok(None) => {
                if socket.is_self_connect() {
                    warn!("self connect to {}", self.server_addr);
                    self.retry(event_loop, socket);
                } else {
                    self.state.set(State::Connected);
                    if self.connect.get() {
                        if let Some(cb) = self.connected_cb.borrow_mut().as_mut() {
                            cb(event_loop, socket.into_fd());
                        }
                    }
                    // Not wanted any more: the socket closes on drop.
                }
            }
        }
    }

    fn handle_error(self: &Rc<Self>, event_loop: &EventLoop) {
        error!("connector error, state={:?}", self.state.get());
        if self.state.get() == State::Connecting {
            self.detach_channel(event_loop);
            let socket = self.socket.borrow_mut().take();
            if let Some(socket) = socket {
                if let Ok(Some(err)) = socket.take_error() {
                    error!("SO_ERROR = {}", err);
                }
                self.retry(event_loop, socket);
            }
        }
    }

    /// Close the failed socket and schedule the next attempt with a doubled
    /// delay, capped at thirty seconds.
    fn retry(self: &Rc<Self>, event_loop: &EventLoop, socket: TcpSock) {
        drop(socket);
        self.state.set(State::Disconnected);
        if self.connect.get() {
            let delay = self.retry_delay.get();
            info!(
                "retry connecting to {} in {} ms",
                self.server_addr,
                delay.as_millis()
            );
            self.retry_delay.set((delay * 2).min(MAX_RETRY_DELAY));
            let anchor_id = self.anchor_id.get();
            event_loop.run_after(delay, move |event_loop| {
                if let Some(connector) = event_loop.anchored::<Connector>(anchor_id) {
                    connector.start_in_loop(event_loop);
                }
            });
        } else {
            debug!("do not retry connecting to {}", self.server_addr);
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("server_addr", &self.server_addr)
            .field("state", &self.state.get())
            .field("connect", &self.connect.get())
            .finish()
    }
}
