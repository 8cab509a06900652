use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, error, trace, warn};

use crate::addr::InetAddr;
use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::socket::TcpSock;
use crate::timestamp::Timestamp;

/// Fired when a connection becomes established and again when it goes down;
/// distinguish with [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;
/// Fired with the input buffer each time inbound data arrives; consume what
/// you can and leave the rest for the next read.
pub type MessageCallback = Arc<dyn Fn(&TcpConnection, &mut Buffer, Timestamp) + Send + Sync>;
/// Fired once the output buffer has fully drained into the kernel.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;
/// Fired when the output buffer crosses the high-water mark upward; the
/// second argument is its length at the crossing.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnection, usize) + Send + Sync>;
/// Internal removal hook wired by the server or client that owns the
/// connection.
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            3 => ConnState::Disconnected,
            _ => unreachable!("invalid connection state {}", value),
        }
    }
}

/// The thread-safe identity of a connection. User code may clone and stash
/// handles; the loop-affine half is reached through the anchor id.
struct ConnCore {
    name: String,
    local_addr: InetAddr,
    peer_addr: InetAddr,
    state: AtomicU8,
    event_loop: LoopHandle,
    /// Anchor id of the [`ConnInner`] on the connection's loop; zero until
    /// the connection is established there.
    inner_id: AtomicU64,
}

impl ConnCore {
    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// An established TCP connection with userspace read and write buffers.
///
/// This is a cloneable, `Send` handle: the value user callbacks receive and
/// the one stored in server and client maps. All I/O, buffer mutation and
/// callback dispatch happen on the one loop the connection is affine to;
/// calls from other threads are posted there.
#[derive(Clone)]
pub struct TcpConnection {
    core: Arc<ConnCore>,
}

impl TcpConnection {
    pub(crate) fn new(
        name: String,
        local_addr: InetAddr,
        peer_addr: InetAddr,
        event_loop: LoopHandle,
    ) -> TcpConnection {
        TcpConnection {
            core: Arc::new(ConnCore {
                name,
                local_addr,
                peer_addr,
                state: AtomicU8::new(ConnState::Connecting as u8),
                event_loop,
                inner_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn local_addr(&self) -> InetAddr {
        self.core.local_addr
    }

    pub fn peer_addr(&self) -> InetAddr {
        self.core.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.core.state() == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.core.state() == ConnState::Disconnected
    }

    /// Handle of the loop this connection is affine to.
    pub fn loop_handle(&self) -> LoopHandle {
        self.core.event_loop.clone()
    }

    /// Send bytes to the peer. Writes directly when called on the
    /// connection's loop thread with an empty output buffer; otherwise the
    /// bytes are queued (and copied, if the call crosses threads). Dropped
    /// with a log line when the connection is not connected.
    pub fn send(&self, data: &[u8]) {
        if self.core.state() != ConnState::Connected {
            debug!("send on {} ignored, not connected", self.name());
            return;
        }
        let ran = self
            .core
            .event_loop
            .with_loop_if_current(|event_loop| {
                if let Some(inner) = self.inner(event_loop) {
                    inner.send_in_loop(event_loop, data);
                }
            })
            .is_some();
        if !ran {
            let data = data.to_vec();
            let conn = self.clone();
            self.core.event_loop.run_in_loop(move |event_loop| {
                if let Some(inner) = conn.inner(event_loop) {
                    inner.send_in_loop(event_loop, &data);
                }
            });
        }
    }

    /// Close the write half once the output buffer has drained. The peer
    /// observes EOF after the remaining bytes; inbound data keeps flowing
    /// until the peer closes its side.
    pub fn shutdown(&self) {
        if self
            .core
            .transition(ConnState::Connected, ConnState::Disconnecting)
        {
            let conn = self.clone();
            self.core.event_loop.run_in_loop(move |event_loop| {
                if let Some(inner) = conn.inner(event_loop) {
                    inner.shutdown_in_loop(event_loop);
                }
            });
        }
    }

    /// Tear the connection down without waiting for the output buffer.
    pub fn force_close(&self) {
        let state = self.core.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            self.core.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.core.event_loop.queue_in_loop(move |event_loop| {
                if let Some(inner) = conn.inner(event_loop) {
                    inner.handle_close(event_loop);
                }
            });
        }
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        let conn = self.clone();
        self.core.event_loop.run_in_loop(move |event_loop| {
            if let Some(inner) = conn.inner(event_loop) {
                if let Err(err) = inner.socket.set_nodelay(on) {
                    warn!("failed to set TCP_NODELAY on {}: {}", conn.name(), err);
                }
            }
        });
    }

    /// Install the back-pressure callback, fired when the output buffer
    /// grows past `mark` bytes. At most one firing per upward crossing.
    pub fn set_high_water_mark_callback<F>(&self, mark: usize, cb: F)
    where
        F: Fn(&TcpConnection, usize) + Send + Sync + 'static,
    {
        let cb: HighWaterMarkCallback = Arc::new(cb);
        let conn = self.clone();
        self.core.event_loop.run_in_loop(move |event_loop| {
            if let Some(inner) = conn.inner(event_loop) {
                inner.high_water_mark.set(mark);
                *inner.high_water_cb.borrow_mut() = Some(cb);
            }
        });
    }

    /// Remove the loop-affine half and detach from the demultiplexer; the
    /// final step of a connection's life, sequenced through its own loop.
    pub(crate) fn destroy(&self) {
        let conn = self.clone();
        self.core.event_loop.queue_in_loop(move |event_loop| {
            let id = conn.core.inner_id.load(Ordering::Acquire);
            if let Some(inner) = event_loop.unanchor::<ConnInner>(id) {
                inner.connect_destroyed(event_loop);
            }
        });
    }

    /// Whether no clone of this handle lives outside the connection itself.
    /// A live connection's loop-affine half holds one internal back
    /// reference, so two strong counts (the caller's and that one) still
    /// mean "nobody else"; once the loop-affine half is destroyed only the
    /// caller's count remains.
    pub(crate) fn is_uniquely_held(&self) -> bool {
        Arc::strong_count(&self.core) <= 2
    }

    fn inner(&self, event_loop: &EventLoop) -> Option<Rc<ConnInner>> {
        event_loop.anchored::<ConnInner>(self.core.inner_id.load(Ordering::Acquire))
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.core.name)
            .field("state", &self.core.state())
            .field("local", &self.core.local_addr)
            .field("peer", &self.core.peer_addr)
            .finish()
    }
}

/// The callbacks wired into a new connection by its server or client.
pub(crate) struct ConnCallbacks {
    pub(crate) connection: ConnectionCallback,
    pub(crate) message: MessageCallback,
    pub(crate) write_complete: Option<WriteCompleteCallback>,
    pub(crate) close: CloseCallback,
}

/// Build the loop-affine half of `conn` around the connected descriptor and
/// run `connect_established`. Must be called on the connection's loop.
pub(crate) fn establish(
    event_loop: &EventLoop,
    conn: TcpConnection,
    fd: OwnedFd,
    callbacks: ConnCallbacks,
) {
    event_loop.assert_in_loop_thread();
    let socket = TcpSock::from_fd(fd);
    if let Err(err) = socket.set_keep_alive(true) {
        warn!("failed to set SO_KEEPALIVE on {}: {}", conn.name(), err);
    }
    let channel = Channel::new(socket.as_raw_fd());
    let inner = Rc::new(ConnInner {
        conn: conn.clone(),
        socket,
        channel: Rc::clone(&channel),
        input: RefCell::new(Buffer::new()),
        output: RefCell::new(Buffer::new()),
        high_water_mark: Cell::new(DEFAULT_HIGH_WATER_MARK),
        connection_cb: callbacks.connection,
        message_cb: callbacks.message,
        write_complete_cb: callbacks.write_complete,
        high_water_cb: RefCell::new(None),
        close_cb: callbacks.close,
    });

    let weak = Rc::downgrade(&inner);
    channel.set_read_callback(move |event_loop, time| {
        if let Some(inner) = weak.upgrade() {
            inner.handle_read(event_loop, time);
        }
    });
    let weak = Rc::downgrade(&inner);
    channel.set_write_callback(move |event_loop| {
        if let Some(inner) = weak.upgrade() {
            inner.handle_write(event_loop);
        }
    });
    let weak = Rc::downgrade(&inner);
    channel.set_close_callback(move |event_loop| {
        if let Some(inner) = weak.upgrade() {
            inner.handle_close(event_loop);
        }
    });
    let weak = Rc::downgrade(&inner);
    channel.set_error_callback(move |_| {
        if let Some(inner) = weak.upgrade() {
            inner.handle_error();
        }
    });

    let id = event_loop.anchor(inner.clone());
    conn.core.inner_id.store(id, Ordering::Release);
    inner.connect_established(event_loop);
}

/// The loop-affine half of a connection: descriptor, channel and buffers.
/// Anchored on the connection's loop and kept alive there until
/// `connect_destroyed`.
pub(crate) struct ConnInner {
    conn: TcpConnection,
    socket: TcpSock,
    channel: Rc<Channel>,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    high_water_mark: Cell<usize>,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_cb: RefCell<Option<HighWaterMarkCallback>>,
    close_cb: CloseCallback,
}

impl ConnInner {
    fn connect_established(self: &Rc<Self>, event_loop: &EventLoop) {
        debug_assert_eq!(self.conn.core.state(), ConnState::Connecting);
        self.conn.core.set_state(ConnState::Connected);
        // Guard channel dispatch on this object's lifetime: once destroyed,
        // late events are dropped instead of fired into freed state.
        let tie: Weak<ConnInner> = Rc::downgrade(self);
        let tie: Weak<dyn Any> = tie;
        self.channel.tie(tie);
        self.channel.enable_reading(event_loop);
        (self.connection_cb)(&self.conn);
    }

    pub(crate) fn connect_destroyed(self: &Rc<Self>, event_loop: &EventLoop) {
        event_loop.assert_in_loop_thread();
        if self.conn.core.state() == ConnState::Connected {
            self.conn.core.set_state(ConnState::Disconnected);
            self.channel.disable_all(event_loop);
            (self.connection_cb)(&self.conn);
        }
        self.channel.remove(event_loop);
    }

    fn handle_read(self: &Rc<Self>, event_loop: &EventLoop, time: Timestamp) {
        event_loop.assert_in_loop_thread();
        let result = self
            .input
            .borrow_mut()
            .read_from_fd(self.socket.as_raw_fd());
        match result {
            Ok(0) => self.handle_close(event_loop),
            Ok(_) => {
                let mut input = self.input.borrow_mut();
                (self.message_cb)(&self.conn, &mut input, time);
            }
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                error!("read error on {}: {}", self.conn.name(), err);
                self.handle_error();
            }
        }
    }

    fn send_in_loop(&self, event_loop: &EventLoop, data: &[u8]) {
        event_loop.assert_in_loop_thread();
        if self.conn.core.state() == ConnState::Disconnected {
            warn!("send on {} dropped, already disconnected", self.conn.name());
            return;
        }
        let mut wrote = 0;
        let mut fault = false;
        // Direct write only when nothing is queued, so bytes cannot overtake
        // the output buffer.
        if !self.channel.is_writing() && self.output.borrow().readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    wrote = n;
                    if wrote == data.len() {
                        self.queue_write_complete(event_loop);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    error!("write error on {}: {}", self.conn.name(), err);
                    if matches!(
                        err.raw_os_error(),
                        Some(libc::EPIPE) | Some(libc::ECONNRESET)
                    ) {
                        // Peer reset; the close event is already on its way.
                        fault = true;
                    }
                }
            }
        }

        let remaining = data.len() - wrote;
        if !fault && remaining > 0 {
            let (old_len, new_len) = {
                let mut output = self.output.borrow_mut();
                let old_len = output.readable_bytes();
                output.append(&data[wrote..]);
                (old_len, old_len + remaining)
            };
            let mark = self.high_water_mark.get();
            if old_len < mark && new_len >= mark {
                let cb = self.high_water_cb.borrow().clone();
                if let Some(cb) = cb {
                    let conn = self.conn.clone();
                    event_loop.queue_in_loop(move |_| cb(&conn, new_len));
                }
            }
            if !self.channel.is_writing() {
                // Level-triggered: the loop keeps reporting writability
                // while the kernel buffer has room and bytes remain here.
                self.channel.enable_writing(event_loop);
            }
        }
    }

    fn handle_write(self: &Rc<Self>, event_loop: &EventLoop) {
        event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("fd={} is down, no more writing", self.channel.fd());
            return;
        }
        let result = {
            let output = self.output.borrow();
            self.socket.write(output.peek())
        };
        match result {
            Ok(n) => {
                let drained = {
                    let mut output = self.output.borrow_mut();
                    output.retrieve(n);
                    output.readable_bytes() == 0
                };
                if drained {
                    self.channel.disable_writing(event_loop);
                    self.queue_write_complete(event_loop);
                    if self.conn.core.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop(event_loop);
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("write error on {}: {}", self.conn.name(), err),
        }
    }

    fn shutdown_in_loop(&self, event_loop: &EventLoop) {
        event_loop.assert_in_loop_thread();
        // A pending write postpones the FIN; `handle_write` comes back here
        // once the buffer drains.
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown(Shutdown::Write) {
                error!("shutdown failed on {}: {}", self.conn.name(), err);
            }
        }
    }

    fn handle_close(self: &Rc<Self>, event_loop: &EventLoop) {
        event_loop.assert_in_loop_thread();
        let state = self.conn.core.state();
        if state == ConnState::Disconnected {
            return;
        }
        trace!("close fd={} state={:?}", self.channel.fd(), state);
        self.conn.core.set_state(ConnState::Disconnected);
        self.channel.disable_all(event_loop);
        (self.connection_cb)(&self.conn);
        (self.close_cb)(&self.conn);
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(err)) => error!("connection {} SO_ERROR: {}", self.conn.name(), err),
            Ok(None) => {}
            Err(err) => error!("failed to read SO_ERROR on {}: {}", self.conn.name(), err),
        }
    }

    fn queue_write_complete(&self, event_loop: &EventLoop) {
        if let Some(cb) = self.write_complete_cb.clone() {
            let conn = self.conn.clone();
            event_loop.queue_in_loop(move |_| cb(&conn));
        }
    }
}

/// Logs connection up/down transitions; used when no user callback is set.
pub(crate) fn default_connection_callback(conn: &TcpConnection) {
    trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

/// Discards inbound data; used when no user callback is set.
pub(crate) fn default_message_callback(_: &TcpConnection, buffer: &mut Buffer, _: Timestamp) {
    buffer.retrieve_all();
}
