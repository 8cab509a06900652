use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;

use log::{error, trace};

use crate::addr::InetAddr;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::socket::TcpSock;

/// Invoked on the base loop with each freshly accepted descriptor and its
/// peer address.
pub(crate) type NewConnectionCallback = Box<dyn FnMut(&EventLoop, OwnedFd, InetAddr)>;

/// Turns a bound listening socket into a stream of accepted descriptors.
///
/// Lives on the base loop; the socket is created and bound by the server
/// beforehand so that address-in-use and similar configuration failures
/// surface there.
pub(crate) struct Acceptor {
    socket: TcpSock,
    channel: Rc<Channel>,
    new_connection_cb: RefCell<Option<NewConnectionCallback>>,
    listening: Cell<bool>,
}

impl Acceptor {
    pub(crate) fn new(socket: TcpSock) -> Rc<Acceptor> {
        let channel = Channel::new(socket.as_raw_fd());
        let acceptor = Rc::new(Acceptor {
            socket,
            channel,
            new_connection_cb: RefCell::new(None),
            listening: Cell::new(false),
        });
        let weak = Rc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |event_loop, _| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read(event_loop);
            }
        });
        acceptor
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn listen(self: &Rc<Self>, event_loop: &EventLoop) {
        event_loop.assert_in_loop_thread();
        self.listening.set(true);
        if let Err(err) = self.socket.listen() {
            panic!("listen failed on fd {}: {}", self.socket.as_raw_fd(), err);
        }
        self.channel.enable_reading(event_loop);
    }

    /// One `accept4` per readable event; level-triggered polling re-notifies
    /// while the accept queue is non-empty.
    fn handle_read(&self, event_loop: &EventLoop) {
        event_loop.assert_in_loop_thread();
        match self.socket.accept() {
            Ok((fd, peer)) => {
                trace!("accepted connection from {}", peer);
                if let Some(cb) = self.new_connection_cb.borrow_mut().as_mut() {
                    cb(event_loop, fd, peer);
                } else {
                    // Nobody to hand the descriptor to; `fd` closes on drop.
                    drop(fd);
                }
            }
            Err(err) => {
                error!("accept failed: {}", err);
                if err.raw_os_error() == Some(libc::EMFILE) {
                    // Out of descriptors. Keep the acceptor alive; the
                    // listen queue will be drained once fds are freed.
                    error!("accept reached the open file descriptor limit");
                }
            }
        }
    }

    /// Detach from the loop before teardown.
    pub(crate) fn close(self: &Rc<Self>, event_loop: &EventLoop) {
        self.listening.set(false);
        self.channel.disable_all(event_loop);
        self.channel.remove(event_loop);
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("fd", &self.socket.as_raw_fd())
            .field("listening", &self.listening.get())
            .finish()
    }
}
