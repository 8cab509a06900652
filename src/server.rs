use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};

use crate::acceptor::Acceptor;
use crate::addr::InetAddr;
use crate::buffer::Buffer;
use crate::connection::{
    self, ConnCallbacks, CloseCallback, ConnectionCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::socket::{self, TcpSock};
use crate::thread_pool::{LoopThreadPool, ThreadInitCallback};
use crate::timestamp::Timestamp;

/// A multi-reactor TCP server.
///
/// The base loop accepts; each accepted connection is handed to a worker
/// loop chosen round-robin and stays on it for life. Set the callbacks and
/// worker count before [`start`](TcpServer::start).
///
/// ```no_run
/// use eddy::{EventLoop, InetAddr, TcpServer};
///
/// let event_loop = EventLoop::new().unwrap();
/// let mut server = TcpServer::bind(
///     &event_loop.handle(),
///     InetAddr::any(7890),
///     "echo",
///     false,
/// ).unwrap();
/// server.set_message_callback(|conn, buf, _| {
///     let bytes = buf.retrieve_all_as_string();
///     conn.send(bytes.as_bytes());
/// });
/// server.set_thread_count(4);
/// server.start();
/// event_loop.run();
/// ```
pub struct TcpServer {
    base: LoopHandle,
    name: String,
    ip_port: String,
    listen_socket: Option<TcpSock>,
    num_threads: usize,
    started: AtomicBool,
    /// Anchor id of the guts on the base loop, written by the start task.
    guts_id: Arc<AtomicU64>,
    connection_cb: Option<ConnectionCallback>,
    message_cb: Option<MessageCallback>,
    write_complete_cb: Option<WriteCompleteCallback>,
    thread_init_cb: Option<ThreadInitCallback>,
}

impl TcpServer {
    /// Create the listening socket and bind it, so configuration failures
    /// (address in use, permission) surface here rather than after start.
    pub fn bind(
        base: &LoopHandle,
        listen_addr: InetAddr,
        name: &str,
        reuse_port: bool,
    ) -> io::Result<TcpServer> {
        let socket = TcpSock::new()?;
        socket.set_reuse_addr(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(&listen_addr)?;
        // With port zero the kernel picked one; report the bound address.
        let ip_port = socket.local_addr()?.ip_port();
        Ok(TcpServer {
            base: base.clone(),
            name: name.to_string(),
            ip_port,
            listen_socket: Some(socket),
            num_threads: 0,
            started: AtomicBool::new(false),
            guts_id: Arc::new(AtomicU64::new(0)),
            connection_cb: None,
            message_cb: None,
            write_complete_cb: None,
            thread_init_cb: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound `"ip:port"` string.
    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// The bound address, useful after binding port zero.
    pub fn listen_addr(&self) -> io::Result<InetAddr> {
        match &self.listen_socket {
            Some(socket) => socket.local_addr(),
            None => self
                .ip_port
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "server already started")),
        }
    }

    /// Number of worker loops; zero keeps every connection on the base loop.
    pub fn set_thread_count(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    pub fn set_connection_callback<F>(&mut self, cb: F)
    where
        F: Fn(&TcpConnection) + Send + Sync + 'static,
    {
        self.connection_cb = Some(Arc::new(cb));
    }

    pub fn set_message_callback<F>(&mut self, cb: F)
    where
        F: Fn(&TcpConnection, &mut Buffer, Timestamp) + Send + Sync + 'static,
    {
        self.message_cb = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback<F>(&mut self, cb: F)
    where
        F: Fn(&TcpConnection) + Send + Sync + 'static,
    {
        self.write_complete_cb = Some(Arc::new(cb));
    }

    /// Runs once on each worker loop thread before it starts polling.
    pub fn set_thread_init_callback<F>(&mut self, cb: F)
    where
        F: Fn(&EventLoop) + Send + Sync + 'static,
    {
        self.thread_init_cb = Some(Arc::new(cb));
    }

    /// Start the worker pool and begin listening. Idempotent; the second
    /// and later calls do nothing.
    pub fn start(&mut self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let socket = self
            .listen_socket
            .take()
            .expect("listen socket consumed without start");
        let name = self.name.clone();
        let ip_port = self.ip_port.clone();
        let num_threads = self.num_threads;
        let thread_init = self.thread_init_cb.take();
        let connection_cb = self
            .connection_cb
            .take()
            .unwrap_or_else(|| Arc::new(connection::default_connection_callback));
        let message_cb = self
            .message_cb
            .take()
            .unwrap_or_else(|| Arc::new(connection::default_message_callback));
        let write_complete_cb = self.write_complete_cb.take();
        let guts_id = Arc::clone(&self.guts_id);

        self.base.run_in_loop(move |event_loop| {
            let mut pool = LoopThreadPool::new(event_loop.handle(), &name);
            pool.set_thread_count(num_threads);
            pool.start(event_loop, thread_init)
                .expect("failed to start the loop thread pool");

            let guts = Rc::new(ServerGuts {
                name,
                ip_port,
                base: event_loop.handle(),
                self_id: Cell::new(0),
                pool,
                acceptor: RefCell::new(None),
                connections: RefCell::new(HashMap::new()),
                next_conn_id: Cell::new(1),
                connection_cb,
                message_cb,
                write_complete_cb,
            });
            let id = event_loop.anchor(guts.clone());
            guts.self_id.set(id);
            guts_id.store(id, Ordering::Release);

            let acceptor = Acceptor::new(socket);
            let weak = Rc::downgrade(&guts);
            acceptor.set_new_connection_callback(Box::new(move |event_loop, fd, peer| {
                if let Some(guts) = weak.upgrade() {
                    guts.new_connection(event_loop, fd, peer);
                }
            }));
            acceptor.listen(event_loop);
            info!(
                "TcpServer [{}] listening on {}",
                guts.name, guts.ip_port
            );
            *guts.acceptor.borrow_mut() = Some(acceptor);
        });
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let id = self.guts_id.load(Ordering::Acquire);
        if id == 0 {
            return;
        }
        // Sequence teardown through the base loop; if that loop has already
        // stopped, the loop's own destruction reclaims the guts instead.
        self.base.run_in_loop(move |event_loop| {
            if let Some(guts) = event_loop.unanchor::<ServerGuts>(id) {
                guts.shutdown(event_loop);
            }
        });
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.name)
            .field("ip_port", &self.ip_port)
            .field("num_threads", &self.num_threads)
            .finish()
    }
}

/// The base-loop-resident half of a server: acceptor, worker pool and the
/// connection map. Touched only from the base loop, so no lock.
struct ServerGuts {
    name: String,
    ip_port: String,
    base: LoopHandle,
    self_id: Cell<u64>,
    pool: LoopThreadPool,
    acceptor: RefCell<Option<Rc<Acceptor>>>,
    connections: RefCell<HashMap<String, TcpConnection>>,
    /// Mutated only on the base loop.
    next_conn_id: Cell<u64>,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
}

impl ServerGuts {
    fn new_connection(&self, event_loop: &EventLoop, fd: OwnedFd, peer: InetAddr) {
        event_loop.assert_in_loop_thread();
        let io_loop = self.pool.next_loop();
        let id = self.next_conn_id.get();
        self.next_conn_id.set(id + 1);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        info!(
            "TcpServer [{}] new connection [{}] from {}",
            self.name, conn_name, peer
        );

        let local = match socket::local_addr_of(fd.as_raw_fd()) {
            Ok(local) => local,
            Err(err) => {
                warn!("getsockname failed for {}: {}", conn_name, err);
                InetAddr::any(0)
            }
        };
        let conn = TcpConnection::new(conn_name.clone(), local, peer, io_loop.clone());
        self.connections
            .borrow_mut()
            .insert(conn_name, conn.clone());

        let close_cb: CloseCallback = {
            let base = self.base.clone();
            let guts_id = self.self_id.get();
            Arc::new(move |conn: &TcpConnection| {
                let conn = conn.clone();
                base.run_in_loop(move |event_loop| {
                    remove_connection(event_loop, guts_id, conn);
                });
            })
        };
        let callbacks = ConnCallbacks {
            connection: Arc::clone(&self.connection_cb),
            message: Arc::clone(&self.message_cb),
            write_complete: self.write_complete_cb.clone(),
            close: close_cb,
        };
        io_loop.run_in_loop(move |event_loop| {
            connection::establish(event_loop, conn, fd, callbacks);
        });
    }

    fn shutdown(&self, event_loop: &EventLoop) {
        if let Some(acceptor) = self.acceptor.borrow_mut().take() {
            acceptor.close(event_loop);
        }
        for (_, conn) in self.connections.borrow_mut().drain() {
            conn.destroy();
        }
    }
}

/// Runs on the base loop: forget the connection, then let it finish dying on
/// its own loop.
fn remove_connection(event_loop: &EventLoop, guts_id: u64, conn: TcpConnection) {
    if let Some(guts) = event_loop.anchored::<ServerGuts>(guts_id) {
        info!(
            "TcpServer [{}] removing connection [{}]",
            guts.name,
            conn.name()
        );
        guts.connections.borrow_mut().remove(conn.name());
    }
    conn.destroy();
}
