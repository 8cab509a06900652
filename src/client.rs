use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::addr::InetAddr;
use crate::buffer::Buffer;
use crate::connection::{
    self, CloseCallback, ConnCallbacks, ConnectionCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::socket;
use crate::timestamp::Timestamp;

/// A TCP client: one connection at a time, established through a
/// [`Connector`] with exponential-backoff retry, living on the caller's
/// loop.
///
/// With [`enable_retry`](TcpClient::enable_retry) the client reconnects
/// after an established connection goes down.
pub struct TcpClient {
    shared: Arc<ClientShared>,
    connection_cb: Option<ConnectionCallback>,
    message_cb: Option<MessageCallback>,
    write_complete_cb: Option<WriteCompleteCallback>,
}

/// State reachable from the client handle, its loop tasks and connection
/// callbacks alike.
struct ClientShared {
    event_loop: LoopHandle,
    name: String,
    server_addr: InetAddr,
    /// Anchor id of the connector on the loop; zero before `connect`.
    connector_id: AtomicU64,
    /// The established connection, if any. Under a mutex because user code
    /// may ask for it from any thread.
    connection: Mutex<Option<TcpConnection>>,
    retry: AtomicBool,
    /// Whether the user wants a connection at all; cleared by `disconnect`,
    /// `stop` and drop.
    connect: AtomicBool,
    next_conn_id: AtomicU64,
}

impl TcpClient {
    pub fn new(event_loop: &LoopHandle, server_addr: InetAddr, name: &str) -> TcpClient {
        TcpClient {
            shared: Arc::new(ClientShared {
                event_loop: event_loop.clone(),
                name: name.to_string(),
                server_addr,
                connector_id: AtomicU64::new(0),
                connection: Mutex::new(None),
                retry: AtomicBool::new(false),
                connect: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(1),
            }),
            connection_cb: None,
            message_cb: None,
            write_complete_cb: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn server_addr(&self) -> InetAddr {
        self.shared.server_addr
    }

    /// Reconnect after an established connection is lost.
    pub fn enable_retry(&mut self) {
        self.shared.retry.store(true, Ordering::Release);
    }

    pub fn retrying(&self) -> bool {
        self.shared.retry.load(Ordering::Acquire)
    }

    /// The current connection, if established.
    pub fn connection(&self) -> Option<TcpConnection> {
        self.shared.connection.lock().unwrap().clone()
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

    /// Start connecting. Retries recoverable failures with exponential
    /// backoff until established or stopped.
    pub fn connect(&mut self) {
        info!(
            "TcpClient [{}] connecting to {}",
            self.shared.name, self.shared.server_addr
        );
        self.shared.connect.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let connection_cb = self
            .connection_cb
            .clone()
            .unwrap_or_else(|| Arc::new(connection::default_connection_callback));
        let message_cb = self
            .message_cb
            .clone()
            .unwrap_or_else(|| Arc::new(connection::default_message_callback));
        let write_complete_cb = self.write_complete_cb.clone();

        self.shared.event_loop.run_in_loop(move |event_loop| {
            let id = shared.connector_id.load(Ordering::Acquire);
            if let Some(connector) = event_loop.anchored::<Connector>(id) {
                // A later connect() reuses the parked connector.
                connector.start(event_loop);
                return;
            }
            let connector = Connector::new(shared.server_addr);
            let id = event_loop.anchor(connector.clone());
            connector.set_anchor_id(id);
            shared.connector_id.store(id, Ordering::Release);

            let state = Arc::clone(&shared);
            connector.set_connected_callback(Box::new(move |event_loop, fd| {
                state.new_connection(
                    event_loop,
                    fd,
                    Arc::clone(&connection_cb),
                    Arc::clone(&message_cb),
                    write_complete_cb.clone(),
                );
            }));
            connector.start(event_loop);
        });
    }

    /// Shut down the current connection, if any, once its output drains.
    /// Does not stop a connect still in flight.
    pub fn disconnect(&self) {
        self.shared.connect.store(false, Ordering::Release);
        let conn = self.shared.connection.lock().unwrap().clone();
        if let Some(conn) = conn {
            conn.shutdown();
        }
    }

    /// Stop the connector; an in-flight connect attempt is abandoned.
    pub fn stop(&self) {
        self.shared.connect.store(false, Ordering::Release);
        let id = self.shared.connector_id.load(Ordering::Acquire);
        self.shared.event_loop.run_in_loop(move |event_loop| {
            if let Some(connector) = event_loop.anchored::<Connector>(id) {
                connector.stop(event_loop);
            }
        });
    }
}

impl ClientShared {
    fn new_connection(
        self: &Arc<Self>,
        event_loop: &EventLoop,
        fd: OwnedFd,
        connection_cb: ConnectionCallback,
        message_cb: MessageCallback,
        write_complete_cb: Option<WriteCompleteCallback>,
    ) {
        event_loop.assert_in_loop_thread();
        let peer = socket::peer_addr_of(fd.as_raw_fd()).unwrap_or_else(|err| {
            warn!("getpeername failed: {}", err);
            InetAddr::any(0)
        });
        let local = socket::local_addr_of(fd.as_raw_fd()).unwrap_or_else(|err| {
            warn!("getsockname failed: {}", err);
            InetAddr::any(0)
        });
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", self.name, peer.ip_port(), id);
        info!("TcpClient [{}] connected as [{}]", self.name, conn_name);

        let conn = TcpConnection::new(conn_name, local, peer, self.event_loop.clone());
        *self.connection.lock().unwrap() = Some(conn.clone());

        let close_cb: CloseCallback = {
            let shared = Arc::clone(self);
            Arc::new(move |conn: &TcpConnection| shared.remove_connection(conn))
        };
        connection::establish(
            event_loop,
            conn,
            fd,
            ConnCallbacks {
                connection: connection_cb,
                message: message_cb,
                write_complete: write_complete_cb,
                close: close_cb,
            },
        );
    }

    fn remove_connection(self: &Arc<Self>, conn: &TcpConnection) {
        let conn = conn.clone();
        let shared = Arc::clone(self);
        self.event_loop.run_in_loop(move |event_loop| {
            *shared.connection.lock().unwrap() = None;
            conn.destroy();
            if shared.retry.load(Ordering::Acquire) && shared.connect.load(Ordering::Acquire) {
                info!(
                    "TcpClient [{}] reconnecting to {}",
                    shared.name, shared.server_addr
                );
                let id = shared.connector_id.load(Ordering::Acquire);
                if let Some(connector) = event_loop.anchored::<Connector>(id) {
                    connector.restart(event_loop);
                }
            }
        });
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.shared.connect.store(false, Ordering::Release);
        let conn = self.shared.connection.lock().unwrap().take();
        if let Some(conn) = conn {
            // Force-close only when nobody else holds the connection. A
            // handle stashed by user code keeps working; its close hook
            // still runs the normal removal path when the peer goes away,
            // and the cleared connect flag keeps that path from
            // reconnecting.
            if conn.is_uniquely_held() {
                conn.force_close();
            }
        }
        let id = self.shared.connector_id.load(Ordering::Acquire);
        if id != 0 {
            self.shared.event_loop.run_in_loop(move |event_loop| {
                if let Some(connector) = event_loop.unanchor::<Connector>(id) {
                    connector.stop(event_loop);
                }
            });
        }
    }
}

impl fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClient")
            .field("name", &self.shared.name)
            .field("server_addr", &self.shared.server_addr)
            .finish()
    }
}
