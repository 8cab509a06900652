//! Multi-reactor non-blocking TCP networking for Linux.
//!
//! One [`EventLoop`] per thread drives epoll-based readiness dispatch,
//! cross-thread task posting through an eventfd, and timerfd-backed timers.
//! [`TcpServer`] accepts on a base loop and distributes connections
//! round-robin over a pool of worker loops; [`TcpClient`] connects with
//! exponential-backoff retry. A [`TcpConnection`] is affine to one loop for
//! its whole life: every callback it fires runs on that loop's thread.
//!
//! ```no_run
//! use eddy::{EventLoop, InetAddr, TcpServer};
//!
//! let event_loop = EventLoop::new()?;
//! let mut server = TcpServer::bind(&event_loop.handle(), InetAddr::any(2007), "echo", false)?;
//! server.set_message_callback(|conn, buf, _time| {
//!     let bytes = buf.retrieve_all_as_string();
//!     conn.send(bytes.as_bytes());
//! });
//! server.start();
//! event_loop.run();
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! User callbacks run synchronously on loop threads and must not block;
//! offload blocking work and come back with
//! [`run_in_loop`](LoopHandle::run_in_loop).

#[cfg(not(target_os = "linux"))]
compile_error!("this crate requires Linux (epoll, timerfd, eventfd, accept4)");

mod acceptor;
mod addr;
mod buffer;
mod channel;
mod client;
mod connection;
mod connector;
mod event;
mod event_loop;
mod poller;
mod server;
mod sys;
mod thread_pool;
mod timer;
mod timestamp;

pub use addr::InetAddr;
pub use buffer::Buffer;
pub use channel::{Channel, EventCallback, ReadCallback};
pub use client::TcpClient;
pub use connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
pub use event::{Interest, Readiness};
pub use event_loop::{EventLoop, LoopHandle, Task};
pub use server::TcpServer;
pub use thread_pool::{LoopThread, LoopThreadPool, ThreadInitCallback};
pub use timer::{TimerCallback, TimerId};
pub use timestamp::Timestamp;
