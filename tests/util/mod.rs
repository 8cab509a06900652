// Not all helpers are used by every test file.
#![allow(dead_code)]

use std::io::Read;
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Once;
use std::thread;
use std::time::Duration;

use eddy::{EventLoop, InetAddr, LoopHandle, TcpServer};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Spawn a thread owning a base loop and a server bound to an ephemeral
/// loopback port. `configure` runs before `start`; the bound address and the
/// base loop's handle come back once the server is listening.
pub fn start_server<F>(
    name: &'static str,
    configure: F,
) -> (InetAddr, LoopHandle, thread::JoinHandle<()>)
where
    F: FnOnce(&mut TcpServer) + Send + 'static,
{
    init();
    let (tx, rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("failed to create base loop");
        let mut server =
            TcpServer::bind(&event_loop.handle(), InetAddr::loopback(0), name, false)
                .expect("failed to bind server");
        configure(&mut server);
        let addr = server.listen_addr().expect("bound address");
        server.start();
        tx.send((addr, event_loop.handle())).unwrap();
        event_loop.run();
    });
    let (addr, handle) = rx.recv().expect("server thread died during startup");
    (addr, handle, join)
}

/// Spawn a thread owning a bare loop, for client-side tests.
pub fn start_loop() -> (LoopHandle, thread::JoinHandle<()>) {
    init();
    let (tx, rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("failed to create loop");
        tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    let handle = rx.recv().expect("loop thread died during startup");
    (handle, join)
}

/// Read exactly `n` bytes, failing the test on EOF or a stall.
pub fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut buf = vec![0; n];
    stream.read_exact(&mut buf).expect("short read");
    buf
}

/// Read until the peer closes its write half.
pub fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).expect("read to EOF");
    buf
}

/// Expect EOF and nothing else.
pub fn expect_eof(stream: &mut TcpStream) {
    let buf = read_to_eof(stream);
    assert!(buf.is_empty(), "unexpected {} trailing byte(s)", buf.len());
}
