use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use eddy::{InetAddr, TcpClient};

mod util;

use util::{init, start_loop, start_server};

/// Grab an ephemeral port and release it, so connect attempts against it are
/// refused until the test binds it again.
fn idle_port() -> InetAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    InetAddr::loopback(port)
}

#[test]
fn connector_backs_off_until_a_listener_appears() {
    init();
    let addr = idle_port();
    let (handle, loop_thread) = start_loop();

    let (connected_tx, connected_rx) = mpsc::channel();
    let mut client = TcpClient::new(&handle, addr, "patient");
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            connected_tx.send(Instant::now()).unwrap();
        }
    });

    let started = Instant::now();
    client.connect();

    // Attempts run at ~0 ms, 500 ms, 1500 ms and 3500 ms; bind the port
    // while the third backoff (2000 ms) is pending.
    thread::sleep(Duration::from_millis(2000));
    let listener = TcpListener::bind(addr.ip_port()).unwrap();
    let (_server_side, _) = {
        let connected_at = connected_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("client never connected");
        let elapsed = connected_at - started;
        assert!(
            elapsed >= Duration::from_millis(3000),
            "connected after {:?}, before the fourth attempt was due",
            elapsed
        );
        assert!(elapsed < Duration::from_secs(8), "took {:?}", elapsed);
        listener.accept().unwrap()
    };

    assert!(client.connection().is_some());
    drop(client);
    handle.quit();
    loop_thread.join().unwrap();
}

#[test]
fn client_reconnects_when_retry_is_enabled() {
    init();
    let connects = Arc::new(AtomicUsize::new(0));

    let (addr, server_handle, server) = {
        let connects = Arc::clone(&connects);
        start_server("greeter", move |server| {
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    connects.fetch_add(1, Ordering::SeqCst);
                    // Hang up straight away; a retrying client comes back.
                    conn.shutdown();
                }
            });
        })
    };

    let (handle, loop_thread) = start_loop();
    let mut client = TcpClient::new(&handle, addr, "boomerang");
    client.enable_retry();
    client.connect();

    let deadline = Instant::now() + Duration::from_secs(10);
    while connects.load(Ordering::SeqCst) < 2 {
        assert!(Instant::now() < deadline, "no reconnect observed");
        thread::sleep(Duration::from_millis(20));
    }

    client.stop();
    drop(client);
    handle.quit();
    loop_thread.join().unwrap();
    server_handle.quit();
    server.join().unwrap();
}

#[test]
fn disconnect_shuts_the_connection_down() {
    init();
    let (addr, server_handle, server) = start_server("sink", |_| {});

    let (handle, loop_thread) = start_loop();
    let (down_tx, down_rx) = mpsc::channel();
    let mut client = TcpClient::new(&handle, addr, "polite");
    client.set_connection_callback(move |conn| {
        if !conn.connected() {
            down_tx.send(()).unwrap();
        }
    });
    client.connect();

    let deadline = Instant::now() + Duration::from_secs(10);
    while client.connection().is_none() {
        assert!(Instant::now() < deadline, "never connected");
        thread::sleep(Duration::from_millis(10));
    }

    client.disconnect();
    down_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("no disconnect event");
    // The slot is cleared on the loop thread just after the callback fires.
    let deadline = Instant::now() + Duration::from_secs(10);
    while client.connection().is_some() {
        assert!(Instant::now() < deadline, "stale connection handle");
        thread::sleep(Duration::from_millis(10));
    }

    drop(client);
    handle.quit();
    loop_thread.join().unwrap();
    server_handle.quit();
    server.join().unwrap();
}
