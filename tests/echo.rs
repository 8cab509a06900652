use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rand::RngCore;

mod util;

use util::{expect_eof, read_exact, read_to_eof, start_server};

#[test]
fn echo_on_a_single_thread() {
    let ups = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));

    let (addr, _handle, server) = {
        let ups = Arc::clone(&ups);
        let downs = Arc::clone(&downs);
        start_server("echo", move |server| {
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    ups.fetch_add(1, Ordering::SeqCst);
                } else {
                    assert!(conn.disconnected());
                    downs.fetch_add(1, Ordering::SeqCst);
                    conn.loop_handle().quit();
                }
            });
            server.set_message_callback(|conn, buf, _| {
                let data = buf.peek().to_vec();
                buf.retrieve_all();
                conn.send(&data);
                conn.shutdown();
            });
        })
    };

    let mut stream = TcpStream::connect(addr.ip_port()).unwrap();
    stream.write_all(b"hello").unwrap();
    assert_eq!(read_to_eof(&mut stream), b"hello");
    drop(stream);

    server.join().unwrap();
    assert_eq!(ups.load(Ordering::SeqCst), 1);
    assert_eq!(downs.load(Ordering::SeqCst), 1);
}

const CLIENTS: usize = 8;
const PAYLOAD: usize = 1 << 20;

#[test]
fn echo_through_a_worker_pool() {
    let downs = Arc::new(AtomicUsize::new(0));
    // Which loop thread each connection lives on; a connection must never
    // move.
    let affinity: Arc<Mutex<HashMap<String, thread::ThreadId>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let (addr, handle, server) = {
        let downs = Arc::clone(&downs);
        let affinity = Arc::clone(&affinity);
        let seen = Arc::clone(&affinity);
        start_server("echo-pool", move |server| {
            server.set_thread_count(4);
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    let previous = affinity
                        .lock()
                        .unwrap()
                        .insert(conn.name().to_string(), thread::current().id());
                    assert!(previous.is_none());
                } else {
                    downs.fetch_add(1, Ordering::SeqCst);
                }
            });
            server.set_message_callback(move |conn, buf, _| {
                let on_thread = seen.lock().unwrap()[conn.name()];
                assert_eq!(on_thread, thread::current().id());
                let data = buf.peek().to_vec();
                buf.retrieve_all();
                conn.send(&data);
            });
        })
    };

    let clients: Vec<_> = (0..CLIENTS)
        .map(|_| {
            let addr = addr;
            thread::spawn(move || {
                let mut payload = vec![0u8; PAYLOAD];
                rand::rng().fill_bytes(&mut payload);

                let mut stream = TcpStream::connect(addr.ip_port()).unwrap();
                let mut write_half = stream.try_clone().unwrap();
                let expected = payload.clone();
                let writer = thread::spawn(move || {
                    write_half.write_all(&payload).unwrap();
                });
                let echoed = read_exact(&mut stream, PAYLOAD);
                writer.join().unwrap();
                assert_eq!(echoed, expected);
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    // All clients have closed; wait for the server side to observe every
    // disconnect, then stop the base loop.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while downs.load(Ordering::SeqCst) < CLIENTS {
        assert!(std::time::Instant::now() < deadline, "disconnects missing");
        thread::sleep(std::time::Duration::from_millis(10));
    }
    handle.quit();
    server.join().unwrap();
    assert_eq!(downs.load(Ordering::SeqCst), CLIENTS);
    assert_eq!(affinity.lock().unwrap().len(), CLIENTS);
}

#[test]
fn half_close_delivers_data_then_eof() {
    const GREETING: &[u8] = b"daytime: 2024-01-01\n";

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let (addr, _handle, server) = {
        let events = Arc::clone(&events);
        let inbound = Arc::clone(&events);
        start_server("daytime", move |server| {
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    conn.send(GREETING);
                    conn.shutdown();
                } else {
                    events.lock().unwrap().push("down".to_string());
                    conn.loop_handle().quit();
                }
            });
            server.set_message_callback(move |_, buf, _| {
                let data = buf.retrieve_all_as_string();
                inbound.lock().unwrap().push(format!("msg:{}", data));
            });
        })
    };

    let mut stream = TcpStream::connect(addr.ip_port()).unwrap();
    // Data sent before the server's FIN arrives must still be delivered to
    // its message callback, ahead of the close.
    stream.write_all(b"thanks").unwrap();
    assert_eq!(read_to_eof(&mut stream), GREETING);
    drop(stream);

    server.join().unwrap();
    let events = events.lock().unwrap();
    assert_eq!(*events, ["msg:thanks", "down"]);
}

#[test]
fn send_after_peer_eof_is_dropped() {
    let (addr, handle, server) = start_server("late-send", |server| {
        server.set_connection_callback(|conn| {
            if !conn.connected() {
                // The connection is already disconnected; this send is
                // dropped with a log line, not delivered, not a crash.
                conn.send(b"too late");
                conn.loop_handle().quit();
            }
        });
    });

    let mut stream = TcpStream::connect(addr.ip_port()).unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();
    expect_eof(&mut stream);
    drop(stream);

    server.join().unwrap();
    drop(handle);
}
