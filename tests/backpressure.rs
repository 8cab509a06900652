use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

mod util;

use util::start_server;

const HIGH_WATER_MARK: usize = 64 * 1024;
const PAYLOAD: usize = 16 << 20;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8).collect()
}

#[test]
fn high_water_mark_fires_and_write_complete_follows_the_drain() {
    let high_water = Arc::new(AtomicUsize::new(0));
    let high_water_len = Arc::new(AtomicUsize::new(0));
    let write_complete = Arc::new(AtomicUsize::new(0));

    let (addr, _handle, server) = {
        let high_water = Arc::clone(&high_water);
        let high_water_len = Arc::clone(&high_water_len);
        let write_complete = Arc::clone(&write_complete);
        start_server("flood", move |server| {
            let high_water = Arc::clone(&high_water);
            let high_water_len = Arc::clone(&high_water_len);
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    let high_water = Arc::clone(&high_water);
                    let high_water_len = Arc::clone(&high_water_len);
                    conn.set_high_water_mark_callback(HIGH_WATER_MARK, move |_, len| {
                        high_water.fetch_add(1, Ordering::SeqCst);
                        high_water_len.store(len, Ordering::SeqCst);
                    });
                    // One shot well past what the kernel buffers absorb, so
                    // the output buffer must cross the mark.
                    conn.send(&pattern(PAYLOAD));
                } else {
                    conn.loop_handle().quit();
                }
            });
            let write_complete = Arc::clone(&write_complete);
            server.set_write_complete_callback(move |_| {
                write_complete.fetch_add(1, Ordering::SeqCst);
            });
        })
    };

    let mut stream = TcpStream::connect(addr.ip_port()).unwrap();
    // Refuse to read for a while: the server's output buffer has to absorb
    // the payload and signal back-pressure.
    thread::sleep(Duration::from_millis(300));

    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();
    let mut received = Vec::with_capacity(PAYLOAD);
    let mut chunk = vec![0u8; 64 * 1024];
    while received.len() < PAYLOAD {
        let n = stream.read(&mut chunk).expect("read failed");
        assert_ne!(n, 0, "premature EOF after {} bytes", received.len());
        received.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(received, pattern(PAYLOAD));
    drop(stream);

    server.join().unwrap();
    assert!(high_water.load(Ordering::SeqCst) >= 1);
    assert!(high_water_len.load(Ordering::SeqCst) >= HIGH_WATER_MARK);
    // Exactly one drain of the output buffer, after the last byte left it.
    assert_eq!(write_complete.load(Ordering::SeqCst), 1);
}
