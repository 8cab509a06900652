use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::thread;

use eddy::Buffer;

mod util;

use util::init;

#[test]
fn regions_start_empty() {
    let buf = Buffer::new();
    assert_eq!(buf.readable_bytes(), 0);
    assert_eq!(buf.writable_bytes(), 1024);
    assert_eq!(buf.prependable_bytes(), 8);
}

#[test]
fn append_retrieve_round_trip() {
    let mut buf = Buffer::new();
    buf.append(b"hello, eddy");
    assert_eq!(buf.readable_bytes(), 11);
    assert_eq!(buf.peek(), b"hello, eddy");

    assert_eq!(buf.retrieve_as_string(5), "hello");
    assert_eq!(buf.readable_bytes(), 6);
    assert_eq!(buf.prependable_bytes(), 8 + 5);

    assert_eq!(buf.retrieve_all_as_string(), ", eddy");
    // Consuming everything resets to the prepend boundary.
    assert_eq!(buf.readable_bytes(), 0);
    assert_eq!(buf.prependable_bytes(), 8);
}

#[test]
fn grows_when_tail_and_head_room_run_out() {
    let mut buf = Buffer::with_capacity(100);
    buf.append(&[b'x'; 90]);
    assert_eq!(buf.writable_bytes(), 10);
    buf.append(&[b'y'; 50]);
    assert_eq!(buf.readable_bytes(), 140);
    assert_eq!(&buf.peek()[..90], &[b'x'; 90][..]);
    assert_eq!(&buf.peek()[90..], &[b'y'; 50][..]);
}

#[test]
fn shifts_instead_of_growing_when_head_room_suffices() {
    let mut buf = Buffer::with_capacity(100);
    buf.append(&[b'a'; 80]);
    buf.retrieve(60);
    assert_eq!(buf.prependable_bytes(), 68);
    assert_eq!(buf.writable_bytes(), 20);

    // 60 bytes fit once the remaining 20 readable bytes move back to the
    // prepend boundary; the backing storage must not grow.
    buf.append(&[b'b'; 60]);
    assert_eq!(buf.prependable_bytes(), 8);
    assert_eq!(buf.readable_bytes(), 80);
    assert_eq!(buf.writable_bytes(), 100 + 8 - 8 - 80);
    assert_eq!(&buf.peek()[..20], &[b'a'; 20][..]);
}

#[test]
fn prepend_header_before_payload() {
    let mut buf = Buffer::new();
    buf.append(b"payload");
    buf.prepend_u32(7);
    assert_eq!(buf.readable_bytes(), 11);
    assert_eq!(buf.peek_u32(), 7);
    assert_eq!(buf.read_u32(), 7);
    assert_eq!(buf.retrieve_all_as_string(), "payload");
}

#[test]
fn crlf_search() {
    let mut buf = Buffer::new();
    buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
    assert_eq!(buf.find_crlf(), Some(14));
    assert_eq!(buf.find_crlf_from(15), Some(23));
    buf.retrieve_all();
    buf.append(b"no line ending");
    assert_eq!(buf.find_crlf(), None);
}

#[test]
fn scatter_read_overflows_into_extra_buffer() {
    init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let sent = payload.clone();
    let writer = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(&sent).unwrap();
    });

    let (stream, _) = listener.accept().unwrap();
    // A tiny buffer forces the second iovec to take the overflow.
    let mut buf = Buffer::with_capacity(8);
    let mut received = Vec::new();
    while received.len() < payload.len() {
        match buf.read_from_fd(stream.as_raw_fd()) {
            Ok(0) => break,
            Ok(n) => {
                assert_eq!(buf.readable_bytes(), n);
                received.extend_from_slice(buf.peek());
                buf.retrieve_all();
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::yield_now();
            }
            Err(err) => panic!("read failed: {}", err),
        }
    }
    writer.join().unwrap();
    assert_eq!(received, payload);
}
