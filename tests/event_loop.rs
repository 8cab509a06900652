use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use eddy::EventLoop;

mod util;

use util::init;

#[test]
fn tasks_queued_from_another_thread_run_once_on_the_loop_thread() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let loop_thread = thread::current().id();

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let producer = thread::spawn(move || {
        for i in 0..100 {
            let seen = Arc::clone(&seen);
            handle.queue_in_loop(move |_| {
                assert_eq!(thread::current().id(), loop_thread);
                seen.lock().unwrap().push(i);
            });
        }
        handle.queue_in_loop(|event_loop| event_loop.quit());
    });

    event_loop.run();
    producer.join().unwrap();

    // Exactly once each, in per-producer FIFO order.
    let order = order.lock().unwrap();
    assert_eq!(*order, (0..100).collect::<Vec<_>>());
}

#[test]
fn cross_thread_post_wakes_an_idle_loop_promptly() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let start = Instant::now();
    let poster = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.queue_in_loop(|event_loop| event_loop.quit());
    });
    event_loop.run();
    poster.join().unwrap();

    // Far below the 10 s poll timeout: the eventfd wake-up did its job.
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn run_in_loop_is_immediate_from_a_loop_callback() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let inner = handle.clone();
    handle.queue_in_loop(move |_| {
        let seen2 = Arc::clone(&seen);
        inner.run_in_loop(move |_| seen2.lock().unwrap().push("nested"));
        seen.lock().unwrap().push("after");
        inner.quit();
    });
    event_loop.run();

    assert_eq!(*order.lock().unwrap(), ["nested", "after"]);
}

#[test]
fn task_queued_mid_drain_runs_in_the_next_pass() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let passes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&passes);
    let requeue = handle.clone();
    handle.queue_in_loop(move |_| {
        counter.store(1, Ordering::SeqCst);
        let counter = Arc::clone(&counter);
        let quit = requeue.clone();
        // Queued while the loop is draining: must not be lost until the next
        // poll timeout.
        requeue.queue_in_loop(move |_| {
            counter.store(2, Ordering::SeqCst);
            quit.quit();
        });
    });

    let start = Instant::now();
    event_loop.run();
    assert_eq!(passes.load(Ordering::SeqCst), 2);
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn quit_from_another_thread_stops_the_loop() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let quitter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        handle.quit();
    });
    event_loop.run();
    quitter.join().unwrap();
}

#[test]
#[should_panic(expected = "another EventLoop already exists")]
fn two_loops_on_one_thread_panic() {
    init();
    let _first = EventLoop::new().unwrap();
    let _second = EventLoop::new().unwrap();
}
