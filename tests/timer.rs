use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use eddy::{EventLoop, Timestamp};

mod util;

use util::init;

#[test]
fn run_after_fires_once_no_earlier_than_the_delay() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    let start = Instant::now();
    event_loop.run_after(Duration::from_millis(100), move |event_loop| {
        counter.fetch_add(1, Ordering::SeqCst);
        event_loop.quit();
    });
    event_loop.run();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[test]
fn run_at_orders_with_run_after() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&order);
    event_loop.run_at(
        Timestamp::now() + Duration::from_millis(60),
        move |_| seen.lock().unwrap().push("later"),
    );
    let seen = Arc::clone(&order);
    event_loop.run_after(Duration::from_millis(20), move |_| {
        seen.lock().unwrap().push("sooner")
    });
    event_loop.run_after(Duration::from_millis(120), |event_loop| event_loop.quit());
    event_loop.run();

    assert_eq!(*order.lock().unwrap(), ["sooner", "later"]);
}

#[test]
fn run_every_repeats_until_cancelled_from_its_own_callback() {
    init();
    let event_loop = EventLoop::new().unwrap();

    let a_fired = Arc::new(AtomicUsize::new(0));
    let b_fired = Arc::new(AtomicUsize::new(0));
    let c_fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&a_fired);
    event_loop.run_after(Duration::from_millis(100), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&b_fired);
    event_loop.run_after(Duration::from_millis(100), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let c_id = Arc::new(OnceLock::new());
    let counter = Arc::clone(&c_fired);
    let own_id = Arc::clone(&c_id);
    let id = event_loop.run_every(Duration::from_millis(50), move |event_loop| {
        let fired = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if fired == 3 {
            // Cancelling a repeating timer inside its own callback must
            // suppress every later firing.
            event_loop.cancel(*own_id.get().unwrap());
        }
    });
    c_id.set(id).unwrap();

    event_loop.run_after(Duration::from_millis(400), |event_loop| event_loop.quit());
    event_loop.run();

    assert_eq!(a_fired.load(Ordering::SeqCst), 1);
    assert_eq!(b_fired.load(Ordering::SeqCst), 1);
    assert_eq!(c_fired.load(Ordering::SeqCst), 3);
}

#[test]
fn cancel_before_expiry_suppresses_the_firing() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    let id = event_loop.run_after(Duration::from_millis(100), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    event_loop.cancel(id);
    event_loop.run_after(Duration::from_millis(200), |event_loop| event_loop.quit());
    event_loop.run();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn run_every_respects_the_interval() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    let start = Instant::now();
    event_loop.run_every(Duration::from_millis(40), move |event_loop| {
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
            event_loop.quit();
        }
    });
    event_loop.run();

    // The fifth firing happens no earlier than five whole intervals.
    assert_eq!(fired.load(Ordering::SeqCst), 5);
    assert!(start.elapsed() >= Duration::from_millis(200));
}

#[test]
fn timers_scheduled_from_another_thread_fire_on_the_loop() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    let scheduler = std::thread::spawn(move || {
        handle.run_after(Duration::from_millis(50), move |event_loop| {
            counter.fetch_add(1, Ordering::SeqCst);
            event_loop.quit();
        });
    });
    event_loop.run();
    scheduler.join().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
