//! Timer behavior through the public loop API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use riptide::{EventLoopThread, TimerId};

#[test]
fn run_after_fires_roughly_on_time() {
    let t = EventLoopThread::start("timer-loop").unwrap();
    let fired_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let slot = fired_at.clone();

    let start = Instant::now();
    t.event_loop().run_after(Duration::from_millis(100), move || {
        *slot.lock() = Some(Instant::now());
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while fired_at.lock().is_none() {
        assert!(Instant::now() < deadline, "timer never fired");
        std::thread::sleep(Duration::from_millis(5));
    }
    let fired = fired_at.lock().take().unwrap();
    let elapsed = fired - start;
    assert!(elapsed >= Duration::from_millis(100), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "fired far too late: {elapsed:?}");
}

#[test]
fn repeater_cancels_itself_after_three_runs() {
    let t = EventLoopThread::start("timer-loop-cancel").unwrap();
    let loop_ = t.event_loop().clone();

    let count = Arc::new(AtomicUsize::new(0));
    let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));
    let id = {
        let count = count.clone();
        let id_slot = id_slot.clone();
        let loop_inner = loop_.clone();
        loop_.run_every(Duration::from_millis(50), move || {
            let n = count.fetch_add(1, Ordering::AcqRel) + 1;
            if n == 3 {
                if let Some(id) = *id_slot.lock() {
                    loop_inner.cancel(id);
                }
            }
        })
    };
    *id_slot.lock() = Some(id);

    let deadline = Instant::now() + Duration::from_secs(5);
    while count.load(Ordering::Acquire) < 3 {
        assert!(Instant::now() < deadline, "repeater never reached three runs");
        std::thread::sleep(Duration::from_millis(10));
    }
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(
        count.load(Ordering::Acquire),
        3,
        "self-canceled repeater must not run again"
    );
}

#[test]
fn cancel_before_expiry_suppresses_the_callback() {
    let t = EventLoopThread::start("timer-loop-early-cancel").unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let id = t
        .event_loop()
        .run_after(Duration::from_millis(150), move || {
            c.fetch_add(1, Ordering::AcqRel);
        });
    t.event_loop().cancel(id);
    t.event_loop().cancel(id); // second cancel is a no-op

    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(count.load(Ordering::Acquire), 0);
}
