//! Connect backoff against a closed port.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use riptide::metrics::CONNECT_RETRIES;
use riptide::{EventLoopThread, InetAddress, TcpClient};

/// A loopback port that nothing is listening on.
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[test]
fn backoff_schedule_and_stop() {
    let t = EventLoopThread::start("connector-loop").unwrap();
    let addr = InetAddress::from_ip_port("127.0.0.1", closed_port()).unwrap();
    let client = TcpClient::new(t.event_loop(), &addr, "backoff");

    let connected = Arc::new(AtomicBool::new(false));
    let flag = connected.clone();
    client.set_connection_callback(Arc::new(move |_| {
        flag.store(true, Ordering::Release);
    }));

    let base = CONNECT_RETRIES.value();
    let start = Instant::now();
    client.connect();

    // First attempt is refused immediately and schedules retry #1; the
    // retried attempts land near 500 ms and 1500 ms after that.
    let deadline = start + Duration::from_secs(5);
    while CONNECT_RETRIES.value() - base < 1 {
        assert!(Instant::now() < deadline, "first refusal never happened");
        std::thread::sleep(Duration::from_millis(5));
    }

    std::thread::sleep(Duration::from_millis(2200).saturating_sub(start.elapsed()));
    let retries = CONNECT_RETRIES.value() - base;
    assert!(
        (2..=4).contains(&retries),
        "expected the 500/1000 ms backoff cadence, saw {retries} retries in ~2.2 s"
    );

    client.stop();
    std::thread::sleep(Duration::from_millis(300));
    let after_stop = CONNECT_RETRIES.value();
    std::thread::sleep(Duration::from_millis(2500));
    assert_eq!(
        CONNECT_RETRIES.value(),
        after_stop,
        "stop must cancel the pending retry"
    );
    assert!(!connected.load(Ordering::Acquire));
}
