//! High-water-mark and write-complete behavior against a peer that stops
//! reading.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use riptide::{EventLoopThread, InetAddress, TcpConnectionPtr, TcpServer};

const THRESHOLD: usize = 1024;
const CHUNK: usize = 16 * 1024;
const MAX_CHUNKS: usize = 4096; // 64 MiB ceiling; kernel buffers fill long before

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn high_water_mark_fires_once_and_write_complete_follows_drain() {
    let t = EventLoopThread::start("bp-loop").unwrap();
    let server = TcpServer::new(
        t.event_loop(),
        &InetAddress::new(0, true),
        "flood",
        false,
    )
    .unwrap();

    let hwm_count = Arc::new(AtomicUsize::new(0));
    let hwm_size = Arc::new(AtomicUsize::new(0));
    let drains_after_hwm = Arc::new(AtomicUsize::new(0));
    let server_conn: Arc<Mutex<Option<TcpConnectionPtr>>> = Arc::new(Mutex::new(None));

    {
        let hwm_count = hwm_count.clone();
        let hwm_size = hwm_size.clone();
        let server_conn = server_conn.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                let hwm_count = hwm_count.clone();
                let hwm_size = hwm_size.clone();
                conn.set_high_water_mark_callback(
                    Arc::new(move |_, size| {
                        hwm_count.fetch_add(1, Ordering::AcqRel);
                        hwm_size.store(size, Ordering::Release);
                    }),
                    THRESHOLD,
                );
                *server_conn.lock() = Some(conn.clone());
            }
        }));
    }
    {
        let hwm_count = hwm_count.clone();
        let drains_after_hwm = drains_after_hwm.clone();
        server.set_write_complete_callback(Arc::new(move |_| {
            // drains before the mark is crossed are direct writes the
            // kernel absorbed; only the post-crossing drain matters here
            if hwm_count.load(Ordering::Acquire) > 0 {
                drains_after_hwm.fetch_add(1, Ordering::AcqRel);
            }
        }));
    }
    server.start();
    let addr = server.listen_addr().unwrap().socket_addr();

    // peer that reads nothing until told to
    let mut peer = {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(addr) {
                Ok(s) => break s,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("connect failed: {e}"),
            }
        }
    };

    wait_for("server connection", || server_conn.lock().is_some());
    let conn = server_conn.lock().clone().unwrap();

    // flood until the output buffer crosses the mark
    let chunk = vec![0xABu8; CHUNK];
    let mut sent = 0usize;
    for _ in 0..MAX_CHUNKS {
        conn.send(&chunk);
        sent += CHUNK;
        if hwm_count.load(Ordering::Acquire) > 0 {
            break;
        }
    }
    wait_for("high-water mark to fire", || {
        hwm_count.load(Ordering::Acquire) > 0
    });

    let size = hwm_size.load(Ordering::Acquire);
    assert!(size >= THRESHOLD, "reported size {size} below threshold");
    assert!(
        size < THRESHOLD + CHUNK,
        "reported size {size} exceeds one chunk past the threshold"
    );

    // the peer drains everything the server pushed
    let mut drained = 0usize;
    let mut read_buf = vec![0u8; 64 * 1024];
    peer.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    while drained < sent {
        let n = peer.read(&mut read_buf).unwrap();
        assert!(n > 0, "peer saw EOF before draining the flood");
        drained += n;
    }
    assert_eq!(drained, sent);

    wait_for("write-complete after the drain", || {
        drains_after_hwm.load(Ordering::Acquire) > 0
    });
    assert_eq!(
        drains_after_hwm.load(Ordering::Acquire),
        1,
        "output buffer must drain exactly once after the crossing"
    );
    assert_eq!(hwm_count.load(Ordering::Acquire), 1, "mark must fire once");
    assert_eq!(conn.output_bytes(), 0);
}
