//! End-to-end echo over real loopback sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use riptide::{EventLoopThread, InetAddress, TcpServer};

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn connect_with_retry(addr: std::net::SocketAddrV4) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(5))
            }
            Err(e) => panic!("server never started listening: {e}"),
        }
    }
}

fn echo_server(loop_thread: &EventLoopThread, disconnects: &Arc<AtomicUsize>) -> TcpServer {
    let server = TcpServer::new(
        loop_thread.event_loop(),
        &InetAddress::new(0, true),
        "echo",
        false,
    )
    .unwrap();
    let d = disconnects.clone();
    server.set_connection_callback(Arc::new(move |conn| {
        if !conn.connected() {
            d.fetch_add(1, Ordering::AcqRel);
        }
    }));
    server.set_message_callback(Arc::new(|conn, buf| {
        let data = buf.retrieve_as_bytes();
        conn.send(&data);
    }));
    server.start();
    server
}

#[test]
fn echo_round_trip_and_disconnect_bookkeeping() {
    let t = EventLoopThread::start("echo-loop").unwrap();
    let disconnects = Arc::new(AtomicUsize::new(0));
    let server = echo_server(&t, &disconnects);
    let addr = server.listen_addr().unwrap().socket_addr();

    let mut stream = connect_with_retry(addr);
    stream.write_all(b"ping\n").unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping\n");

    wait_for("server to register the connection", || {
        server.connection_count() == 1
    });

    drop(stream);
    wait_for("disconnect notification", || {
        disconnects.load(Ordering::Acquire) == 1
    });
    wait_for("connection map to shrink", || server.connection_count() == 0);
}

#[test]
fn echo_handles_many_sequential_messages() {
    let t = EventLoopThread::start("echo-loop-seq").unwrap();
    let disconnects = Arc::new(AtomicUsize::new(0));
    let server = echo_server(&t, &disconnects);
    let addr = server.listen_addr().unwrap().socket_addr();

    let mut stream = connect_with_retry(addr);
    for i in 0..100u32 {
        let msg = format!("message-{i:03}\n");
        stream.write_all(msg.as_bytes()).unwrap();
        let mut buf = vec![0u8; msg.len()];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, msg.as_bytes());
    }
}

#[test]
fn multithreaded_server_serves_concurrent_clients() {
    let t = EventLoopThread::start("echo-loop-mt").unwrap();
    let server = TcpServer::new(
        t.event_loop(),
        &InetAddress::new(0, true),
        "echo-mt",
        false,
    )
    .unwrap();
    server.set_thread_num(3);
    server.set_message_callback(Arc::new(|conn, buf| {
        let data = buf.retrieve_as_bytes();
        conn.send(&data);
    }));
    server.start();
    let addr = server.listen_addr().unwrap().socket_addr();

    let mut clients = Vec::new();
    for i in 0..8 {
        clients.push(std::thread::spawn(move || {
            let mut stream = connect_with_retry(addr);
            for round in 0..50u32 {
                let msg = format!("client-{i}-round-{round}\n");
                stream.write_all(msg.as_bytes()).unwrap();
                let mut buf = vec![0u8; msg.len()];
                stream.read_exact(&mut buf).unwrap();
                assert_eq!(buf, msg.as_bytes());
            }
        }));
    }
    for client in clients {
        client.join().unwrap();
    }

    wait_for("all connections to close", || server.connection_count() == 0);
}
