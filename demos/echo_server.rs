use std::sync::Arc;

use riptide::{EventLoop, InetAddress, TcpServer};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9981".to_string());
    let (ip, port) = bind_addr
        .rsplit_once(':')
        .expect("address must be ip:port");
    let addr = InetAddress::from_ip_port(ip, port.parse().expect("bad port"))
        .expect("bad bind address");

    let event_loop = EventLoop::new().expect("failed to create event loop");
    let server = TcpServer::new(&event_loop, &addr, "echo", false).expect("failed to bind");
    server.set_thread_num(2);

    server.set_connection_callback(Arc::new(|conn| {
        eprintln!(
            "{} {} -> {}",
            if conn.connected() { "UP  " } else { "DOWN" },
            conn.peer_addr(),
            conn.local_addr()
        );
    }));
    server.set_message_callback(Arc::new(|conn, buf| {
        let data = buf.retrieve_as_bytes();
        conn.send(&data);
    }));

    eprintln!("echo server listening on {bind_addr}");
    server.start();
    event_loop.run();
}
