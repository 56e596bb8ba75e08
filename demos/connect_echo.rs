use std::sync::Arc;

use riptide::{EventLoop, InetAddress, TcpClient};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9981".to_string());
    let (ip, port) = server_addr
        .rsplit_once(':')
        .expect("address must be ip:port");
    let addr = InetAddress::from_ip_port(ip, port.parse().expect("bad port"))
        .expect("bad server address");

    let event_loop = EventLoop::new().expect("failed to create event loop");
    let client = TcpClient::new(&event_loop, &addr, "connect-echo");
    client.enable_retry();

    client.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            eprintln!("connected to {}", conn.peer_addr());
            conn.send(b"hello over tcp\n");
        } else {
            eprintln!("disconnected from {}", conn.peer_addr());
        }
    }));
    client.set_message_callback(Arc::new(|conn, buf| {
        let echoed = buf.retrieve_as_string();
        eprintln!("echoed back: {}", echoed.trim_end());
        conn.shutdown();
    }));

    client.connect();
    event_loop.run();
}
