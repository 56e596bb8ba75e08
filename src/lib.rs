//! Reactor-pattern TCP networking.
//!
//! One [`EventLoop`] per thread multiplexes readiness over a poller,
//! dispatches to per-descriptor channels, runs a timer queue, and drains a
//! cross-thread task queue. [`TcpServer`] and [`TcpClient`] compose the
//! loop with an acceptor or backoff connector and hand each connection to
//! the user as a reference-counted [`TcpConnection`] with buffered reads
//! and writes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use riptide::{EventLoop, InetAddress, TcpServer};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let addr = InetAddress::new(9981, false);
//! let server = TcpServer::new(&event_loop, &addr, "echo", false).unwrap();
//! server.set_message_callback(Arc::new(|conn, buf| {
//!     let data = buf.retrieve_as_bytes();
//!     conn.send(&data);
//! }));
//! server.start();
//! event_loop.run();
//! ```

mod acceptor;
mod addr;
mod buffer;
mod channel;
mod client;
mod connection;
mod connector;
mod error;
mod event_loop;
mod loop_thread;
pub mod metrics;
mod poller;
mod server;
mod socket;
pub mod sockets;
mod timer;
mod timer_queue;

pub use addr::InetAddress;
pub use buffer::Buffer;
pub use client::TcpClient;
pub use connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
pub use error::Error;
pub use event_loop::{EventLoop, Task};
pub use loop_thread::{EventLoopThread, EventLoopThreadPool};
pub use server::TcpServer;
pub use timer::TimerId;
