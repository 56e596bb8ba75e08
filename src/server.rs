//! TCP server facade: acceptor + worker pool + connection map.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::acceptor::Acceptor;
use crate::addr::InetAddress;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::loop_thread::EventLoopThreadPool;
use crate::sockets;

/// Accepts connections on one address and manages the resulting
/// [`TcpConnection`]s. Install callbacks, then [`start`](TcpServer::start).
///
/// With `set_thread_num(0)` every connection shares the listener's loop;
/// with N threads connections are dealt round-robin across N worker loops
/// while the listener stays on the base loop.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    weak_self: Weak<ServerInner>,
    loop_: Arc<EventLoop>,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
}

impl TcpServer {
    pub fn new(
        loop_: &Arc<EventLoop>,
        listen_addr: &InetAddress,
        name: &str,
        reuse_port: bool,
    ) -> Result<TcpServer, Error> {
        let acceptor = Acceptor::new(loop_, listen_addr, reuse_port)?;
        let inner = Arc::new_cyclic(|weak| ServerInner {
            weak_self: weak.clone(),
            loop_: loop_.clone(),
            name: name.to_string(),
            acceptor,
            pool: Mutex::new(EventLoopThreadPool::new(loop_.clone())),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(Box::new(move |sockfd, peer_addr| {
                match weak.upgrade() {
                    Some(server) => server.handle_connection(sockfd, peer_addr),
                    None => sockets::close(sockfd),
                }
            }));

        Ok(TcpServer { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bound listen address; useful when the caller bound port 0.
    pub fn listen_addr(&self) -> Option<InetAddress> {
        self.inner.acceptor.listen_addr()
    }

    /// Number of I/O worker threads. Must be called before
    /// [`start`](TcpServer::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.lock().set_thread_num(num_threads);
    }

    /// Start the worker pool and begin listening. Idempotent and callable
    /// from any thread.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        self.inner.loop_.run_in_loop(move || {
            inner
                .pool
                .lock()
                .start()
                .expect("failed to start I/O worker threads");
            debug_assert!(!inner.acceptor.listening());
            inner.acceptor.listen();
            info!(name = %inner.name, "server started");
        });
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.inner.connection_cb.lock() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.inner.message_cb.lock() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.inner.write_complete_cb.lock() = Some(cb);
    }

    /// Live connections currently tracked by the server.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }
}

impl ServerInner {
    /// Runs on the base loop when the acceptor hands over a descriptor.
    fn handle_connection(&self, sockfd: RawFd, peer_addr: InetAddress) {
        self.loop_.assert_in_loop_thread();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}#{}", self.name, id);
        info!(name = %conn_name, peer = %peer_addr, "new connection");

        let local_addr = match sockets::local_addr(sockfd) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "getsockname failed on accepted descriptor");
                InetAddress::new(0, false)
            }
        };

        let io_loop = self.pool.lock().next_loop();
        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), sockfd, local_addr, peer_addr);
        if let Some(cb) = self.connection_cb.lock().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.message_cb.lock().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.lock().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = self.weak_self.clone();
        conn.set_close_callback(Box::new(move |c| {
            if let Some(server) = weak.upgrade() {
                server.handle_disconnection(c);
            }
        }));

        self.connections.lock().insert(conn_name, conn.clone());
        io_loop.run_in_loop(move || TcpConnection::connect_established(&conn));
    }

    /// Invoked from the connection's loop; bookkeeping happens on the base
    /// loop, then the teardown goes back to the connection's loop.
    fn handle_disconnection(&self, conn: &TcpConnectionPtr) {
        let weak = self.weak_self.clone();
        let conn = conn.clone();
        self.loop_.run_in_loop(move || match weak.upgrade() {
            Some(server) => server.handle_disconnection_in_loop(&conn),
            None => {
                let c = conn.clone();
                conn.owner_loop()
                    .queue_in_loop(move || TcpConnection::connect_destroyed(&c));
            }
        });
    }

    fn handle_disconnection_in_loop(&self, conn: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();
        info!(name = %conn.name(), "removing connection");
        self.connections.lock().remove(conn.name());
        let c = conn.clone();
        conn.owner_loop()
            .queue_in_loop(move || TcpConnection::connect_destroyed(&c));
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let acceptor = self.acceptor.clone();
        self.loop_.run_in_loop(move || acceptor.teardown());

        let connections: Vec<TcpConnectionPtr> =
            self.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in connections {
            let c = conn.clone();
            conn.owner_loop()
                .run_in_loop(move || TcpConnection::connect_destroyed(&c));
        }
        // the pool field drops after this body, quitting and joining the
        // worker loops once their teardown tasks have drained
    }
}
