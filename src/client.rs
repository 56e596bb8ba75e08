//! TCP client facade: connector + single managed connection.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::addr::InetAddress;
use crate::connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::event_loop::EventLoop;
use crate::sockets;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connects to one server address, optionally retrying lost connections
/// with the connector's backoff schedule.
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    weak_self: Weak<ClientInner>,
    loop_: Arc<EventLoop>,
    connector: Arc<Connector>,
    name: String,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_cb: Mutex<Option<HighWaterMarkCallback>>,
    high_water_mark: AtomicUsize,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<TcpConnectionPtr>>,
}

impl TcpClient {
    pub fn new(loop_: &Arc<EventLoop>, server_addr: &InetAddress, name: &str) -> TcpClient {
        let inner = Arc::new_cyclic(|weak| ClientInner {
            weak_self: weak.clone(),
            loop_: loop_.clone(),
            connector: Connector::new(loop_.clone(), *server_addr),
            name: name.to_string(),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_mark_cb: Mutex::new(None),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .connector
            .set_new_connection_callback(Box::new(move |sockfd| match weak.upgrade() {
                Some(client) => client.handle_connection(sockfd),
                None => sockets::close(sockfd),
            }));

        TcpClient { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The current connection, if established.
    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.inner.connection.lock().clone()
    }

    pub fn retry_enabled(&self) -> bool {
        self.inner.retry.load(Ordering::Acquire)
    }

    /// Reconnect automatically when an established connection closes.
    pub fn enable_retry(&self) {
        self.inner.retry.store(true, Ordering::Release);
    }

    pub fn connect(&self) {
        info!(
            name = %self.inner.name,
            server = %self.inner.connector.server_addr(),
            "connecting"
        );
        self.inner.connect.store(true, Ordering::Release);
        self.inner.connector.start();
    }

    /// Shut the established connection down cleanly; in-flight output
    /// drains first.
    pub fn disconnect(&self) {
        self.inner.connect.store(false, Ordering::Release);
        if let Some(conn) = self.inner.connection.lock().as_ref() {
            conn.shutdown();
        }
    }

    /// Abort a pending connect attempt.
    pub fn stop(&self) {
        self.inner.connect.store(false, Ordering::Release);
        self.inner.connector.stop();
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

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, threshold: usize) {
        *self.inner.high_water_mark_cb.lock() = Some(cb);
        self.inner.high_water_mark.store(threshold, Ordering::Release);
    }
}

impl ClientInner {
    /// Runs on the loop thread with the freshly connected descriptor.
    fn handle_connection(&self, sockfd: RawFd) {
        self.loop_.assert_in_loop_thread();
        let peer_addr = match sockets::peer_addr(sockfd) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "getpeername failed on connected descriptor");
                sockets::close(sockfd);
                return;
            }
        };
        let local_addr = match sockets::local_addr(sockfd) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "getsockname failed on connected descriptor");
                InetAddress::new(0, false)
            }
        };
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, id);

        let conn = TcpConnection::new(
            self.loop_.clone(),
            conn_name,
            sockfd,
            local_addr,
            peer_addr,
        );
        if let Some(cb) = self.connection_cb.lock().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.message_cb.lock().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.lock().clone() {
            conn.set_write_complete_callback(cb);
        }
        if let Some(cb) = self.high_water_mark_cb.lock().clone() {
            conn.set_high_water_mark_callback(cb, self.high_water_mark.load(Ordering::Acquire));
        }
        let weak = self.weak_self.clone();
        conn.set_close_callback(Box::new(move |c| {
            if let Some(client) = weak.upgrade() {
                client.handle_disconnection(c);
            }
        }));

        *self.connection.lock() = Some(conn.clone());
        TcpConnection::connect_established(&conn);
    }

    fn handle_disconnection(&self, conn: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();
        {
            let mut slot = self.connection.lock();
            debug_assert!(slot
                .as_ref()
                .map_or(false, |held| Arc::ptr_eq(held, conn)));
            slot.take();
        }

        let c = conn.clone();
        self.loop_
            .queue_in_loop(move || TcpConnection::connect_destroyed(&c));

        if self.retry.load(Ordering::Acquire) && self.connect.load(Ordering::Acquire) {
            info!(
                name = %self.name,
                server = %self.connector.server_addr(),
                "reconnecting"
            );
            self.connector.restart();
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let conn = self.connection.lock().clone();
        match conn {
            Some(conn) => {
                // The connection can outlive the client: re-point its close
                // callback at plain destruction on the loop.
                let loop_ = self.loop_.clone();
                let c = conn.clone();
                self.loop_.run_in_loop(move || {
                    c.set_close_callback(Box::new(move |closing| {
                        let closing = closing.clone();
                        loop_.queue_in_loop(move || {
                            TcpConnection::connect_destroyed(&closing);
                        });
                    }));
                });
            }
            None => {
                self.connector.stop();
                // Keep the connector alive until any I/O still in flight
                // against it has drained.
                let connector = self.connector.clone();
                self.loop_.run_after(Duration::from_secs(1), move || {
                    let _ = &connector;
                });
            }
        }
    }
}
