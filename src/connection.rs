//! One established TCP connection: duplex byte stream with user-level
//! buffering.

use std::any::Any;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::addr::InetAddress;
use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::metrics;
use crate::socket::Socket;
use crate::sockets;

pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Notified on connect and on disconnect; check
/// [`connected`](TcpConnection::connected) to tell which.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Handed the input buffer whenever bytes arrive; consume what you parse.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer) + Send + Sync>;
/// Fired when the output buffer has fully drained.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Fired once when the output buffer first crosses the high-water mark;
/// the argument is the buffered size at that point.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Box<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

/// A single accepted or established connection, created by the owning
/// server or client once the descriptor is ready and reference-counted
/// from there.
///
/// State machine: `Connecting -> Connected` on establishment,
/// `Connected -> Disconnecting` on shutdown or force-close,
/// `{Connected, Disconnecting} -> Disconnected` in the close handler.
/// Once `Disconnected`, no further user callbacks fire.
pub struct TcpConnection {
    weak_self: Weak<TcpConnection>,
    loop_: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
    high_water_mark: AtomicUsize,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
}

impl TcpConnection {
    pub(crate) fn new(
        loop_: Arc<EventLoop>,
        name: String,
        sockfd: RawFd,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> TcpConnectionPtr {
        let socket = Socket::new(sockfd);
        socket.set_keep_alive(true);
        let channel = Channel::new(loop_.weak_self(), sockfd);

        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            let w = weak.clone();
            channel.set_read_callback(Box::new(move || {
                if let Some(c) = w.upgrade() {
                    TcpConnection::handle_read(&c);
                }
            }));
            let w = weak.clone();
            channel.set_write_callback(Box::new(move || {
                if let Some(c) = w.upgrade() {
                    TcpConnection::handle_write(&c);
                }
            }));
            let w = weak.clone();
            channel.set_error_callback(Box::new(move || {
                if let Some(c) = w.upgrade() {
                    TcpConnection::handle_error(&c);
                }
            }));
            let w = weak.clone();
            channel.set_close_callback(Box::new(move || {
                if let Some(c) = w.upgrade() {
                    // hang-up and end-of-file can land in one poll; close once
                    if !c.disconnected() {
                        TcpConnection::handle_close(&c);
                    }
                }
            }));

            TcpConnection {
                weak_self: weak.clone(),
                loop_,
                name,
                state: AtomicU8::new(State::Connecting as u8),
                reading: AtomicBool::new(true),
                socket,
                channel,
                local_addr,
                peer_addr,
                connection_cb: Mutex::new(None),
                message_cb: Mutex::new(None),
                write_complete_cb: Mutex::new(None),
                high_water_mark_cb: Mutex::new(None),
                close_cb: Mutex::new(None),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                input: Mutex::new(Buffer::new()),
                output: Mutex::new(Buffer::new()),
            }
        });
        debug!(name = %conn.name, peer = %conn.peer_addr, "connection created");
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> &InetAddress {
        &self.local_addr
    }

    pub fn peer_addr(&self) -> &InetAddress {
        &self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.loop_
    }

    /// Bytes currently queued in the output buffer.
    pub fn output_bytes(&self) -> usize {
        self.output.lock().readable_bytes()
    }

    /// Send a byte slice (text or raw). Off the I/O thread the payload is
    /// copied and marshaled; on it, sent directly. Writes from one thread
    /// arrive in call order.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let message = data.to_vec();
            let weak = self.weak_self.clone();
            self.loop_.run_in_loop(move || {
                if let Some(c) = weak.upgrade() {
                    c.send_in_loop(&message);
                }
            });
        }
    }

    /// Send everything readable in `buf`, draining it.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        if self.state() != State::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(buf.peek());
            buf.retrieve_all();
        } else {
            let message = buf.retrieve_as_bytes();
            let weak = self.weak_self.clone();
            self.loop_.run_in_loop(move || {
                if let Some(c) = weak.upgrade() {
                    c.send_in_loop(&message);
                }
            });
        }
    }

    /// Close the write half once pending output drains; reads stay open
    /// until the peer closes.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let weak = self.weak_self.clone();
            self.loop_.run_in_loop(move || {
                if let Some(c) = weak.upgrade() {
                    c.shutdown_in_loop();
                }
            });
        }
    }

    /// Drop the connection without waiting for pending output.
    pub fn force_close(&self) {
        let s = self.state();
        if s == State::Connected || s == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let weak = self.weak_self.clone();
            self.loop_.queue_in_loop(move || {
                if let Some(c) = weak.upgrade() {
                    let s = c.state();
                    if s == State::Connected || s == State::Disconnecting {
                        TcpConnection::handle_close(&c);
                    }
                }
            });
        }
    }

    /// [`force_close`](Self::force_close) after a delay; a connection that
    /// closed in the meantime is left alone.
    pub fn force_close_with_delay(&self, delay: Duration) {
        let s = self.state();
        if s == State::Connected || s == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let weak = self.weak_self.clone();
            self.loop_.run_after(delay, move || {
                if let Some(c) = weak.upgrade() {
                    c.force_close();
                }
            });
        }
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        self.socket.set_tcp_no_delay(on);
    }

    pub fn start_read(&self) {
        let weak = self.weak_self.clone();
        self.loop_.run_in_loop(move || {
            if let Some(c) = weak.upgrade() {
                if !c.is_reading() || !c.channel.is_reading() {
                    c.channel.enable_read();
                    c.reading.store(true, Ordering::Release);
                }
            }
        });
    }

    pub fn stop_read(&self) {
        let weak = self.weak_self.clone();
        self.loop_.run_in_loop(move || {
            if let Some(c) = weak.upgrade() {
                if c.is_reading() || c.channel.is_reading() {
                    c.channel.disable_read();
                    c.reading.store(false, Ordering::Release);
                }
            }
        });
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, threshold: usize) {
        *self.high_water_mark_cb.lock() = Some(cb);
        self.high_water_mark.store(threshold, Ordering::Release);
    }

    /// Installed by the owning server or client to drop its strong
    /// reference; always the last callback a closing connection fires.
    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock() = Some(cb);
    }

    /// Called once on the owning loop when the server or client adopts the
    /// connection: ties the channel to this connection's lifetime, starts
    /// reading, and notifies the user.
    pub(crate) fn connect_established(conn: &TcpConnectionPtr) {
        conn.loop_.assert_in_loop_thread();
        assert_eq!(conn.state(), State::Connecting);
        conn.set_state(State::Connected);
        metrics::CONNECTIONS_ACTIVE.increment();

        let tether: Weak<dyn Any + Send + Sync> = conn.weak_self.clone();
        conn.channel.tie(tether);
        conn.channel.enable_read();

        conn.notify_connection_state();
    }

    /// Idempotent final teardown, called exactly once per connection by
    /// its owner. Covers both the normal close path (already
    /// `Disconnected`) and owner-shutdown with the connection still up.
    pub(crate) fn connect_destroyed(conn: &TcpConnectionPtr) {
        conn.loop_.assert_in_loop_thread();
        if conn.state() == State::Connected {
            conn.set_state(State::Disconnected);
            conn.channel.disable_all();
            metrics::CONNECTIONS_ACTIVE.decrement();
            conn.notify_connection_state();
        }
        conn.channel.remove();
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn notify_connection_state(&self) {
        let cb = self.connection_cb.lock().clone();
        if let Some(conn) = self.weak_self.upgrade() {
            match cb {
                Some(cb) => cb(&conn),
                None => debug!(
                    name = %self.name,
                    connected = self.connected(),
                    "connection state changed"
                ),
            }
        }
    }

    fn handle_read(conn: &TcpConnectionPtr) {
        conn.loop_.assert_in_loop_thread();
        let mut input = conn.input.lock();
        match input.read_fd(conn.channel.fd()) {
            Ok(0) => {
                drop(input);
                if !conn.disconnected() {
                    TcpConnection::handle_close(conn);
                }
            }
            Ok(n) => {
                metrics::BYTES_RECEIVED.add(n as u64);
                let cb = conn.message_cb.lock().clone();
                match cb {
                    Some(cb) => cb(conn, &mut *input),
                    // nobody to consume: discard, or level-triggered
                    // readiness would spin on the unread bytes
                    None => input.retrieve_all(),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                drop(input);
                error!(name = %conn.name, error = %e, "read failed");
                TcpConnection::handle_error(conn);
            }
        }
    }

    fn handle_write(conn: &TcpConnectionPtr) {
        conn.loop_.assert_in_loop_thread();
        if !conn.channel.is_writing() {
            trace!(name = %conn.name, "connection is down, no more writing");
            return;
        }
        let mut output = conn.output.lock();
        match sockets::write(conn.channel.fd(), output.peek()) {
            Ok(n) => {
                metrics::BYTES_SENT.add(n as u64);
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    drop(output);
                    conn.channel.disable_write();
                    conn.queue_write_complete();
                    if conn.state() == State::Disconnecting {
                        conn.shutdown_in_loop();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!(name = %conn.name, error = %e, "write failed");
            }
        }
    }

    fn handle_error(conn: &TcpConnectionPtr) {
        let err = sockets::socket_error(conn.channel.fd());
        error!(name = %conn.name, so_error = err, "connection error");
    }

    /// Passive close, force-close, and error teardown all funnel here.
    fn handle_close(conn: &TcpConnectionPtr) {
        conn.loop_.assert_in_loop_thread();
        let s = conn.state();
        trace!(name = %conn.name, state = ?s, "closing");
        assert!(s == State::Connected || s == State::Disconnecting);
        conn.set_state(State::Disconnected);
        conn.channel.disable_all();
        metrics::CONNECTIONS_ACTIVE.decrement();

        conn.notify_connection_state();
        // The owner's bookkeeping callback goes last: it may drop the
        // final strong reference.
        let cb = conn.close_cb.lock();
        if let Some(cb) = cb.as_ref() {
            cb(conn);
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!(name = %self.name, "disconnected, giving up the write");
            return;
        }
        let mut nwrote = 0usize;
        let mut remaining = data.len();

        // Nothing queued and not watching writability: try the socket
        // directly before buffering.
        if !self.channel.is_writing() && self.output.lock().readable_bytes() == 0 {
            match sockets::write(self.channel.fd(), data) {
                Ok(n) => {
                    metrics::BYTES_SENT.add(n as u64);
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        self.queue_write_complete();
                    }
                }
                Err(e) => {
                    nwrote = 0;
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!(name = %self.name, error = %e, "direct write failed");
                    }
                }
            }
        }

        debug_assert!(remaining <= data.len());
        if remaining > 0 {
            let mut output = self.output.lock();
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if old_len < mark && old_len + remaining >= mark {
                let cb = self.high_water_mark_cb.lock().clone();
                if let (Some(cb), Some(conn)) = (cb, self.weak_self.upgrade()) {
                    let size = old_len + remaining;
                    self.loop_.queue_in_loop(move || cb(&conn, size));
                }
            }
            output.append(&data[nwrote..]);
            drop(output);
            if !self.channel.is_writing() {
                self.channel.enable_write();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            // output already drained; otherwise the write handler calls
            // back in here once it empties
            self.socket.shutdown_write();
        }
    }

    fn queue_write_complete(&self) {
        let cb = self.write_complete_cb.lock().clone();
        if let (Some(cb), Some(conn)) = (cb, self.weak_self.upgrade()) {
            self.loop_.queue_in_loop(move || cb(&conn));
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(name = %self.name, state = ?self.state(), "connection dropped");
    }
}
