//! Non-blocking connect with exponential backoff.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::addr::InetAddress;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::metrics;
use crate::sockets;
use crate::timer::TimerId;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

pub(crate) type NewConnectionCallback = Box<dyn FnMut(RawFd) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

struct Inner {
    state: State,
    channel: Option<Arc<Channel>>,
    retry_delay: Duration,
    retry_timer: Option<TimerId>,
}

/// Drives one outbound connection attempt at a time, retrying refused or
/// unreachable connects with a doubling delay. Internal to
/// [`TcpClient`](crate::TcpClient).
pub(crate) struct Connector {
    weak_self: Weak<Connector>,
    loop_: Arc<EventLoop>,
    server_addr: InetAddress,
    connect: AtomicBool,
    inner: Mutex<Inner>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Connector {
    pub fn new(loop_: Arc<EventLoop>, server_addr: InetAddress) -> Arc<Connector> {
        Arc::new_cyclic(|weak| Connector {
            weak_self: weak.clone(),
            loop_,
            server_addr,
            connect: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                state: State::Disconnected,
                channel: None,
                retry_delay: INIT_RETRY_DELAY,
                retry_timer: None,
            }),
            new_connection_cb: Mutex::new(None),
        })
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock() = Some(cb);
    }

    pub fn server_addr(&self) -> &InetAddress {
        &self.server_addr
    }

    /// Begin connecting. Callable from any thread.
    pub fn start(&self) {
        self.connect.store(true, Ordering::Release);
        let weak = self.weak_self.clone();
        self.loop_.run_in_loop(move || {
            if let Some(c) = weak.upgrade() {
                c.start_in_loop();
            }
        });
    }

    /// Forget the backoff and connect again; runs on the loop thread.
    pub fn restart(&self) {
        self.loop_.assert_in_loop_thread();
        {
            let mut inner = self.inner.lock();
            inner.state = State::Disconnected;
            inner.retry_delay = INIT_RETRY_DELAY;
        }
        self.connect.store(true, Ordering::Release);
        self.start_in_loop();
    }

    /// Abort a pending connect and cancel any scheduled retry. Callable
    /// from any thread.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        let timer = self.inner.lock().retry_timer.take();
        if let Some(id) = timer {
            self.loop_.cancel(id);
        }
        let weak = self.weak_self.clone();
        self.loop_.queue_in_loop(move || {
            if let Some(c) = weak.upgrade() {
                c.stop_in_loop();
            }
        });
    }

    fn start_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        let mut inner = self.inner.lock();
        if inner.state != State::Disconnected {
            return;
        }
        if self.connect.load(Ordering::Acquire) {
            self.do_connect(&mut inner);
        } else {
            debug!("not connecting: stopped");
        }
    }

    fn stop_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        let mut inner = self.inner.lock();
        if inner.state == State::Connecting {
            inner.state = State::Disconnected;
            let fd = self.remove_and_reset_channel(&mut inner);
            self.retry(&mut inner, fd);
        }
    }

    fn do_connect(&self, inner: &mut Inner) {
        let fd = match sockets::create_nonblocking() {
            Ok(fd) => fd,
            Err(e) => {
                error!(error = %e, "socket creation failed");
                return;
            }
        };
        let err = match sockets::connect(fd, &self.server_addr) {
            Ok(()) => 0,
            Err(e) => e.raw_os_error().unwrap_or(0),
        };
        match err {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(inner, fd),

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(inner, fd),

            _ => {
                error!(errno = err, addr = %self.server_addr, "connect failed");
                sockets::close(fd);
            }
        }
    }

    fn connecting(&self, inner: &mut Inner, fd: RawFd) {
        inner.state = State::Connecting;
        debug_assert!(inner.channel.is_none());
        let channel = Channel::new(self.loop_.weak_self(), fd);

        let weak = self.weak_self.clone();
        channel.set_write_callback(Box::new(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_write();
            }
        }));
        let weak = self.weak_self.clone();
        channel.set_error_callback(Box::new(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_error();
            }
        }));

        inner.channel = Some(channel.clone());
        channel.enable_write();
    }

    /// A connect in progress resolves through writability: zero SO_ERROR
    /// and a distinct peer means connected, anything else retries.
    fn handle_write(&self) {
        let mut inner = self.inner.lock();
        trace!(state = ?inner.state, "connector writable");
        if inner.state != State::Connecting {
            debug_assert_eq!(inner.state, State::Disconnected);
            return;
        }
        let fd = self.remove_and_reset_channel(&mut inner);
        let err = sockets::socket_error(fd);
        if err != 0 {
            warn!(so_error = err, addr = %self.server_addr, "connect did not complete");
            self.retry(&mut inner, fd);
        } else if sockets::is_self_connect(fd) {
            warn!(addr = %self.server_addr, "self connect, retrying");
            self.retry(&mut inner, fd);
        } else {
            inner.state = State::Connected;
            drop(inner);
            if self.connect.load(Ordering::Acquire) {
                let mut cb = self.new_connection_cb.lock();
                match cb.as_mut() {
                    Some(cb) => cb(fd),
                    None => sockets::close(fd),
                }
            } else {
                sockets::close(fd);
            }
        }
    }

    fn handle_error(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::Connecting {
            let fd = self.remove_and_reset_channel(&mut inner);
            let err = sockets::socket_error(fd);
            error!(so_error = err, addr = %self.server_addr, "connector error");
            self.retry(&mut inner, fd);
        }
    }

    fn retry(&self, inner: &mut Inner, fd: RawFd) {
        sockets::close(fd);
        inner.state = State::Disconnected;
        if !self.connect.load(Ordering::Acquire) {
            debug!("not retrying: stopped");
            return;
        }
        metrics::CONNECT_RETRIES.increment();
        info!(
            addr = %self.server_addr,
            delay_ms = inner.retry_delay.as_millis() as u64,
            "retrying connect"
        );
        let weak = self.weak_self.clone();
        let id = self.loop_.run_after(inner.retry_delay, move || {
            if let Some(c) = weak.upgrade() {
                c.start_in_loop();
            }
        });
        inner.retry_timer = Some(id);
        inner.retry_delay = (inner.retry_delay * 2).min(MAX_RETRY_DELAY);
    }

    /// Detach the channel and hand its descriptor back. The channel object
    /// stays alive through the rest of this dispatch via the loop's active
    /// list, so dropping our reference here is safe.
    fn remove_and_reset_channel(&self, inner: &mut Inner) -> RawFd {
        let channel = inner
            .channel
            .take()
            .expect("connecting state always has a channel");
        channel.disable_all();
        channel.remove();
        channel.fd()
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        let timer = self.inner.lock().retry_timer.take();
        if let Some(id) = timer {
            self.loop_.cancel(id);
        }
    }
}
