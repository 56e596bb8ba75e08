//! Accepts new TCP connections for a listening address.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::addr::InetAddress;
use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::metrics;
use crate::socket::Socket;
use crate::sockets;

pub(crate) type NewConnectionCallback = Box<dyn FnMut(RawFd, InetAddress) + Send>;

/// Owns the listening socket and its channel; hands accepted descriptors
/// to the installed callback. Internal to [`TcpServer`](crate::TcpServer).
pub(crate) struct Acceptor {
    loop_: Arc<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
}

impl Acceptor {
    pub fn new(
        loop_: &Arc<EventLoop>,
        listen_addr: &InetAddress,
        reuse_port: bool,
    ) -> Result<Arc<Acceptor>, Error> {
        let fd = sockets::create_nonblocking()?;
        let socket = Socket::new(fd);
        socket.set_reuse_addr(false);
        socket.set_reuse_port(reuse_port);
        socket.bind_address(listen_addr)?;

        let channel = Channel::new(Arc::downgrade(loop_), fd);
        let acceptor = Arc::new(Acceptor {
            loop_: loop_.clone(),
            socket,
            channel,
            new_connection_cb: Mutex::new(None),
            listening: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(Box::new(move || {
            if let Some(a) = weak.upgrade() {
                a.handle_read();
            }
        }));
        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock() = Some(cb);
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Local address actually bound, with the kernel-assigned port when the
    /// caller bound port 0.
    pub fn listen_addr(&self) -> Option<InetAddress> {
        sockets::local_addr(self.socket.fd()).ok()
    }

    /// Start listening and subscribe for readability. Runs on the loop
    /// thread; a listen failure here means the address is unusable and is
    /// treated as fatal.
    pub fn listen(&self) {
        self.loop_.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);
        if let Err(e) = self.socket.listen() {
            panic!("listen failed on fd {}: {e}", self.socket.fd());
        }
        self.channel.enable_read();
    }

    /// Unsubscribe and unregister; must run on the loop thread before the
    /// acceptor is dropped.
    pub fn teardown(&self) {
        self.channel.disable_all();
        self.channel.remove();
    }

    fn handle_read(&self) {
        self.loop_.assert_in_loop_thread();
        match self.socket.accept() {
            Ok((connfd, peer_addr)) => {
                metrics::CONNECTIONS_ACCEPTED.increment();
                let mut cb = self.new_connection_cb.lock();
                match cb.as_mut() {
                    Some(cb) => cb(connfd, peer_addr),
                    None => sockets::close(connfd),
                }
            }
            Err(e) => match e.raw_os_error() {
                // Transient or resource-exhaustion failures: drop the event
                // and keep serving. EMFILE in particular must not take the
                // whole server down.
                Some(libc::EAGAIN)
                | Some(libc::EINTR)
                | Some(libc::ECONNABORTED)
                | Some(libc::EMFILE)
                | Some(libc::ENFILE)
                | Some(libc::EPROTO)
                | Some(libc::EPERM) => {
                    warn!(error = %e, "accept failed");
                }
                _ => {
                    error!(error = %e, "unrecoverable accept failure");
                    panic!("accept failed: {e}");
                }
            },
        }
    }
}
