//! RAII wrapper around a connected or listening TCP descriptor.

use std::io;
use std::os::unix::io::RawFd;

use tracing::warn;

use crate::addr::InetAddress;
use crate::sockets;

/// Owns the descriptor; dropping the socket closes it.
pub(crate) struct Socket {
    fd: RawFd,
}

impl Socket {
    pub fn new(fd: RawFd) -> Socket {
        Socket { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn bind_address(&self, addr: &InetAddress) -> io::Result<()> {
        sockets::bind(self.fd, addr)
    }

    pub fn listen(&self) -> io::Result<()> {
        sockets::listen(self.fd)
    }

    pub fn accept(&self) -> io::Result<(RawFd, InetAddress)> {
        sockets::accept(self.fd)
    }

    pub fn set_reuse_addr(&self, on: bool) {
        if let Err(e) = sockets::set_reuse_addr(self.fd, on) {
            warn!(fd = self.fd, error = %e, "SO_REUSEADDR failed");
        }
    }

    pub fn set_reuse_port(&self, on: bool) {
        if let Err(e) = sockets::set_reuse_port(self.fd, on) {
            warn!(fd = self.fd, error = %e, "SO_REUSEPORT failed");
        }
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = sockets::set_tcp_no_delay(self.fd, on) {
            warn!(fd = self.fd, error = %e, "TCP_NODELAY failed");
        }
    }

    pub fn set_keep_alive(&self, on: bool) {
        if let Err(e) = sockets::set_keep_alive(self.fd, on) {
            warn!(fd = self.fd, error = %e, "SO_KEEPALIVE failed");
        }
    }

    pub fn shutdown_write(&self) {
        sockets::shutdown_write(self.fd);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        sockets::close(self.fd);
    }
}
