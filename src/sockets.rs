//! Platform shim over the raw socket, wakeup, and timer-descriptor syscalls.
//!
//! Everything above this module speaks `RawFd` + [`InetAddress`]; the libc
//! types and error conventions stay in here. All sockets handed out are
//! non-blocking and close-on-exec, and SIGPIPE is ignored process-wide on
//! first socket use so a write to a half-closed peer surfaces as EPIPE.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Once;

use tracing::error;

use crate::addr::InetAddress;

pub fn host_to_network16(host16: u16) -> u16 {
    host16.to_be()
}

pub fn host_to_network32(host32: u32) -> u32 {
    host32.to_be()
}

pub fn network_to_host16(net16: u16) -> u16 {
    u16::from_be(net16)
}

pub fn network_to_host32(net32: u32) -> u32 {
    u32::from_be(net32)
}

static IGNORE_SIGPIPE: Once = Once::new();

fn ignore_sigpipe() {
    IGNORE_SIGPIPE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

#[allow(dead_code)]
pub(crate) fn set_nonblock_and_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = libc::fcntl(fd, libc::F_GETFD, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Create a non-blocking close-on-exec TCP socket.
pub fn create_nonblocking() -> io::Result<RawFd> {
    ignore_sigpipe();
    #[cfg(target_os = "linux")]
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    #[cfg(not(target_os = "linux"))]
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    #[cfg(not(target_os = "linux"))]
    if let Err(e) = set_nonblock_and_cloexec(fd) {
        close(fd);
        return Err(e);
    }
    Ok(fd)
}

pub fn bind(fd: RawFd, addr: &InetAddress) -> io::Result<()> {
    let sin = addr.as_sockaddr_in();
    let ret = unsafe {
        libc::bind(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn listen(fd: RawFd) -> io::Result<()> {
    let ret = unsafe { libc::listen(fd, libc::SOMAXCONN) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Accept one pending connection. The returned descriptor is non-blocking
/// and close-on-exec.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, InetAddress)> {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    #[cfg(target_os = "linux")]
    let connfd = unsafe {
        libc::accept4(
            fd,
            &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    #[cfg(not(target_os = "linux"))]
    let connfd = unsafe {
        libc::accept(
            fd,
            &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if connfd < 0 {
        return Err(io::Error::last_os_error());
    }
    #[cfg(not(target_os = "linux"))]
    if let Err(e) = set_nonblock_and_cloexec(connfd) {
        close(connfd);
        return Err(e);
    }
    Ok((connfd, InetAddress::from_sockaddr_in(sin)))
}

pub fn connect(fd: RawFd, addr: &InetAddress) -> io::Result<()> {
    let sin = addr.as_sockaddr_in();
    let ret = unsafe {
        libc::connect(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub fn close(fd: RawFd) {
    if unsafe { libc::close(fd) } < 0 {
        error!(fd, error = %io::Error::last_os_error(), "close failed");
    }
}

/// Close the write half only; the peer observes EOF while reads stay open.
pub fn shutdown_write(fd: RawFd) {
    if unsafe { libc::shutdown(fd, libc::SHUT_WR) } < 0 {
        error!(fd, error = %io::Error::last_os_error(), "shutdown(SHUT_WR) failed");
    }
}

fn set_bool_option(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
    let optval: libc::c_int = if on { 1 } else { 0 };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &optval as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn set_reuse_addr(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_option(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub fn set_reuse_port(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_option(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
}

pub fn set_tcp_no_delay(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_option(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

pub fn set_keep_alive(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_option(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

/// Pending SO_ERROR on the socket, or the errno of the query itself.
pub fn socket_error(fd: RawFd) -> i32 {
    let mut optval: libc::c_int = 0;
    let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut libc::c_int as *mut libc::c_void,
            &mut optlen,
        )
    };
    if ret < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        optval
    }
}

pub fn local_addr(fd: RawFd) -> io::Result<InetAddress> {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(InetAddress::from_sockaddr_in(sin))
}

pub fn peer_addr(fd: RawFd) -> io::Result<InetAddress> {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getpeername(
            fd,
            &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(InetAddress::from_sockaddr_in(sin))
}

/// A TCP socket whose local endpoint equals its peer endpoint. Possible on
/// loopback when a connect to a closed port lands on the socket's own
/// ephemeral port.
pub fn is_self_connect(fd: RawFd) -> bool {
    match (local_addr(fd), peer_addr(fd)) {
        (Ok(local), Ok(peer)) => local == peer,
        _ => false,
    }
}

/// Bytes queued for reading on the socket (FIONREAD).
pub fn readable_bytes(fd: RawFd) -> i32 {
    let mut bytes: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut bytes) };
    if ret < 0 {
        return -1;
    }
    bytes
}

/// Wakeup descriptor pair. `write_fd` is written from any thread to break a
/// blocked poll on `read_fd`. On Linux both ends are one eventfd; elsewhere
/// they are the two ends of a self-connected loopback TCP pair.
pub(crate) struct Wakeup {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Wakeup {
    #[cfg(target_os = "linux")]
    pub fn new() -> io::Result<Wakeup> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Wakeup {
            read_fd: fd,
            write_fd: fd,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new() -> io::Result<Wakeup> {
        // Loopback listener on an ephemeral port, connect one end to it,
        // accept the other. Ordinary pipes cannot stand in because the
        // write end must be usable from any thread without blocking.
        let listener = create_nonblocking()?;
        let result = (|| {
            set_nonblock_and_cloexec(listener)?;
            bind(listener, &InetAddress::new(0, true))?;
            listen(listener)?;
            let addr = local_addr(listener)?;
            let client = create_nonblocking()?;
            match connect(client, &addr) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
                Err(e) => {
                    close(client);
                    return Err(e);
                }
            }
            // Loopback connects complete immediately; accept picks it up.
            let mut attempts = 0;
            loop {
                match accept(listener) {
                    Ok((server, _)) => return Ok((client, server)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock && attempts < 100 => {
                        attempts += 1;
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                    Err(e) => {
                        close(client);
                        return Err(e);
                    }
                }
            }
        })();
        close(listener);
        let (write_fd, read_fd) = result?;
        Ok(Wakeup { read_fd, write_fd })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        close(self.read_fd);
        if self.write_fd != self.read_fd {
            close(self.write_fd);
        }
    }
}

#[cfg(target_os = "linux")]
pub(crate) mod timerfd {
    use std::io;
    use std::os::unix::io::RawFd;
    use std::time::Instant;

    use tracing::error;

    pub fn create() -> io::Result<RawFd> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }

    /// Drain the expiration counter; returns how many times the timer fired.
    pub fn read(fd: RawFd) -> u64 {
        let mut howmany: u64 = 0;
        let n = unsafe {
            libc::read(
                fd,
                &mut howmany as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            error!(n, "timerfd read returned unexpected length");
        }
        howmany
    }

    /// Arm the descriptor to fire at `expiration`. Expirations already in
    /// the past are clamped to a small positive delay; a zero it_value
    /// would disarm the timer instead of firing it.
    pub fn arm(fd: RawFd, expiration: Instant) {
        let delay = expiration.saturating_duration_since(Instant::now());
        let delay = delay.max(std::time::Duration::from_micros(100));
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        let ret = unsafe { libc::timerfd_settime(fd, 0, &new_value, std::ptr::null_mut()) };
        if ret < 0 {
            error!(error = %io::Error::last_os_error(), "timerfd_settime failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_order_round_trips() {
        for v in [0u16, 1, 0x1234, u16::MAX] {
            assert_eq!(network_to_host16(host_to_network16(v)), v);
        }
        for v in [0u32, 1, 0x12345678, u32::MAX] {
            assert_eq!(network_to_host32(host_to_network32(v)), v);
        }
        assert_eq!(host_to_network16(0x1234).to_ne_bytes(), [0x12, 0x34]);
    }

    #[test]
    fn socket_lifecycle_and_addrs() {
        let fd = create_nonblocking().unwrap();
        set_reuse_addr(fd, false).unwrap();
        bind(fd, &InetAddress::new(0, true)).unwrap();
        listen(fd).unwrap();
        let addr = local_addr(fd).unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
        // nothing queued on a fresh listener
        assert!(accept(fd).unwrap_err().kind() == io::ErrorKind::WouldBlock);
        close(fd);
    }

    #[test]
    fn readable_bytes_sees_queued_data() {
        let listener = create_nonblocking().unwrap();
        bind(listener, &InetAddress::new(0, true)).unwrap();
        listen(listener).unwrap();
        let addr = local_addr(listener).unwrap();

        let client = std::net::TcpStream::connect(addr.socket_addr()).unwrap();
        let (server, _peer) = loop {
            match accept(listener) {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1))
                }
                Err(e) => panic!("accept: {e}"),
            }
        };

        use std::io::Write as _;
        let mut client = client;
        client.write_all(b"four").unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        while readable_bytes(server) < 4 {
            assert!(std::time::Instant::now() < deadline, "data never arrived");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(readable_bytes(server), 4);
        close(server);
        close(listener);
    }

    #[test]
    fn detects_self_connect() {
        // Bind an ephemeral port, then connect the same socket to it: TCP
        // simultaneous open pairs the socket with itself.
        let fd = create_nonblocking().unwrap();
        bind(fd, &InetAddress::new(0, true)).unwrap();
        let addr = local_addr(fd).unwrap();
        match connect(fd, &addr) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => panic!("self connect attempt failed outright: {e}"),
        }
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while socket_error(fd) == 0 && !is_self_connect(fd) {
            assert!(
                std::time::Instant::now() < deadline,
                "self connect never completed"
            );
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(socket_error(fd), 0);
        assert!(is_self_connect(fd));
        close(fd);
    }

    #[test]
    fn ordinary_connection_is_not_self_connect() {
        let listener = create_nonblocking().unwrap();
        bind(listener, &InetAddress::new(0, true)).unwrap();
        listen(listener).unwrap();
        let addr = local_addr(listener).unwrap();

        let client = create_nonblocking().unwrap();
        match connect(client, &addr) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => panic!("connect failed: {e}"),
        }
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while peer_addr(client).is_err() {
            assert!(std::time::Instant::now() < deadline, "connect never completed");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(!is_self_connect(client));
        close(client);
        close(listener);
    }

    #[test]
    fn wakeup_write_then_read() {
        let wakeup = Wakeup::new().unwrap();
        let one: u64 = 1;
        assert_eq!(write(wakeup.write_fd(), &one.to_ne_bytes()).unwrap(), 8);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        loop {
            let mut buf = [0u8; 8];
            match read(wakeup.read_fd(), &mut buf) {
                Ok(n) if n > 0 => break,
                Ok(_) | Err(_) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(1))
                }
                other => panic!("wakeup never became readable: {other:?}"),
            }
        }
    }
}
