//! IPv4 socket addresses.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use crate::error::Error;

/// An IPv4 `{address, port}` pair with conversions to and from the raw
/// `sockaddr_in` handed to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InetAddress {
    addr: SocketAddrV4,
}

impl InetAddress {
    /// Address for a port on every interface, or on loopback only.
    pub fn new(port: u16, loopback_only: bool) -> Self {
        let ip = if loopback_only {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        InetAddress {
            addr: SocketAddrV4::new(ip, port),
        }
    }

    /// Parse a dotted-quad address and port.
    pub fn from_ip_port(ip: &str, port: u16) -> Result<Self, Error> {
        let ip = Ipv4Addr::from_str(ip).map_err(|_| Error::InvalidAddress(ip.to_string()))?;
        Ok(InetAddress {
            addr: SocketAddrV4::new(ip, port),
        })
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `"a.b.c.d:port"` form, for logs and connection names.
    pub fn to_ip_port(&self) -> String {
        self.addr.to_string()
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        self.addr
    }

    pub(crate) fn as_sockaddr_in(&self) -> libc::sockaddr_in {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = self.addr.port().to_be();
        sin.sin_addr.s_addr = u32::from_ne_bytes(self.addr.ip().octets());
        sin
    }

    pub(crate) fn from_sockaddr_in(sin: libc::sockaddr_in) -> Self {
        let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
        let port = u16::from_be(sin.sin_port);
        InetAddress {
            addr: SocketAddrV4::new(ip, port),
        }
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl From<SocketAddrV4> for InetAddress {
    fn from(addr: SocketAddrV4) -> Self {
        InetAddress { addr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_and_loopback() {
        assert_eq!(InetAddress::new(80, false).to_ip_port(), "0.0.0.0:80");
        assert_eq!(InetAddress::new(80, true).to_ip_port(), "127.0.0.1:80");
    }

    #[test]
    fn parse_round_trip() {
        let addr = InetAddress::from_ip_port("192.168.1.9", 9981).unwrap();
        assert_eq!(addr.to_ip_port(), "192.168.1.9:9981");
        let again = InetAddress::from_ip_port(&addr.ip().to_string(), addr.port()).unwrap();
        assert_eq!(addr, again);
    }

    #[test]
    fn rejects_garbage() {
        assert!(InetAddress::from_ip_port("not an ip", 1).is_err());
        assert!(InetAddress::from_ip_port("256.0.0.1", 1).is_err());
    }

    #[test]
    fn sockaddr_round_trip() {
        let addr = InetAddress::from_ip_port("10.1.2.3", 4567).unwrap();
        let sin = addr.as_sockaddr_in();
        assert_eq!(InetAddress::from_sockaddr_in(sin), addr);
    }
}
