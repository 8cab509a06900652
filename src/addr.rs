use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

/// An IPv4 TCP endpoint.
///
/// Wraps the host representation and converts to and from the kernel
/// `sockaddr_in` form at the syscall boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InetAddr(SocketAddrV4);

impl InetAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> InetAddr {
        InetAddr(SocketAddrV4::new(ip, port))
    }

    /// `0.0.0.0:port`, for listening on all interfaces.
    pub fn any(port: u16) -> InetAddr {
        InetAddr(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
    }

    /// `127.0.0.1:port`.
    pub fn loopback(port: u16) -> InetAddr {
        InetAddr(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// The `"ip:port"` string form.
    pub fn ip_port(&self) -> String {
        self.0.to_string()
    }

    pub(crate) fn to_raw(self) -> libc::sockaddr_in {
        libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: self.0.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(*self.0.ip()).to_be(),
            },
            sin_zero: [0; 8],
        }
    }

    pub(crate) fn from_raw(raw: &libc::sockaddr_in) -> InetAddr {
        InetAddr(SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr)),
            u16::from_be(raw.sin_port),
        ))
    }
}

impl From<SocketAddrV4> for InetAddr {
    fn from(addr: SocketAddrV4) -> InetAddr {
        InetAddr(addr)
    }
}

impl FromStr for InetAddr {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<InetAddr, Self::Err> {
        s.parse::<SocketAddrV4>().map(InetAddr)
    }
}

impl fmt::Display for InetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        let addr = InetAddr::new(Ipv4Addr::new(192, 0, 2, 7), 7890);
        let raw = addr.to_raw();
        assert_eq!(InetAddr::from_raw(&raw), addr);
        assert_eq!(addr.ip_port(), "192.0.2.7:7890");
    }

    #[test]
    fn parses_ip_port() {
        let addr: InetAddr = "127.0.0.1:2007".parse().unwrap();
        assert_eq!(addr, InetAddr::loopback(2007));
    }
}
