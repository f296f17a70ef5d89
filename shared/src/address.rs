//! Transport endpoints and the trust predicates built on them
//!
//! Every packet the server or client sees is tagged with a [`NetAddress`].
//! Beyond plain routing, addresses drive policy: loopback and LAN peers skip
//! challenge validation, DRDoS accounting groups senders by network prefix,
//! and reconnect detection compares addresses while ignoring the port.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// A transport endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetAddress {
    /// Unresolved or invalid address
    Bad,
    /// In-process connection between a local client and server
    Loopback,
    /// Server-side fake client with no network presence
    Bot,
    Ip(SocketAddrV4),
    Ip6(SocketAddrV6),
    /// A host reachable over both address families
    Dual { v4: SocketAddrV4, v6: SocketAddrV6 },
    /// IPv4 limited broadcast on the given port
    Broadcast(u16),
    /// IPv6 multicast group
    Multicast6(SocketAddrV6),
}

impl NetAddress {
    /// True for the in-process loopback transport
    pub fn is_local(&self) -> bool {
        matches!(self, NetAddress::Loopback)
    }

    /// True for addresses that never leave the local network
    ///
    /// Loopback, RFC1918 IPv4 ranges, 127/8, IPv6 link-local (fe80::/10) and
    /// unique-local (fc00::/7) qualify.
    pub fn is_lan(&self) -> bool {
        match self {
            NetAddress::Loopback => true,
            NetAddress::Ip(addr) => is_lan_v4(addr.ip()),
            NetAddress::Ip6(addr) => is_lan_v6(addr.ip()),
            _ => false,
        }
    }

    pub fn is_ip(&self) -> bool {
        matches!(self, NetAddress::Ip(_) | NetAddress::Ip6(_))
    }

    pub fn port(&self) -> u16 {
        match self {
            NetAddress::Ip(addr) => addr.port(),
            NetAddress::Ip6(addr) | NetAddress::Multicast6(addr) => addr.port(),
            NetAddress::Dual { v4, .. } => v4.port(),
            NetAddress::Broadcast(port) => *port,
            _ => 0,
        }
    }

    /// Replaces the port, keeping the host part
    pub fn set_port(&mut self, port: u16) {
        match self {
            NetAddress::Ip(addr) => addr.set_port(port),
            NetAddress::Ip6(addr) | NetAddress::Multicast6(addr) => addr.set_port(port),
            NetAddress::Dual { v4, v6 } => {
                v4.set_port(port);
                v6.set_port(port);
            }
            NetAddress::Broadcast(p) => *p = port,
            _ => {}
        }
    }

    /// Compares hosts while ignoring ports
    pub fn compare_base(&self, other: &NetAddress) -> bool {
        match (self, other) {
            (NetAddress::Loopback, NetAddress::Loopback) => true,
            (NetAddress::Bot, NetAddress::Bot) => true,
            (NetAddress::Ip(a), NetAddress::Ip(b)) => a.ip() == b.ip(),
            (NetAddress::Ip6(a), NetAddress::Ip6(b)) => a.ip() == b.ip(),
            (NetAddress::Dual { v4, .. }, NetAddress::Ip(b))
            | (NetAddress::Ip(b), NetAddress::Dual { v4, .. }) => v4.ip() == b.ip(),
            (NetAddress::Dual { v6, .. }, NetAddress::Ip6(b))
            | (NetAddress::Ip6(b), NetAddress::Dual { v6, .. }) => v6.ip() == b.ip(),
            _ => false,
        }
    }

    /// Network prefix used to group senders for flood accounting
    ///
    /// IPv4 keeps the /24, IPv6 the /56. Other address kinds have no prefix.
    pub fn masked(&self) -> Option<NetAddress> {
        match self {
            NetAddress::Ip(addr) => {
                let [a, b, c, _] = addr.ip().octets();
                Some(NetAddress::Ip(SocketAddrV4::new(Ipv4Addr::new(a, b, c, 0), addr.port())))
            }
            NetAddress::Ip6(addr) => {
                let mut octets = addr.ip().octets();
                for byte in octets.iter_mut().skip(7) {
                    *byte = 0;
                }
                Some(NetAddress::Ip6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    addr.port(),
                    0,
                    0,
                )))
            }
            _ => None,
        }
    }

    /// Socket address for the transport, if the address is routable
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            NetAddress::Ip(addr) => Some(SocketAddr::V4(*addr)),
            NetAddress::Ip6(addr) | NetAddress::Multicast6(addr) => Some(SocketAddr::V6(*addr)),
            NetAddress::Dual { v4, .. } => Some(SocketAddr::V4(*v4)),
            NetAddress::Broadcast(port) => Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::BROADCAST,
                *port,
            ))),
            _ => None,
        }
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => NetAddress::Ip(v4),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => NetAddress::Ip(SocketAddrV4::new(v4, v6.port())),
                None => NetAddress::Ip6(v6),
            },
        }
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAddress::Bad => write!(f, "bad"),
            NetAddress::Loopback => write!(f, "loopback"),
            NetAddress::Bot => write!(f, "bot"),
            NetAddress::Ip(addr) => write!(f, "{}", addr),
            NetAddress::Ip6(addr) | NetAddress::Multicast6(addr) => write!(f, "{}", addr),
            NetAddress::Dual { v4, v6 } => write!(f, "{} / {}", v4, v6),
            NetAddress::Broadcast(port) => write!(f, "255.255.255.255:{}", port),
        }
    }
}

fn is_lan_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    a == 10 || a == 127 || (a == 172 && (b & 0xf0) == 16) || (a == 192 && b == 168)
}

fn is_lan_v6(ip: &Ipv6Addr) -> bool {
    let octets = ip.octets();
    (octets[0] == 0xfe && (octets[1] & 0xc0) == 0x80) || (octets[0] & 0xfe) == 0xfc
}
