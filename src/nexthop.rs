use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

/// Segment routing encapsulation attached to a nexthop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encap {
    Seg6 { mode: u32, segs: Vec<Ipv6Addr> },
    Seg6Local { action: u32 },
}

/// Forwarding descriptor: a gateway address, an egress interface, or both.
/// Immutable once attached to a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nexthop {
    pub addr: Option<IpAddr>,
    pub ifindex: u32,
    pub encap: Option<Encap>,
}

impl Nexthop {
    pub fn from_addr(addr: IpAddr) -> Nexthop {
        Nexthop {
            addr: Some(addr),
            ifindex: 0,
            encap: None,
        }
    }

    pub fn from_ifindex(ifindex: u32) -> Nexthop {
        Nexthop {
            addr: None,
            ifindex,
            encap: None,
        }
    }

    pub fn from_addr_ifindex(addr: IpAddr, ifindex: u32) -> Nexthop {
        Nexthop {
            addr: Some(addr),
            ifindex,
            encap: None,
        }
    }

    pub fn is_if_only(&self) -> bool {
        self.addr.is_none() && self.ifindex != 0
    }

    pub fn is_addr_only(&self) -> bool {
        self.addr.is_some() && self.ifindex == 0
    }

    pub fn is_addr_if(&self) -> bool {
        self.addr.is_some() && self.ifindex != 0
    }
}

impl fmt::Display for Nexthop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.addr, self.ifindex) {
            (Some(addr), 0) => write!(f, "{}", addr),
            (Some(addr), ifindex) => write!(f, "{} dev {}", addr, ifindex),
            (None, ifindex) => write!(f, "dev {}", ifindex),
        }
    }
}
