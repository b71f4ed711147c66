use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use prefix_trie::{Prefix, PrefixMap};
use std::net::IpAddr;

use crate::rib::Rib;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Afi {
    Ip,
    Ip6,
}

pub const AFI_MAX: usize = 2;

impl Afi {
    pub fn index(self) -> usize {
        match self {
            Afi::Ip => 0,
            Afi::Ip6 => 1,
        }
    }

    pub fn of(prefix: &IpNet) -> Afi {
        match prefix {
            IpNet::V4(_) => Afi::Ip,
            IpNet::V6(_) => Afi::Ip6,
        }
    }
}

/// Route records of one address family, keyed by prefix. A node with no
/// records is removed from the trie.
pub type RibTable<P> = PrefixMap<P, Vec<Rib>>;

/// Family-typed prefix usable as a trie key.
pub trait AfiPrefix: Prefix + Copy + Eq + std::fmt::Debug + std::fmt::Display {
    const AFI: Afi;

    /// Host route covering a bare address, None on family mismatch.
    fn host(addr: IpAddr) -> Option<Self>;
    /// Prefix with host bits masked off.
    fn masked(&self) -> Self;
    fn plen(&self) -> u8;
    fn to_ipnet(&self) -> IpNet;
    fn from_ipnet(prefix: IpNet) -> Option<Self>;

    fn is_default(&self) -> bool {
        self.plen() == 0
    }
}

impl AfiPrefix for Ipv4Net {
    const AFI: Afi = Afi::Ip;

    fn host(addr: IpAddr) -> Option<Self> {
        match addr {
            IpAddr::V4(v4) => Ipv4Net::new(v4, 32).ok(),
            IpAddr::V6(_) => None,
        }
    }

    fn masked(&self) -> Self {
        self.trunc()
    }

    fn plen(&self) -> u8 {
        self.prefix_len()
    }

    fn to_ipnet(&self) -> IpNet {
        IpNet::V4(*self)
    }

    fn from_ipnet(prefix: IpNet) -> Option<Self> {
        match prefix {
            IpNet::V4(v4) => Some(v4),
            IpNet::V6(_) => None,
        }
    }
}

impl AfiPrefix for Ipv6Net {
    const AFI: Afi = Afi::Ip6;

    fn host(addr: IpAddr) -> Option<Self> {
        match addr {
            IpAddr::V4(_) => None,
            IpAddr::V6(v6) => Ipv6Net::new(v6, 128).ok(),
        }
    }

    fn masked(&self) -> Self {
        self.trunc()
    }

    fn plen(&self) -> u8 {
        self.prefix_len()
    }

    fn to_ipnet(&self) -> IpNet {
        IpNet::V6(*self)
    }

    fn from_ipnet(prefix: IpNet) -> Option<Self> {
        match prefix {
            IpNet::V4(_) => None,
            IpNet::V6(v6) => Some(v6),
        }
    }
}
