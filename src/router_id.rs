use std::net::Ipv4Addr;

use crate::interface::IfTable;

/// Router identifier state for one tenant. A configured value always wins;
/// otherwise the highest usable loopback address, then the highest address
/// on any other interface.
#[derive(Debug)]
pub struct RouterId {
    pub configured: Option<Ipv4Addr>,
    pub current: Ipv4Addr,
}

impl Default for RouterId {
    fn default() -> Self {
        Self {
            configured: None,
            current: Ipv4Addr::UNSPECIFIED,
        }
    }
}

fn usable(addr: Ipv4Addr) -> bool {
    !addr.is_loopback() && !addr.is_unspecified()
}

impl RouterId {
    pub fn set(&mut self, addr: Ipv4Addr) {
        self.configured = Some(addr);
    }

    pub fn unset(&mut self) {
        self.configured = None;
    }

    /// Re-runs the election against the interface table. Returns the new
    /// value when it changed, `None` when it stayed put.
    pub fn elect(&mut self, ifaces: &IfTable) -> Option<Ipv4Addr> {
        let winner = if let Some(addr) = self.configured {
            addr
        } else {
            let mut loopback = Ipv4Addr::UNSPECIFIED;
            let mut other = Ipv4Addr::UNSPECIFIED;
            for iface in ifaces.iter() {
                for ifaddr in &iface.addrs4 {
                    let addr = ifaddr.prefix.addr();
                    if !usable(addr) {
                        continue;
                    }
                    if iface.is_loopback() {
                        if addr > loopback {
                            loopback = addr;
                        }
                    } else if addr > other {
                        other = addr;
                    }
                }
            }
            if loopback != Ipv4Addr::UNSPECIFIED {
                loopback
            } else {
                other
            }
        };
        if winner == self.current {
            return None;
        }
        self.current = winner;
        Some(winner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{IfAddr, Interface, IFF_LOOPBACK, IFF_UP};

    fn iface(index: u32, flags: u32, addrs: &[&str]) -> Interface {
        Interface {
            index,
            name: format!("if{index}"),
            flags,
            addrs4: addrs
                .iter()
                .map(|s| IfAddr {
                    prefix: s.parse().unwrap(),
                    label: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn loopback_address_beats_others() {
        let mut ifaces = IfTable::default();
        ifaces.insert(iface(1, IFF_UP | IFF_LOOPBACK, &["127.0.0.1/8", "10.255.0.1/32"]));
        ifaces.insert(iface(3, IFF_UP, &["192.0.2.99/24"]));

        let mut rid = RouterId::default();
        assert_eq!(rid.elect(&ifaces), Some("10.255.0.1".parse().unwrap()));
        // Stable on re-election.
        assert_eq!(rid.elect(&ifaces), None);
    }

    #[test]
    fn falls_back_to_highest_interface_address() {
        let mut ifaces = IfTable::default();
        ifaces.insert(iface(3, IFF_UP, &["192.0.2.1/24", "198.51.100.7/24"]));

        let mut rid = RouterId::default();
        assert_eq!(rid.elect(&ifaces), Some("198.51.100.7".parse().unwrap()));
    }

    #[test]
    fn configured_value_wins_and_unset_reverts() {
        let mut ifaces = IfTable::default();
        ifaces.insert(iface(3, IFF_UP, &["192.0.2.1/24"]));

        let mut rid = RouterId::default();
        rid.elect(&ifaces);
        rid.set("203.0.113.5".parse().unwrap());
        assert_eq!(rid.elect(&ifaces), Some("203.0.113.5".parse().unwrap()));

        rid.unset();
        assert_eq!(rid.elect(&ifaces), Some("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn empty_table_elects_unspecified() {
        let ifaces = IfTable::default();
        let mut rid = RouterId::default();
        assert_eq!(rid.elect(&ifaces), None);
        assert_eq!(rid.current, Ipv4Addr::UNSPECIFIED);
    }
}
