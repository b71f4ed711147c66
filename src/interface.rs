use std::collections::BTreeMap;
use std::fmt;

use ipnet::{Ipv4Net, Ipv6Net};

pub const IFF_UP: u32 = 0x1;
pub const IFF_LOOPBACK: u32 = 0x8;
pub const IFF_RUNNING: u32 = 0x40;

/// Address bound to an interface, with the kernel's optional label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfAddr<P> {
    pub prefix: P,
    pub label: Option<String>,
}

/// Snapshot of one kernel interface, folded from link events.
#[derive(Debug, Clone, Default)]
pub struct Interface {
    pub index: u32,
    pub name: String,
    pub vrf_id: u32,
    pub flags: u32,
    pub mtu: u32,
    pub metric: u32,
    pub hw_addr: Vec<u8>,
    pub master: u32,
    pub addrs4: Vec<IfAddr<Ipv4Net>>,
    pub addrs6: Vec<IfAddr<Ipv6Net>>,
    pub desc: Option<String>,
}

impl Interface {
    pub fn is_up(&self) -> bool {
        self.flags & IFF_UP != 0
    }

    pub fn is_running(&self) -> bool {
        self.flags & IFF_RUNNING != 0
    }

    pub fn is_loopback(&self) -> bool {
        self.flags & IFF_LOOPBACK != 0
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} index {} {} mtu {}",
            self.name,
            self.index,
            if self.is_up() { "up" } else { "down" },
            self.mtu
        )
    }
}

/// Per-tenant interface table, keyed by kernel ifindex.
#[derive(Debug, Default)]
pub struct IfTable {
    ifaces: BTreeMap<u32, Interface>,
}

impl IfTable {
    pub fn get(&self, index: u32) -> Option<&Interface> {
        self.ifaces.get(&index)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Interface> {
        self.ifaces.get_mut(&index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Interface> {
        self.ifaces.values().find(|i| i.name == name)
    }

    pub fn get_by_name_mut(&mut self, name: &str) -> Option<&mut Interface> {
        self.ifaces.values_mut().find(|i| i.name == name)
    }

    pub fn insert(&mut self, iface: Interface) {
        self.ifaces.insert(iface.index, iface);
    }

    pub fn remove(&mut self, index: u32) -> Option<Interface> {
        self.ifaces.remove(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.ifaces.values()
    }

    pub fn len(&self) -> usize {
        self.ifaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ifaces.is_empty()
    }
}
