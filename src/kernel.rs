use ipnet::IpNet;
use netlink_packet_route::route::RouteProtocol;
use parking_lot::Mutex;

use crate::nexthop::Nexthop;
use crate::rib::{Rib, RibSrc, RibType};

// Kernel route origin tags (rtnetlink protocol values).
const RTPROT_REDIRECT: u8 = 1;
const RTPROT_STATIC: u8 = 4;
const RTPROT_BGP: u8 = 186;
const RTPROT_ISIS: u8 = 187;
const RTPROT_OSPF: u8 = 188;
const RTPROT_RIP: u8 = 189;

/// Outbound FIB synchronization. Called for non-system route types only;
/// kernel and connected routes are already kernel-authoritative.
pub trait FibHandler: Send + Sync {
    fn install(&self, vrf_id: u32, prefix: &IpNet, rib: &Rib);
    fn uninstall(&self, vrf_id: u32, prefix: &IpNet, rib: &Rib);
}

pub struct NoopFib;

impl FibHandler for NoopFib {
    fn install(&self, _vrf_id: u32, _prefix: &IpNet, _rib: &Rib) {}
    fn uninstall(&self, _vrf_id: u32, _prefix: &IpNet, _rib: &Rib) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FibOpKind {
    Install,
    Uninstall,
}

#[derive(Debug, Clone)]
pub struct FibOp {
    pub kind: FibOpKind,
    pub vrf_id: u32,
    pub prefix: IpNet,
    pub rtype: RibType,
}

/// Records every install/uninstall instead of touching the kernel.
#[derive(Default)]
pub struct FibRecorder {
    pub ops: Mutex<Vec<FibOp>>,
}

impl FibRecorder {
    fn record(&self, kind: FibOpKind, vrf_id: u32, prefix: &IpNet, rib: &Rib) {
        self.ops.lock().push(FibOp {
            kind,
            vrf_id,
            prefix: *prefix,
            rtype: rib.rtype,
        });
    }
}

impl FibHandler for FibRecorder {
    fn install(&self, vrf_id: u32, prefix: &IpNet, rib: &Rib) {
        self.record(FibOpKind::Install, vrf_id, prefix, rib);
    }

    fn uninstall(&self, vrf_id: u32, prefix: &IpNet, rib: &Rib) {
        self.record(FibOpKind::Uninstall, vrf_id, prefix, rib);
    }
}

/// Kernel interface change, decoded upstream from the link layer.
#[derive(Debug, Clone)]
pub struct IfEvent {
    pub delete: bool,
    pub name: String,
    pub index: u32,
    pub vrf_id: u32,
    pub flags: u32,
    pub mtu: u32,
    pub metric: u32,
    pub hw_addr: Vec<u8>,
    pub master: u32,
}

/// Kernel interface address change.
#[derive(Debug, Clone)]
pub struct AddrEvent {
    pub delete: bool,
    pub ifindex: u32,
    pub vrf_id: u32,
    pub prefix: IpNet,
    pub label: Option<String>,
}

/// Kernel route change.
#[derive(Debug, Clone)]
pub struct RouteEvent {
    pub delete: bool,
    pub table: u32,
    pub prefix: IpNet,
    pub nexthops: Vec<Nexthop>,
    pub metric: u32,
    pub protocol: RouteProtocol,
}

impl RouteEvent {
    /// ICMP redirects and multicast routes are kernel noise, not RIB content.
    pub fn discard(&self) -> bool {
        u8::from(self.protocol) == RTPROT_REDIRECT || self.prefix.addr().is_multicast()
    }

    pub fn rib_type(&self) -> RibType {
        match u8::from(self.protocol) {
            RTPROT_STATIC => RibType::Static,
            RTPROT_BGP => RibType::Bgp,
            RTPROT_ISIS => RibType::Isis,
            RTPROT_OSPF => RibType::Ospf,
            RTPROT_RIP => RibType::Rip,
            _ => RibType::Kernel,
        }
    }

    pub fn to_rib(&self) -> Rib {
        let mut rib = Rib::new(self.rib_type(), RibSrc::Kernel);
        rib.nexthops = self.nexthops.clone();
        rib.metric = self.metric;
        rib
    }
}
