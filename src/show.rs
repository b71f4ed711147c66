use std::fmt;

use ipnet::IpNet;

use crate::rib::{Rib, RibType};
use crate::table::Afi;
use crate::vrf::Vrf;

/// Narrowing criteria for route dumps. Everything `None` dumps the whole
/// tenant.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteFilter {
    pub afi: Option<Afi>,
    pub rtype: Option<RibType>,
    pub selected_only: bool,
}

/// One line of route dump output, zebra style: type code, selected (`>`)
/// and installed (`*`) markers, then prefix and nexthops.
#[derive(Debug, Clone)]
pub struct RouteRow {
    pub vrf: String,
    pub prefix: IpNet,
    pub rib: Rib,
}

impl fmt::Display for RouteRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nexthops = self
            .rib
            .nexthops
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "{}{}{} {} [{}/{}] {} vrf {}",
            self.rib.rtype.code(),
            if self.rib.flags.selected() { '>' } else { ' ' },
            if self.rib.flags.fib() { '*' } else { ' ' },
            self.prefix,
            self.rib.distance,
            self.rib.metric,
            nexthops,
            self.vrf,
        )
    }
}

#[derive(Debug, Clone)]
pub struct IfRow {
    pub vrf: String,
    pub index: u32,
    pub name: String,
    pub up: bool,
    pub running: bool,
    pub mtu: u32,
    pub addrs: Vec<IpNet>,
    pub desc: Option<String>,
}

impl fmt::Display for IfRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addrs = self
            .addrs
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "{} index {} {}/{} mtu {} [{}] vrf {}",
            self.name,
            self.index,
            if self.up { "up" } else { "down" },
            if self.running { "running" } else { "stopped" },
            self.mtu,
            addrs,
            self.vrf,
        )
    }
}

pub fn route_rows(vrf: &Vrf, filter: RouteFilter) -> Vec<RouteRow> {
    let mut rows: Vec<RouteRow> = vrf
        .routes()
        .into_iter()
        .filter(|(prefix, rib)| {
            filter.afi.map_or(true, |afi| Afi::of(prefix) == afi)
                && filter.rtype.map_or(true, |t| rib.rtype == t)
                && (!filter.selected_only || rib.flags.selected())
        })
        .map(|(prefix, rib)| RouteRow {
            vrf: vrf.name.clone(),
            prefix,
            rib,
        })
        .collect();
    rows.sort_by_key(|r| r.prefix);
    rows
}

pub fn if_rows(vrf: &Vrf) -> Vec<IfRow> {
    let tables = vrf.tables.lock();
    tables
        .ifaces
        .iter()
        .map(|iface| {
            let mut addrs: Vec<IpNet> =
                iface.addrs4.iter().map(|a| IpNet::V4(a.prefix)).collect();
            addrs.extend(iface.addrs6.iter().map(|a| IpNet::V6(a.prefix)));
            IfRow {
                vrf: vrf.name.clone(),
                index: iface.index,
                name: iface.name.clone(),
                up: iface.is_up(),
                running: iface.is_running(),
                mtu: iface.mtu,
                addrs,
                desc: iface.desc.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::NoopFib;
    use crate::nexthop::Nexthop;
    use crate::rib::{Rib, RibSrc, RibType};
    use crate::vrf::VrfRegistry;
    use std::sync::Arc;

    #[test]
    fn route_row_markers() {
        let reg = VrfRegistry::new(Arc::new(NoopFib), false);
        let vrf = reg.default_vrf();
        vrf.rib_add(
            "10.0.0.0/24".parse().unwrap(),
            Rib::with_nexthop(RibType::Static, RibSrc::Config, Nexthop::from_ifindex(3)),
        );

        let rows = route_rows(&vrf, RouteFilter::default());
        assert_eq!(rows.len(), 1);
        let line = rows[0].to_string();
        assert!(line.starts_with("S>*"), "unexpected line: {}", line);
        assert!(line.contains("10.0.0.0/24"));
        assert!(line.contains("[1/0]"));
    }

    #[test]
    fn rows_are_sorted_by_prefix() {
        let reg = VrfRegistry::new(Arc::new(NoopFib), false);
        let vrf = reg.default_vrf();
        for p in ["10.2.0.0/24", "10.0.0.0/24", "10.1.0.0/24"] {
            vrf.rib_add(
                p.parse().unwrap(),
                Rib::with_nexthop(RibType::Kernel, RibSrc::Kernel, Nexthop::from_ifindex(3)),
            );
        }
        let rows = route_rows(&vrf, RouteFilter::default());
        let prefixes: Vec<String> = rows.iter().map(|r| r.prefix.to_string()).collect();
        assert_eq!(prefixes, vec!["10.0.0.0/24", "10.1.0.0/24", "10.2.0.0/24"]);
    }

    #[test]
    fn type_filter_narrows_the_dump() {
        let reg = VrfRegistry::new(Arc::new(NoopFib), false);
        let vrf = reg.default_vrf();
        vrf.rib_add(
            "10.0.0.0/24".parse().unwrap(),
            Rib::with_nexthop(RibType::Kernel, RibSrc::Kernel, Nexthop::from_ifindex(3)),
        );
        vrf.rib_add(
            "10.1.0.0/24".parse().unwrap(),
            Rib::with_nexthop(RibType::Static, RibSrc::Config, Nexthop::from_ifindex(3)),
        );

        let filter = RouteFilter {
            rtype: Some(RibType::Static),
            ..RouteFilter::default()
        };
        let rows = route_rows(&vrf, filter);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rib.rtype, RibType::Static);
    }
}
