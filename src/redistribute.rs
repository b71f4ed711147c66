use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use foundations::telemetry::log;
use parking_lot::RwLock;

use crate::message::{Command, RouteType, RouteUpdateBody};
use crate::rib::{ClientId, Rib, RibNotice, RibSrc, RibType, RibUpdate};
use crate::table::{Afi, AFI_MAX};
use crate::zapi::ClientTable;

#[derive(Default)]
struct Scope {
    typ: [HashMap<RibType, Vec<ClientId>>; AFI_MAX],
    def: [Vec<ClientId>; AFI_MAX],
}

impl Scope {
    fn add(list: &mut Vec<ClientId>, id: ClientId) {
        if !list.contains(&id) {
            list.push(id);
        }
    }

    fn subscribe(&mut self, id: ClientId, afi: Afi, rtype: RibType) {
        Scope::add(self.typ[afi.index()].entry(rtype).or_default(), id);
    }

    fn unsubscribe(&mut self, id: ClientId, afi: Afi, rtype: RibType) {
        if let Some(list) = self.typ[afi.index()].get_mut(&rtype) {
            list.retain(|&c| c != id);
        }
    }

    fn subscribe_default(&mut self, id: ClientId, afi: Afi) {
        Scope::add(&mut self.def[afi.index()], id);
    }

    fn unsubscribe_default(&mut self, id: ClientId, afi: Afi) {
        self.def[afi.index()].retain(|&c| c != id);
    }

    fn drop_client(&mut self, id: ClientId) {
        for map in &mut self.typ {
            for list in map.values_mut() {
                list.retain(|&c| c != id);
            }
        }
        for list in &mut self.def {
            list.retain(|&c| c != id);
        }
    }

    fn subscribers(&self, afi: Afi, rtype: RibType, default: bool, out: &mut Vec<ClientId>) {
        let list = if default {
            &self.def[afi.index()]
        } else {
            match self.typ[afi.index()].get(&rtype) {
                Some(list) => list,
                None => return,
            }
        };
        for &id in list {
            if !out.contains(&id) {
                out.push(id);
            }
        }
    }
}

#[derive(Default)]
struct RedistTables {
    /// Version 3 clients see every tenant.
    global: Scope,
    /// Version 2 clients are scoped to the tenant they are bound to.
    per_vrf: HashMap<u32, Scope>,
}

/// Subscription registry and fanout of selection changes to clients.
#[derive(Default)]
pub struct Redistributor {
    inner: RwLock<RedistTables>,
}

impl Redistributor {
    /// `vrf` of None registers in the global (all-tenant) scope.
    pub fn subscribe(&self, id: ClientId, vrf: Option<u32>, afi: Afi, rtype: RibType) {
        let mut inner = self.inner.write();
        match vrf {
            None => inner.global.subscribe(id, afi, rtype),
            Some(v) => inner.per_vrf.entry(v).or_default().subscribe(id, afi, rtype),
        }
    }

    pub fn unsubscribe(&self, id: ClientId, vrf: Option<u32>, afi: Afi, rtype: RibType) {
        let mut inner = self.inner.write();
        match vrf {
            None => inner.global.unsubscribe(id, afi, rtype),
            Some(v) => {
                if let Some(scope) = inner.per_vrf.get_mut(&v) {
                    scope.unsubscribe(id, afi, rtype);
                }
            }
        }
    }

    pub fn subscribe_default(&self, id: ClientId, vrf: Option<u32>, afi: Afi) {
        let mut inner = self.inner.write();
        match vrf {
            None => inner.global.subscribe_default(id, afi),
            Some(v) => inner.per_vrf.entry(v).or_default().subscribe_default(id, afi),
        }
    }

    pub fn unsubscribe_default(&self, id: ClientId, vrf: Option<u32>, afi: Afi) {
        let mut inner = self.inner.write();
        match vrf {
            None => inner.global.unsubscribe_default(id, afi),
            Some(v) => {
                if let Some(scope) = inner.per_vrf.get_mut(&v) {
                    scope.unsubscribe_default(id, afi);
                }
            }
        }
    }

    pub fn unsubscribe_all(&self, id: ClientId) {
        let mut inner = self.inner.write();
        inner.global.drop_client(id);
        for scope in inner.per_vrf.values_mut() {
            scope.drop_client(id);
        }
    }

    fn subscribers(&self, vrf_id: u32, afi: Afi, rtype: RibType, default: bool) -> Vec<ClientId> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        inner.global.subscribers(afi, rtype, default, &mut out);
        if let Some(scope) = inner.per_vrf.get(&vrf_id) {
            scope.subscribers(afi, rtype, default, &mut out);
        }
        out
    }

    /// Fans selection changes out to interested clients. Call with no locks
    /// held; sends go through each client's outbound queue.
    pub async fn deliver(&self, clients: &ClientTable, notices: &[RibNotice]) {
        for notice in notices {
            // Tenant 0 is never redistributed outward, and only Connected,
            // BGP and OSPF routes are pushed to peers.
            if notice.vrf_id == 0 || !redistributable(notice.rib.rtype) {
                continue;
            }
            let afi = Afi::of(&notice.prefix);
            let default = notice.prefix.prefix_len() == 0;
            for id in self.subscribers(notice.vrf_id, afi, notice.rib.rtype, default) {
                // Never reflect a route back at its origin.
                if notice.rib.src == RibSrc::Client(id) {
                    continue;
                }
                let client = match clients.get(id) {
                    Some(client) => client,
                    None => continue,
                };
                if client.version == 2 {
                    if client.vrf_id != notice.vrf_id {
                        continue;
                    }
                    // Version 2 daemons choke on foreign metrics.
                    if notice.rib.metric != 0 {
                        continue;
                    }
                } else if notice.rib.rtype == RibType::Connected {
                    // Version 3 clients learn connected routes from interface
                    // address messages instead.
                    continue;
                }
                let buf = encode_notice(notice, afi, client.version);
                if client.tx.send(buf).await.is_err() {
                    log::debug!("redistribute send to client {} failed", id);
                }
            }
        }
    }
}

/// Route types eligible for outbound push.
fn redistributable(rtype: RibType) -> bool {
    matches!(rtype, RibType::Connected | RibType::Bgp | RibType::Ospf)
}

fn route_command(afi: Afi, update: RibUpdate) -> Command {
    match (afi, update) {
        (Afi::Ip, RibUpdate::Withdraw) => Command::Ipv4RouteDelete,
        (Afi::Ip, _) => Command::Ipv4RouteAdd,
        (Afi::Ip6, RibUpdate::Withdraw) => Command::Ipv6RouteDelete,
        (Afi::Ip6, _) => Command::Ipv6RouteAdd,
    }
}

/// Route update as sent to a subscriber: first nexthop only, distance and
/// metric attached on announcements.
pub fn encode_notice(notice: &RibNotice, afi: Afi, version: u8) -> Bytes {
    let mut body = RouteUpdateBody::new(
        RouteType::from_rib_type(notice.rib.rtype, afi),
        notice.prefix,
    );
    if let Some(nexthop) = notice.rib.nexthops.first() {
        body.nexthops.push(nexthop.clone());
    }
    if notice.update != RibUpdate::Withdraw {
        body.distance = Some(notice.rib.distance);
        body.metric = Some(notice.rib.metric);
    }
    let mut raw = BytesMut::new();
    body.encode(version, &mut raw);
    crate::message::frame(
        version,
        notice.vrf_id as u16,
        route_command(afi, notice.update),
        &raw,
    )
    .freeze()
}

/// One-shot replay of the current redistribution set, run when a client
/// subscribes. `routes` is the tenant's selected set.
pub fn sync_frames(
    routes: &[(ipnet::IpNet, Rib)],
    vrf_id: u32,
    afi: Afi,
    rtype: Option<RibType>,
    default_only: bool,
    version: u8,
) -> Vec<Bytes> {
    let mut out = Vec::new();
    if vrf_id == 0 {
        return out;
    }
    for (prefix, rib) in routes {
        if Afi::of(prefix) != afi || !redistributable(rib.rtype) {
            continue;
        }
        if default_only != (prefix.prefix_len() == 0) {
            continue;
        }
        if let Some(rtype) = rtype {
            if rib.rtype != rtype {
                continue;
            }
        }
        if version == 2 && rib.metric != 0 {
            continue;
        }
        if version != 2 && rib.rtype == RibType::Connected {
            continue;
        }
        let notice = RibNotice {
            vrf_id,
            update: RibUpdate::Announce,
            prefix: *prefix,
            rib: rib.clone(),
        };
        out.push(encode_notice(&notice, afi, version));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nexthop::Nexthop;
    use ipnet::IpNet;
    use octets::Octets;

    fn notice(vrf_id: u32, prefix: &str, rtype: RibType, metric: u32) -> RibNotice {
        let mut rib = Rib::with_nexthop(rtype, RibSrc::Client(99), Nexthop::from_ifindex(2));
        rib.metric = metric;
        RibNotice {
            vrf_id,
            update: RibUpdate::Announce,
            prefix: prefix.parse().unwrap(),
            rib,
        }
    }

    #[test]
    fn subscribe_and_collect() {
        let redist = Redistributor::default();
        redist.subscribe(1, None, Afi::Ip, RibType::Bgp);
        redist.subscribe(2, Some(5), Afi::Ip, RibType::Bgp);
        redist.subscribe(3, Some(6), Afi::Ip, RibType::Bgp);

        let subs = redist.subscribers(5, Afi::Ip, RibType::Bgp, false);
        assert_eq!(subs, vec![1, 2]);
        // Global subscribers see every tenant.
        let subs = redist.subscribers(6, Afi::Ip, RibType::Bgp, false);
        assert_eq!(subs, vec![1, 3]);
        // Different type or family matches nothing.
        assert!(redist.subscribers(5, Afi::Ip, RibType::Ospf, false).is_empty());
        assert!(redist.subscribers(5, Afi::Ip6, RibType::Bgp, false).is_empty());
    }

    #[test]
    fn default_subscription_is_separate() {
        let redist = Redistributor::default();
        redist.subscribe_default(1, None, Afi::Ip);

        assert_eq!(redist.subscribers(5, Afi::Ip, RibType::Kernel, true), vec![1]);
        assert!(redist.subscribers(5, Afi::Ip, RibType::Kernel, false).is_empty());
    }

    #[test]
    fn unsubscribe_all_clears_every_scope() {
        let redist = Redistributor::default();
        redist.subscribe(1, None, Afi::Ip, RibType::Bgp);
        redist.subscribe(1, Some(5), Afi::Ip6, RibType::Ospf);
        redist.subscribe_default(1, Some(5), Afi::Ip);

        redist.unsubscribe_all(1);
        assert!(redist.subscribers(5, Afi::Ip, RibType::Bgp, false).is_empty());
        assert!(redist.subscribers(5, Afi::Ip6, RibType::Ospf, false).is_empty());
        assert!(redist.subscribers(5, Afi::Ip, RibType::Kernel, true).is_empty());
    }

    #[test]
    fn encoded_notice_carries_first_nexthop_and_attributes() {
        let mut n = notice(5, "10.0.0.0/24", RibType::Bgp, 30);
        n.rib.nexthops.push(Nexthop::from_ifindex(3));

        let buf = encode_notice(&n, Afi::Ip, 3);
        let mut octs = Octets::with_slice(&buf);
        let header = crate::message::ZapiHeader::decode(&mut octs).unwrap();
        assert_eq!(header.vrf_id, 5);
        assert_eq!(
            Command::from_u16(header.command).unwrap(),
            Command::Ipv4RouteAdd
        );
        let body = RouteUpdateBody::decode(&mut octs, 3, Afi::Ip).unwrap();
        assert_eq!(body.rtype, RouteType::Bgp);
        assert_eq!(body.nexthops.len(), 1);
        assert_eq!(body.distance, Some(200));
        assert_eq!(body.metric, Some(30));
    }

    #[test]
    fn withdraw_maps_to_delete_without_attributes() {
        let mut n = notice(0, "2001:db8::/32", RibType::Ospf, 0);
        n.update = RibUpdate::Withdraw;

        let buf = encode_notice(&n, Afi::Ip6, 3);
        let mut octs = Octets::with_slice(&buf);
        let header = crate::message::ZapiHeader::decode(&mut octs).unwrap();
        assert_eq!(
            Command::from_u16(header.command).unwrap(),
            Command::Ipv6RouteDelete
        );
        let body = RouteUpdateBody::decode(&mut octs, 3, Afi::Ip6).unwrap();
        assert_eq!(body.distance, None);
        assert_eq!(body.metric, None);
    }

    #[test]
    fn sync_frames_filter_by_type_family_and_version() {
        let routes: Vec<(IpNet, Rib)> = vec![
            (
                "10.0.0.0/24".parse().unwrap(),
                Rib::with_nexthop(RibType::Bgp, RibSrc::Client(1), Nexthop::from_ifindex(2)),
            ),
            (
                "10.1.0.0/24".parse().unwrap(),
                Rib::with_nexthop(RibType::Connected, RibSrc::System, Nexthop::from_ifindex(2)),
            ),
            (
                "2001:db8::/32".parse().unwrap(),
                Rib::with_nexthop(RibType::Bgp, RibSrc::Client(1), Nexthop::from_ifindex(2)),
            ),
        ];

        let frames = sync_frames(&routes, 5, Afi::Ip, Some(RibType::Bgp), false, 3);
        assert_eq!(frames.len(), 1);

        // Connected is suppressed for version 3 subscribers.
        let frames = sync_frames(&routes, 5, Afi::Ip, Some(RibType::Connected), false, 3);
        assert!(frames.is_empty());
        let frames = sync_frames(&routes, 5, Afi::Ip, Some(RibType::Connected), false, 2);
        assert_eq!(frames.len(), 1);

        // The default tenant is never replayed outward.
        let frames = sync_frames(&routes, 0, Afi::Ip, Some(RibType::Bgp), false, 3);
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn tenant_zero_routes_are_not_pushed() {
        let redist = Redistributor::default();
        let clients = ClientTable::default();
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let id = clients.register(tx, 0);
        clients.update(id, |c| c.version = 3);
        redist.subscribe(id, None, Afi::Ip, RibType::Bgp);

        redist
            .deliver(&clients, &[notice(0, "10.0.0.0/24", RibType::Bgp, 0)])
            .await;
        assert!(rx.try_recv().is_err());

        redist
            .deliver(&clients, &[notice(5, "10.0.0.0/24", RibType::Bgp, 0)])
            .await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn only_connected_bgp_and_ospf_are_pushed() {
        let redist = Redistributor::default();
        let clients = ClientTable::default();
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let id = clients.register(tx, 0);
        clients.update(id, |c| c.version = 3);
        for rtype in [RibType::Static, RibType::Rip, RibType::Ospf] {
            redist.subscribe(id, None, Afi::Ip, rtype);
        }

        redist
            .deliver(
                &clients,
                &[
                    notice(5, "10.0.0.0/24", RibType::Static, 0),
                    notice(5, "10.1.0.0/24", RibType::Rip, 0),
                    notice(5, "10.2.0.0/24", RibType::Ospf, 0),
                ],
            )
            .await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
