use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use foundations::telemetry::log;
use futures::{SinkExt, StreamExt};
use octets::Octets;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::config::Endpoint;
use crate::connection::{Frame, ZapiCodec};
use crate::error::{Error, Result};
use crate::message::{
    frame, Command, HelloBody, InterfaceAddressUpdateBody, InterfaceUpdateBody,
    NexthopLookupBody, NexthopReplyBody, RedistributeBody, RouteType, RouteUpdateBody,
    RouterIdUpdateBody, ZapiHeader,
};
use crate::redistribute::sync_frames;
use crate::rib::{ClientId, Rib, RibSrc};
use crate::server::Server;
use crate::table::Afi;
use crate::vrf::Vrf;

/// Resolution hook consulted on nexthop lookup requests, so a policy layer
/// can veto reachability before the RIB answers.
pub trait NexthopLookup: Send + Sync {
    fn reachable(&self, vrf_id: u32, addr: IpAddr) -> bool;
}

pub struct AlwaysReachable;

impl NexthopLookup for AlwaysReachable {
    fn reachable(&self, _vrf_id: u32, _addr: IpAddr) -> bool {
        true
    }
}

/// Connected protocol daemon. `vrf_id` is the tenant the connection is
/// bound to (per-tenant listener), 0 on the shared socket.
#[derive(Clone)]
pub struct Client {
    pub id: ClientId,
    pub version: u8,
    pub vrf_id: u32,
    pub route_type: RouteType,
    pub router_id_sub: bool,
    pub iface_sub: bool,
    pub tx: mpsc::Sender<Bytes>,
}

#[derive(Default)]
pub struct ClientTable {
    clients: RwLock<HashMap<ClientId, Client>>,
    next: AtomicU64,
}

impl ClientTable {
    pub fn register(&self, tx: mpsc::Sender<Bytes>, vrf_id: u32) -> ClientId {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.clients.write().insert(
            id,
            Client {
                id,
                version: 2,
                vrf_id,
                route_type: RouteType::System,
                router_id_sub: false,
                iface_sub: false,
                tx,
            },
        );
        id
    }

    pub fn unregister(&self, id: ClientId) {
        self.clients.write().remove(&id);
    }

    pub fn get(&self, id: ClientId) -> Option<Client> {
        self.clients.read().get(&id).cloned()
    }

    pub fn update(&self, id: ClientId, f: impl FnOnce(&mut Client)) {
        if let Some(client) = self.clients.write().get_mut(&id) {
            f(client);
        }
    }

    pub fn all(&self) -> Vec<Client> {
        self.clients.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

/// Running protocol listener. Aborting drops the accept loop; any unix
/// socket path is unlinked.
pub struct ZServer {
    handle: JoinHandle<()>,
    path: Option<PathBuf>,
}

impl ZServer {
    pub fn stop(&self) {
        self.handle.abort();
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for ZServer {
    fn drop(&mut self) {
        self.stop();
    }
}

pub async fn zserver_start(
    srv: Arc<Server>,
    endpoint: Endpoint,
    vrf_bind: u32,
) -> Result<ZServer> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(addr).await?;
            log::info!("listening on {}", addr);
            let handle = tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            log::info!("client connected from {}", peer);
                            let srv = srv.clone();
                            tokio::spawn(serve_client(srv, stream, vrf_bind));
                        }
                        Err(e) => {
                            log::warn!("accept failed: {}", e);
                            break;
                        }
                    }
                }
            });
            Ok(ZServer { handle, path: None })
        }
        Endpoint::Unix(path) => unix_listen(srv, path, false, vrf_bind),
        Endpoint::UnixWritable(path) => unix_listen(srv, path, true, vrf_bind),
    }
}

fn unix_listen(srv: Arc<Server>, path: PathBuf, writable: bool, vrf_bind: u32) -> Result<ZServer> {
    use std::os::unix::fs::PermissionsExt;

    // Stale socket from a previous run.
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    if writable {
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777))?;
    }
    log::info!("listening on {}", path.display());
    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    log::info!("client connected");
                    let srv = srv.clone();
                    tokio::spawn(serve_client(srv, stream, vrf_bind));
                }
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    });
    Ok(ZServer {
        handle,
        path: Some(path),
    })
}

/// Per-connection loop: multiplexes the outbound queue with inbound
/// requests, and purges everything the client contributed on disconnect.
pub async fn serve_client<S>(srv: Arc<Server>, stream: S, vrf_bind: u32)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(64);
    let id = srv.clients.register(tx, vrf_bind);
    let mut framed = Framed::new(stream, ZapiCodec::new(srv.config.force_vrf));

    loop {
        tokio::select! {
            Some(buf) = rx.recv() => {
                if framed.send(buf).await.is_err() {
                    break;
                }
            }
            inbound = framed.next() => match inbound {
                Some(Ok(msg)) => {
                    if let Err(e) = handle_frame(&srv, id, msg).await {
                        log::warn!("client {} request failed: {}", id, e);
                        break;
                    }
                }
                Some(Err(e)) => {
                    log::warn!("client {} stream error: {}", id, e);
                    break;
                }
                None => break,
            }
        }
    }

    srv.redist.unsubscribe_all(id);
    if !srv.hooks.preserve_on_disconnect(id) {
        let notices = srv.vrfs.rib_clear_src(RibSrc::Client(id));
        srv.deliver(&notices).await;
    }
    srv.clients.unregister(id);
    log::info!("client {} disconnected", id);
}

/// Tenant a request applies to: the bound tenant when the connection has
/// one, otherwise the version 3 header field.
fn effective_vrf(client: &Client, header: &ZapiHeader) -> u32 {
    if client.vrf_id != 0 {
        client.vrf_id
    } else if header.version == 3 {
        header.vrf_id as u32
    } else {
        0
    }
}

async fn send_to(client: &Client, buf: Bytes) {
    if client.tx.send(buf).await.is_err() {
        log::debug!("send to client {} failed", client.id);
    }
}

async fn handle_frame(srv: &Arc<Server>, id: ClientId, msg: Frame) -> Result<()> {
    let header = msg.header;
    let command = Command::from_u16(header.command)?;
    let mut buf = Octets::with_slice(&msg.body);
    let client = srv.clients.get(id).ok_or(Error::ChannelClosed)?;

    match command {
        Command::Hello => {
            let hello = HelloBody::decode(&mut buf)?;
            srv.clients.update(id, |c| {
                c.version = header.version;
                c.route_type = hello.route_type;
            });
            log::info!(
                "client {} hello: {:?} version {}",
                id,
                hello.route_type,
                header.version
            );
        }
        Command::RouterIdAdd => {
            srv.clients.update(id, |c| c.router_id_sub = true);
            let vrf_id = effective_vrf(&client, &header);
            let vrf = srv
                .vrfs
                .lookup(vrf_id)
                .ok_or_else(|| Error::NoSuchVrf(vrf_id.to_string()))?;
            let current = vrf.tables.lock().router_id.current;
            let mut body = BytesMut::new();
            RouterIdUpdateBody {
                addr: IpAddr::V4(current),
                plen: 32,
            }
            .encode(&mut body);
            send_to(
                &client,
                frame(header.version, header.vrf_id, Command::RouterIdUpdate, &body).freeze(),
            )
            .await;
        }
        Command::RouterIdDelete => {
            srv.clients.update(id, |c| c.router_id_sub = false);
        }
        Command::InterfaceAdd => {
            srv.clients.update(id, |c| c.iface_sub = true);
            let vrf_id = effective_vrf(&client, &header);
            let vrf = srv
                .vrfs
                .lookup(vrf_id)
                .ok_or_else(|| Error::NoSuchVrf(vrf_id.to_string()))?;
            for buf in interface_snapshot(&vrf, header.version, header.vrf_id) {
                send_to(&client, buf).await;
            }
        }
        Command::InterfaceDelete => {
            srv.clients.update(id, |c| c.iface_sub = false);
        }
        Command::Ipv4RouteAdd => route_update(srv, &client, &header, &mut buf, Afi::Ip, false).await?,
        Command::Ipv4RouteDelete => route_update(srv, &client, &header, &mut buf, Afi::Ip, true).await?,
        Command::Ipv6RouteAdd => route_update(srv, &client, &header, &mut buf, Afi::Ip6, false).await?,
        Command::Ipv6RouteDelete => route_update(srv, &client, &header, &mut buf, Afi::Ip6, true).await?,
        Command::RedistributeAdd => redistribute(srv, &client, &header, &mut buf, true).await?,
        Command::RedistributeDelete => redistribute(srv, &client, &header, &mut buf, false).await?,
        Command::RedistributeDefaultAdd => {
            redistribute_default(srv, &client, &header, true).await
        }
        Command::RedistributeDefaultDelete => {
            redistribute_default(srv, &client, &header, false).await
        }
        Command::Ipv4NexthopLookup | Command::Ipv4ImportLookup => {
            nexthop_lookup(srv, &client, &header, &mut buf, Afi::Ip, command).await?
        }
        Command::Ipv6NexthopLookup | Command::Ipv6ImportLookup => {
            nexthop_lookup(srv, &client, &header, &mut buf, Afi::Ip6, command).await?
        }
        Command::InterfaceAddressAdd
        | Command::InterfaceAddressDelete
        | Command::InterfaceUp
        | Command::InterfaceDown
        | Command::InterfaceRename
        | Command::RouterIdUpdate => {
            // Server-to-client notifications; nothing to do inbound.
            log::debug!("ignoring client {} command {:?}", id, command);
        }
    }
    Ok(())
}

async fn route_update(
    srv: &Arc<Server>,
    client: &Client,
    header: &ZapiHeader,
    buf: &mut Octets<'_>,
    afi: Afi,
    delete: bool,
) -> Result<()> {
    let body = RouteUpdateBody::decode(buf, header.version, afi)?;
    let vrf_id = effective_vrf(client, header);
    if header.version == 3 && vrf_id == 0 && srv.config.default_vrf_protect {
        log::warn!(
            "dropping default VRF route update from client {}",
            client.id
        );
        return Ok(());
    }
    // An all-zero gateway with no interface is unusable.
    if let [nexthop] = body.nexthops.as_slice() {
        if nexthop.ifindex == 0 && nexthop.addr.map(|a| a.is_unspecified()).unwrap_or(false) {
            log::warn!("dropping zero-nexthop route from client {}", client.id);
            return Ok(());
        }
    }

    let vrf = srv.vrf_get_or_create(vrf_id).await?;
    let mut rib = Rib::new(body.rtype.to_rib_type(), RibSrc::Client(client.id));
    rib.nexthops = body.nexthops;
    if let Some(distance) = body.distance {
        rib.set_distance(distance);
    }
    if let Some(metric) = body.metric {
        rib.set_metric(metric);
    }
    if let Some(path_id) = body.path_id {
        rib.path_id = path_id;
    }
    rib.aux = body.aux;

    let notices = if delete {
        vrf.rib_delete(body.prefix, &rib)
    } else {
        vrf.rib_add(body.prefix, rib)
    };
    srv.deliver(&notices).await;
    Ok(())
}

async fn redistribute(
    srv: &Arc<Server>,
    client: &Client,
    header: &ZapiHeader,
    buf: &mut Octets<'_>,
    add: bool,
) -> Result<()> {
    let body = RedistributeBody::decode(buf)?;
    let rtype = body.route_type.to_rib_type();
    // Version 3 clients subscribe across tenants.
    let scope = if header.version == 3 {
        None
    } else {
        Some(effective_vrf(client, header))
    };
    let afis: Vec<Afi> = match body.route_type.determined_afi() {
        Some(afi) => vec![afi],
        None => client.route_type.interest_afis().to_vec(),
    };
    for &afi in &afis {
        if add {
            srv.redist.subscribe(client.id, scope, afi, rtype);
        } else {
            srv.redist.unsubscribe(client.id, scope, afi, rtype);
        }
    }
    if add {
        replay(srv, client, header, &afis, Some(rtype), false).await;
    }
    Ok(())
}

async fn redistribute_default(
    srv: &Arc<Server>,
    client: &Client,
    header: &ZapiHeader,
    add: bool,
) {
    let scope = if header.version == 3 {
        None
    } else {
        Some(effective_vrf(client, header))
    };
    let afis = client.route_type.interest_afis().to_vec();
    for &afi in &afis {
        if add {
            srv.redist.subscribe_default(client.id, scope, afi);
        } else {
            srv.redist.unsubscribe_default(client.id, scope, afi);
        }
    }
    if add {
        replay(srv, client, header, &afis, None, true).await;
    }
}

/// Replays the current redistribution set to a fresh subscriber.
async fn replay(
    srv: &Arc<Server>,
    client: &Client,
    header: &ZapiHeader,
    afis: &[Afi],
    rtype: Option<crate::rib::RibType>,
    default_only: bool,
) {
    let vrfs = if header.version == 3 {
        srv.vrfs.all()
    } else {
        srv.vrfs
            .lookup(effective_vrf(client, header))
            .into_iter()
            .collect()
    };
    for vrf in vrfs {
        let mut routes = vrf.selected_routes();
        routes.retain(|(_, rib)| rib.src != RibSrc::Client(client.id));
        for &afi in afis {
            for buf in sync_frames(&routes, vrf.id, afi, rtype, default_only, header.version) {
                send_to(client, buf).await;
            }
        }
    }
}

async fn nexthop_lookup(
    srv: &Arc<Server>,
    client: &Client,
    header: &ZapiHeader,
    buf: &mut Octets<'_>,
    afi: Afi,
    command: Command,
) -> Result<()> {
    let query = NexthopLookupBody::decode(buf, afi)?;
    let vrf_id = effective_vrf(client, header);
    let vrf = srv
        .vrfs
        .lookup(vrf_id)
        .ok_or_else(|| Error::NoSuchVrf(vrf_id.to_string()))?;

    let mut reply = NexthopReplyBody {
        addr: query.addr,
        metric: 0,
        nexthops: Vec::new(),
    };
    if srv.nexthop_hook.reachable(vrf_id, query.addr) {
        if let Some((_, rib)) = vrf.lookup_nexthop(query.addr) {
            reply.metric = rib.metric;
            reply.nexthops = rib.nexthops;
        }
    }
    let mut body = BytesMut::new();
    reply.encode(&mut body);
    send_to(
        client,
        frame(header.version, header.vrf_id, command, &body).freeze(),
    )
    .await;
    Ok(())
}

/// Interface table snapshot as a series of add messages, one per interface
/// followed by its addresses.
pub fn interface_snapshot(vrf: &Vrf, version: u8, vrf_wire: u16) -> Vec<Bytes> {
    let tables = vrf.tables.lock();
    let mut out = Vec::new();
    for iface in tables.ifaces.iter() {
        let mut body = BytesMut::new();
        InterfaceUpdateBody {
            name: iface.name.clone(),
            index: iface.index,
            status: u8::from(iface.is_up()),
            flags: iface.flags as u64,
            metric: iface.metric,
            mtu: iface.mtu,
            mtu6: iface.mtu,
            bandwidth: 0,
            hw_addr: iface.hw_addr.clone(),
        }
        .encode(&mut body);
        out.push(frame(version, vrf_wire, Command::InterfaceAdd, &body).freeze());

        for addr in &iface.addrs4 {
            let mut body = BytesMut::new();
            InterfaceAddressUpdateBody {
                index: iface.index,
                flags: 0,
                prefix: ipnet::IpNet::V4(addr.prefix),
            }
            .encode(&mut body);
            out.push(frame(version, vrf_wire, Command::InterfaceAddressAdd, &body).freeze());
        }
        for addr in &iface.addrs6 {
            let mut body = BytesMut::new();
            InterfaceAddressUpdateBody {
                index: iface.index,
                flags: 0,
                prefix: ipnet::IpNet::V6(addr.prefix),
            }
            .encode(&mut body);
            out.push(frame(version, vrf_wire, Command::InterfaceAddressAdd, &body).freeze());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::rib::RibType;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn test_server() -> Arc<Server> {
        let config = Config {
            per_vrf_listen: false,
            ..Config::new()
        };
        Server::new(config)
    }

    async fn spawn_conn(srv: &Arc<Server>) -> DuplexStream {
        spawn_conn_bound(srv, 0).await
    }

    async fn spawn_conn_bound(srv: &Arc<Server>, vrf_bind: u32) -> DuplexStream {
        let (ours, theirs) = duplex(16 * 1024);
        tokio::spawn(serve_client(srv.clone(), theirs, vrf_bind));
        ours
    }

    fn hello_frame(version: u8, route_type: RouteType) -> Bytes {
        let mut body = BytesMut::new();
        HelloBody { route_type }.encode(&mut body);
        frame(version, 0, Command::Hello, &body).freeze()
    }

    fn route_frame(
        version: u8,
        vrf_id: u16,
        command: Command,
        body: &RouteUpdateBody,
    ) -> Bytes {
        let mut raw = BytesMut::new();
        body.encode(version, &mut raw);
        frame(version, vrf_id, command, &raw).freeze()
    }

    async fn read_frame(stream: &mut DuplexStream) -> Frame {
        let mut codec = ZapiCodec::default();
        let mut buf = BytesMut::new();
        loop {
            use tokio_util::codec::Decoder;
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                return frame;
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed while waiting for a frame");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn settle() {
        // Let the connection task run.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn hello_registers_client_version_and_type() {
        let srv = test_server();
        let mut conn = spawn_conn(&srv).await;

        conn.write_all(&hello_frame(3, RouteType::Bgp)).await.unwrap();
        settle().await;

        let clients = srv.clients.all();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].version, 3);
        assert_eq!(clients[0].route_type, RouteType::Bgp);
    }

    #[tokio::test]
    async fn route_add_lands_in_rib_and_disconnect_purges() {
        let srv = test_server();
        let mut conn = spawn_conn(&srv).await;
        conn.write_all(&hello_frame(3, RouteType::Bgp)).await.unwrap();

        let mut body = RouteUpdateBody::new(
            RouteType::Bgp,
            "10.0.0.0/24".parse().unwrap(),
        );
        body.nexthops.push(crate::nexthop::Nexthop::from_ifindex(3));
        body.metric = Some(10);
        conn.write_all(&route_frame(3, 0, Command::Ipv4RouteAdd, &body))
            .await
            .unwrap();
        settle().await;

        let vrf = srv.vrfs.default_vrf();
        let routes = vrf.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].1.rtype, RibType::Bgp);
        assert_eq!(routes[0].1.metric, 10);
        assert!(routes[0].1.flags.selected());

        drop(conn);
        settle().await;
        assert!(srv.vrfs.default_vrf().routes().is_empty());
        assert!(srv.clients.is_empty());
    }

    #[tokio::test]
    async fn v3_route_to_unknown_vrf_creates_tenant() {
        let srv = test_server();
        let mut conn = spawn_conn(&srv).await;
        conn.write_all(&hello_frame(3, RouteType::Bgp)).await.unwrap();

        let mut body = RouteUpdateBody::new(
            RouteType::Bgp,
            "10.0.0.0/24".parse().unwrap(),
        );
        body.nexthops.push(crate::nexthop::Nexthop::from_ifindex(3));
        conn.write_all(&route_frame(3, 42, Command::Ipv4RouteAdd, &body))
            .await
            .unwrap();
        settle().await;

        let vrf = srv.vrfs.lookup(42).expect("tenant auto-created");
        assert_eq!(vrf.name, "vrf42");
        assert_eq!(vrf.routes().len(), 1);
    }

    #[tokio::test]
    async fn redistribution_reaches_second_client() {
        let srv = test_server();

        // Subscriber first, so fanout has somewhere to go.
        let mut sub = spawn_conn(&srv).await;
        sub.write_all(&hello_frame(3, RouteType::Ospf)).await.unwrap();
        let mut body = BytesMut::new();
        RedistributeBody {
            route_type: RouteType::Bgp,
        }
        .encode(&mut body);
        sub.write_all(&frame(3, 0, Command::RedistributeAdd, &body))
            .await
            .unwrap();
        settle().await;

        let mut publisher = spawn_conn(&srv).await;
        publisher
            .write_all(&hello_frame(3, RouteType::Bgp))
            .await
            .unwrap();
        // A route in tenant 0 stays internal. The subscriber only sees
        // the follow-up route landing in tenant 7.
        let mut hidden = RouteUpdateBody::new(
            RouteType::Bgp,
            "10.9.0.0/24".parse().unwrap(),
        );
        hidden.nexthops.push(crate::nexthop::Nexthop::from_ifindex(3));
        publisher
            .write_all(&route_frame(3, 0, Command::Ipv4RouteAdd, &hidden))
            .await
            .unwrap();

        let mut route = RouteUpdateBody::new(
            RouteType::Bgp,
            "10.0.0.0/24".parse().unwrap(),
        );
        route.nexthops.push(crate::nexthop::Nexthop::from_ifindex(3));
        publisher
            .write_all(&route_frame(3, 7, Command::Ipv4RouteAdd, &route))
            .await
            .unwrap();

        let received = read_frame(&mut sub).await;
        assert_eq!(
            Command::from_u16(received.header.command).unwrap(),
            Command::Ipv4RouteAdd
        );
        assert_eq!(received.header.vrf_id, 7);
        let mut octs = Octets::with_slice(&received.body);
        let decoded = RouteUpdateBody::decode(&mut octs, 3, Afi::Ip).unwrap();
        assert_eq!(decoded.prefix, "10.0.0.0/24".parse::<ipnet::IpNet>().unwrap());
        assert_eq!(decoded.rtype, RouteType::Bgp);
    }

    #[tokio::test]
    async fn v2_subscriber_skips_nonzero_metric() {
        let srv = test_server();

        // Version 2 scoping is per tenant, so bind the subscriber to the
        // tenant the publisher writes into.
        let mut sub = spawn_conn_bound(&srv, 5).await;
        sub.write_all(&hello_frame(2, RouteType::Rip)).await.unwrap();
        let mut body = BytesMut::new();
        RedistributeBody {
            route_type: RouteType::Bgp,
        }
        .encode(&mut body);
        sub.write_all(&frame(2, 0, Command::RedistributeAdd, &body))
            .await
            .unwrap();
        settle().await;

        let mut publisher = spawn_conn(&srv).await;
        publisher
            .write_all(&hello_frame(3, RouteType::Bgp))
            .await
            .unwrap();

        // Non-zero metric: must not reach the version 2 subscriber.
        let mut skipped = RouteUpdateBody::new(
            RouteType::Bgp,
            "10.0.0.0/24".parse().unwrap(),
        );
        skipped.nexthops.push(crate::nexthop::Nexthop::from_ifindex(3));
        skipped.metric = Some(10);
        publisher
            .write_all(&route_frame(3, 5, Command::Ipv4RouteAdd, &skipped))
            .await
            .unwrap();

        // Zero metric: delivered.
        let mut passed = RouteUpdateBody::new(
            RouteType::Bgp,
            "10.1.0.0/24".parse().unwrap(),
        );
        passed.nexthops.push(crate::nexthop::Nexthop::from_ifindex(3));
        publisher
            .write_all(&route_frame(3, 5, Command::Ipv4RouteAdd, &passed))
            .await
            .unwrap();

        let received = read_frame(&mut sub).await;
        let mut octs = Octets::with_slice(&received.body);
        let decoded = RouteUpdateBody::decode(&mut octs, 2, Afi::Ip).unwrap();
        assert_eq!(
            decoded.prefix,
            "10.1.0.0/24".parse::<ipnet::IpNet>().unwrap()
        );
    }

    #[tokio::test]
    async fn nexthop_lookup_answers_from_selected_routes() {
        let srv = test_server();
        let vrf = srv.vrfs.default_vrf();
        let notices = vrf.rib_add(
            "10.0.0.0/8".parse().unwrap(),
            {
                let mut rib = Rib::with_nexthop(
                    RibType::Kernel,
                    RibSrc::Kernel,
                    crate::nexthop::Nexthop::from_ifindex(2),
                );
                rib.metric = 7;
                rib
            },
        );
        assert!(!notices.is_empty());

        let mut conn = spawn_conn(&srv).await;
        conn.write_all(&hello_frame(3, RouteType::Bgp)).await.unwrap();
        let mut body = BytesMut::new();
        NexthopLookupBody {
            addr: "10.1.2.3".parse().unwrap(),
        }
        .encode(&mut body);
        conn.write_all(&frame(3, 0, Command::Ipv4NexthopLookup, &body))
            .await
            .unwrap();

        let received = read_frame(&mut conn).await;
        assert_eq!(
            Command::from_u16(received.header.command).unwrap(),
            Command::Ipv4NexthopLookup
        );
        let mut octs = Octets::with_slice(&received.body);
        let reply = NexthopReplyBody::decode(&mut octs, Afi::Ip).unwrap();
        assert_eq!(reply.addr, "10.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(reply.metric, 7);
        assert_eq!(reply.nexthops.len(), 1);
    }

    #[tokio::test]
    async fn default_vrf_protect_drops_v3_default_updates() {
        let config = Config {
            per_vrf_listen: false,
            default_vrf_protect: true,
            ..Config::new()
        };
        let srv = Server::new(config);
        let mut conn = spawn_conn(&srv).await;
        conn.write_all(&hello_frame(3, RouteType::Bgp)).await.unwrap();

        let mut body = RouteUpdateBody::new(
            RouteType::Bgp,
            "10.0.0.0/24".parse().unwrap(),
        );
        body.nexthops.push(crate::nexthop::Nexthop::from_ifindex(3));
        conn.write_all(&route_frame(3, 0, Command::Ipv4RouteAdd, &body))
            .await
            .unwrap();
        settle().await;

        assert!(srv.vrfs.default_vrf().routes().is_empty());

        // Other tenants are unaffected.
        conn.write_all(&route_frame(3, 5, Command::Ipv4RouteAdd, &body))
            .await
            .unwrap();
        settle().await;
        assert_eq!(srv.vrfs.lookup(5).unwrap().routes().len(), 1);
    }
}
