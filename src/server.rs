use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use foundations::telemetry::log;
use ipnet::IpNet;
use tokio::sync::{mpsc, oneshot};

use crate::config::{Config, Endpoint};
use crate::error::{Error, Result};
use crate::interface::{Interface, IFF_RUNNING, IFF_UP};
use crate::kernel::{AddrEvent, FibHandler, IfEvent, NoopFib, RouteEvent};
use crate::message::{
    frame, Command, InterfaceAddressUpdateBody, InterfaceUpdateBody, RouterIdUpdateBody,
};
use crate::nexthop::Nexthop;
use crate::redistribute::Redistributor;
use crate::rib::{ClientId, Rib, RibNotice, RibSrc, RibType};
use crate::show::{if_rows, route_rows, IfRow, RouteFilter, RouteRow};
use crate::vrf::{Vrf, VrfRegistry};
use crate::zapi::{zserver_start, AlwaysReachable, ClientTable, NexthopLookup};

/// Observer for table events, injected at construction.
pub trait EventHooks: Send + Sync {
    fn interface_added(&self, vrf_id: u32, iface: &Interface) {
        let _ = (vrf_id, iface);
    }
    fn address_added(&self, vrf_id: u32, ifindex: u32, prefix: IpNet) {
        let _ = (vrf_id, ifindex, prefix);
    }
    /// Leave a departing client's routes in place instead of purging them.
    fn preserve_on_disconnect(&self, client: ClientId) -> bool {
        let _ = client;
        false
    }
}

pub struct NoopHooks;

impl EventHooks for NoopHooks {}

/// Shared daemon state. Protocol connections, the kernel mirror and the
/// admin API all hang off one `Arc<Server>`.
pub struct Server {
    pub config: Config,
    pub clients: ClientTable,
    pub redist: Redistributor,
    pub fib: Arc<dyn FibHandler>,
    pub nexthop_hook: Arc<dyn NexthopLookup>,
    pub hooks: Arc<dyn EventHooks>,
    pub vrfs: VrfRegistry,
}

impl Server {
    pub fn new(config: Config) -> Arc<Server> {
        Server::with_handlers(
            config,
            Arc::new(NoopFib),
            Arc::new(AlwaysReachable),
            Arc::new(NoopHooks),
        )
    }

    pub fn with_handlers(
        config: Config,
        fib: Arc<dyn FibHandler>,
        nexthop_hook: Arc<dyn NexthopLookup>,
        hooks: Arc<dyn EventHooks>,
    ) -> Arc<Server> {
        Arc::new(Server {
            vrfs: VrfRegistry::new(fib.clone(), config.add_path_default),
            clients: ClientTable::default(),
            redist: Redistributor::default(),
            fib,
            nexthop_hook,
            hooks,
            config,
        })
    }

    pub async fn deliver(&self, notices: &[RibNotice]) {
        if notices.is_empty() {
            return;
        }
        self.redist.deliver(&self.clients, notices).await;
    }

    /// Tenant by id, created on demand with a conventional name. Unknown
    /// tenants referenced by route updates come into being this way.
    pub async fn vrf_get_or_create(self: &Arc<Self>, id: u32) -> Result<Arc<Vrf>> {
        if let Some(vrf) = self.vrfs.lookup(id) {
            return Ok(vrf);
        }
        self.vrf_add(&format!("vrf{}", id), Some(id)).await
    }

    /// Boxed future: a connection task can auto-create a tenant, which
    /// starts a listener that spawns further connection tasks, and the
    /// recursion has to be cut here for `Send` inference to terminate.
    pub fn vrf_add<'a>(
        self: &'a Arc<Self>,
        name: &'a str,
        id: Option<u32>,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<Vrf>>> + Send + 'a>> {
        Box::pin(async move {
            let vrf = self.vrfs.add(name, id)?;
            log::info!("VRF {} created with id {}", vrf.name, vrf.id);
            if self.config.per_vrf_listen {
                let path = self
                    .config
                    .vrf_socket_dir
                    .join(format!("zserv-vrf{}.api", vrf.id));
                match zserver_start(self.clone(), Endpoint::Unix(path), vrf.id).await {
                    Ok(zserver) => *vrf.zserver.lock() = Some(zserver),
                    Err(e) => log::warn!("per-VRF listener for {} failed: {}", vrf.name, e),
                }
            }
            Ok(vrf)
        })
    }

    pub fn vrf_delete(&self, name: &str) -> Result<()> {
        let vrf = self.vrfs.delete(name)?;
        if let Some(zserver) = vrf.zserver.lock().take() {
            zserver.stop();
        }
        log::info!("VRF {} removed", name);
        Ok(())
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Administrative operations, executed strictly in submission order by the
/// dispatcher task.
pub enum ApiRequest {
    VrfAdd {
        name: String,
        id: Option<u32>,
        reply: Reply<u32>,
    },
    VrfDelete {
        name: String,
        reply: Reply<()>,
    },
    StaticAdd {
        vrf: String,
        prefix: IpNet,
        nexthop: Nexthop,
        distance: u8,
        reply: Reply<()>,
    },
    StaticDelete {
        vrf: String,
        prefix: IpNet,
        nexthop: Nexthop,
        reply: Reply<()>,
    },
    AddrAdd {
        vrf: String,
        ifname: String,
        prefix: IpNet,
        reply: Reply<()>,
    },
    AddrDelete {
        vrf: String,
        ifname: String,
        prefix: IpNet,
        reply: Reply<()>,
    },
    IfUp {
        vrf: String,
        ifname: String,
        reply: Reply<()>,
    },
    IfDown {
        vrf: String,
        ifname: String,
        reply: Reply<()>,
    },
    IfMtu {
        vrf: String,
        ifname: String,
        mtu: u32,
        reply: Reply<()>,
    },
    IfDesc {
        vrf: String,
        ifname: String,
        desc: String,
        reply: Reply<()>,
    },
    RouterIdSet {
        vrf: String,
        addr: Ipv4Addr,
        reply: Reply<()>,
    },
    RouterIdUnset {
        vrf: String,
        reply: Reply<()>,
    },
    InterfaceWait {
        name: String,
        reply: Reply<()>,
    },
    WatchExpire {
        token: u64,
    },
    ShowRoutes {
        vrf: Option<String>,
        filter: RouteFilter,
        reply: Reply<Vec<RouteRow>>,
    },
    ShowInterfaces {
        vrf: Option<String>,
        reply: Reply<Vec<IfRow>>,
    },
}

/// Cloneable handle to the dispatcher.
#[derive(Clone)]
pub struct RibApi {
    tx: mpsc::Sender<ApiRequest>,
}

impl RibApi {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> ApiRequest,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await?
    }

    pub async fn vrf_add(&self, name: &str, id: Option<u32>) -> Result<u32> {
        self.request(|reply| ApiRequest::VrfAdd {
            name: name.to_string(),
            id,
            reply,
        })
        .await
    }

    pub async fn vrf_delete(&self, name: &str) -> Result<()> {
        self.request(|reply| ApiRequest::VrfDelete {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn static_add(
        &self,
        vrf: &str,
        prefix: IpNet,
        nexthop: Nexthop,
        distance: u8,
    ) -> Result<()> {
        self.request(|reply| ApiRequest::StaticAdd {
            vrf: vrf.to_string(),
            prefix,
            nexthop,
            distance,
            reply,
        })
        .await
    }

    pub async fn static_delete(&self, vrf: &str, prefix: IpNet, nexthop: Nexthop) -> Result<()> {
        self.request(|reply| ApiRequest::StaticDelete {
            vrf: vrf.to_string(),
            prefix,
            nexthop,
            reply,
        })
        .await
    }

    pub async fn addr_add(&self, vrf: &str, ifname: &str, prefix: IpNet) -> Result<()> {
        self.request(|reply| ApiRequest::AddrAdd {
            vrf: vrf.to_string(),
            ifname: ifname.to_string(),
            prefix,
            reply,
        })
        .await
    }

    pub async fn addr_delete(&self, vrf: &str, ifname: &str, prefix: IpNet) -> Result<()> {
        self.request(|reply| ApiRequest::AddrDelete {
            vrf: vrf.to_string(),
            ifname: ifname.to_string(),
            prefix,
            reply,
        })
        .await
    }

    pub async fn if_up(&self, vrf: &str, ifname: &str) -> Result<()> {
        self.request(|reply| ApiRequest::IfUp {
            vrf: vrf.to_string(),
            ifname: ifname.to_string(),
            reply,
        })
        .await
    }

    pub async fn if_down(&self, vrf: &str, ifname: &str) -> Result<()> {
        self.request(|reply| ApiRequest::IfDown {
            vrf: vrf.to_string(),
            ifname: ifname.to_string(),
            reply,
        })
        .await
    }

    pub async fn if_mtu(&self, vrf: &str, ifname: &str, mtu: u32) -> Result<()> {
        self.request(|reply| ApiRequest::IfMtu {
            vrf: vrf.to_string(),
            ifname: ifname.to_string(),
            mtu,
            reply,
        })
        .await
    }

    pub async fn if_desc(&self, vrf: &str, ifname: &str, desc: &str) -> Result<()> {
        self.request(|reply| ApiRequest::IfDesc {
            vrf: vrf.to_string(),
            ifname: ifname.to_string(),
            desc: desc.to_string(),
            reply,
        })
        .await
    }

    pub async fn router_id_set(&self, vrf: &str, addr: Ipv4Addr) -> Result<()> {
        self.request(|reply| ApiRequest::RouterIdSet {
            vrf: vrf.to_string(),
            addr,
            reply,
        })
        .await
    }

    pub async fn router_id_unset(&self, vrf: &str) -> Result<()> {
        self.request(|reply| ApiRequest::RouterIdUnset {
            vrf: vrf.to_string(),
            reply,
        })
        .await
    }

    /// Resolves when a matching interface shows up, or errs out after the
    /// watch window.
    pub async fn wait_interface(&self, name: &str) -> Result<()> {
        self.request(|reply| ApiRequest::InterfaceWait {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn show_routes(
        &self,
        vrf: Option<&str>,
        filter: RouteFilter,
    ) -> Result<Vec<RouteRow>> {
        self.request(|reply| ApiRequest::ShowRoutes {
            vrf: vrf.map(str::to_string),
            filter,
            reply,
        })
        .await
    }

    pub async fn show_interfaces(&self, vrf: Option<&str>) -> Result<Vec<IfRow>> {
        self.request(|reply| ApiRequest::ShowInterfaces {
            vrf: vrf.map(str::to_string),
            reply,
        })
        .await
    }
}

/// Inbound ends of the kernel mirror.
pub struct KernelChannels {
    pub if_tx: mpsc::Sender<IfEvent>,
    pub addr_tx: mpsc::Sender<AddrEvent>,
    pub route_tx: mpsc::Sender<RouteEvent>,
}

const WATCH_WINDOW: Duration = Duration::from_secs(5);

struct IfWatch {
    token: u64,
    name: String,
    reply: Reply<()>,
}

struct Dispatcher {
    srv: Arc<Server>,
    api_tx: mpsc::Sender<ApiRequest>,
    watches: Vec<IfWatch>,
    next_token: u64,
}

/// Starts the single dispatcher task multiplexing admin requests and kernel
/// events, and hands back the channels feeding it.
pub fn spawn_dispatcher(srv: Arc<Server>) -> (RibApi, KernelChannels) {
    let (api_tx, mut api_rx) = mpsc::channel(64);
    let (if_tx, mut if_rx) = mpsc::channel(256);
    let (addr_tx, mut addr_rx) = mpsc::channel(256);
    let (route_tx, mut route_rx) = mpsc::channel(1024);

    let mut dispatcher = Dispatcher {
        srv,
        api_tx: api_tx.clone(),
        watches: Vec::new(),
        next_token: 0,
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(req) = api_rx.recv() => dispatcher.handle_api(req).await,
                Some(ev) = if_rx.recv() => dispatcher.handle_if_event(ev).await,
                Some(ev) = addr_rx.recv() => dispatcher.handle_addr_event(ev).await,
                Some(ev) = route_rx.recv() => dispatcher.handle_route_event(ev).await,
                else => break,
            }
        }
    });

    (
        RibApi { tx: api_tx },
        KernelChannels {
            if_tx,
            addr_tx,
            route_tx,
        },
    )
}

/// Kernel routing table to tenant mapping. The main table belongs to the
/// default tenant; others are tenant-numbered.
fn table_vrf(table: u32) -> u32 {
    match table {
        0 | 254 => 0,
        t => t,
    }
}

const RT_TABLE_LOCAL: u32 = 255;

impl Dispatcher {
    async fn handle_api(&mut self, req: ApiRequest) {
        match req {
            ApiRequest::VrfAdd { name, id, reply } => {
                let res = self.srv.vrf_add(&name, id).await.map(|vrf| vrf.id);
                let _ = reply.send(res);
            }
            ApiRequest::VrfDelete { name, reply } => {
                let _ = reply.send(self.srv.vrf_delete(&name));
            }
            ApiRequest::StaticAdd {
                vrf,
                prefix,
                nexthop,
                distance,
                reply,
            } => {
                let res = match self.lookup_vrf(&vrf) {
                    Ok(vrf) => match vrf.static_add(prefix, nexthop, distance) {
                        Ok(notices) => {
                            self.srv.deliver(&notices).await;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                };
                let _ = reply.send(res);
            }
            ApiRequest::StaticDelete {
                vrf,
                prefix,
                nexthop,
                reply,
            } => {
                let res = match self.lookup_vrf(&vrf) {
                    Ok(vrf) => match vrf.static_delete(prefix, &nexthop) {
                        Ok(notices) => {
                            self.srv.deliver(&notices).await;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                };
                let _ = reply.send(res);
            }
            ApiRequest::AddrAdd {
                vrf,
                ifname,
                prefix,
                reply,
            } => {
                let _ = reply.send(self.admin_addr(&vrf, &ifname, prefix, false).await);
            }
            ApiRequest::AddrDelete {
                vrf,
                ifname,
                prefix,
                reply,
            } => {
                let _ = reply.send(self.admin_addr(&vrf, &ifname, prefix, true).await);
            }
            ApiRequest::IfUp { vrf, ifname, reply } => {
                let _ = reply
                    .send(self.admin_flags(&vrf, &ifname, |f| f | IFF_UP | IFF_RUNNING).await);
            }
            ApiRequest::IfDown { vrf, ifname, reply } => {
                let _ = reply
                    .send(self.admin_flags(&vrf, &ifname, |f| f & !(IFF_UP | IFF_RUNNING)).await);
            }
            ApiRequest::IfMtu {
                vrf,
                ifname,
                mtu,
                reply,
            } => {
                let res = match self.lookup_iface_event(&vrf, &ifname) {
                    Ok(mut ev) => {
                        ev.mtu = mtu;
                        self.handle_if_event(ev).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(res);
            }
            ApiRequest::IfDesc {
                vrf,
                ifname,
                desc,
                reply,
            } => {
                let res = self.lookup_vrf(&vrf).and_then(|vrf| {
                    let mut tables = vrf.tables.lock();
                    let iface = tables
                        .ifaces
                        .get_by_name_mut(&ifname)
                        .ok_or_else(|| Error::NoSuchInterface(ifname.clone()))?;
                    iface.desc = Some(desc);
                    Ok(())
                });
                let _ = reply.send(res);
            }
            ApiRequest::RouterIdSet { vrf, addr, reply } => {
                let res = match self.lookup_vrf(&vrf) {
                    Ok(vrf) => {
                        vrf.tables.lock().router_id.set(addr);
                        self.elect_and_push(&vrf).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(res);
            }
            ApiRequest::RouterIdUnset { vrf, reply } => {
                let res = match self.lookup_vrf(&vrf) {
                    Ok(vrf) => {
                        vrf.tables.lock().router_id.unset();
                        self.elect_and_push(&vrf).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(res);
            }
            ApiRequest::InterfaceWait { name, reply } => {
                let present = self
                    .srv
                    .vrfs
                    .all()
                    .iter()
                    .any(|vrf| vrf.tables.lock().ifaces.get_by_name(&name).is_some());
                if present {
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.next_token += 1;
                let token = self.next_token;
                self.watches.push(IfWatch {
                    token,
                    name,
                    reply,
                });
                let api_tx = self.api_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(WATCH_WINDOW).await;
                    let _ = api_tx.send(ApiRequest::WatchExpire { token }).await;
                });
            }
            ApiRequest::WatchExpire { token } => {
                if let Some(pos) = self.watches.iter().position(|w| w.token == token) {
                    let watch = self.watches.remove(pos);
                    let _ = watch.reply.send(Err(Error::WatchTimeout(watch.name)));
                }
            }
            ApiRequest::ShowRoutes { vrf, filter, reply } => {
                let res = self.collect(vrf, |v| route_rows(v, filter));
                let _ = reply.send(res);
            }
            ApiRequest::ShowInterfaces { vrf, reply } => {
                let res = self.collect(vrf, if_rows);
                let _ = reply.send(res);
            }
        }
    }

    fn lookup_vrf(&self, name: &str) -> Result<Arc<Vrf>> {
        self.srv
            .vrfs
            .lookup_by_name(name)
            .ok_or_else(|| Error::NoSuchVrf(name.to_string()))
    }

    fn collect<T>(&self, vrf: Option<String>, f: impl Fn(&Vrf) -> Vec<T>) -> Result<Vec<T>> {
        match vrf {
            Some(name) => {
                let vrf = self.lookup_vrf(&name)?;
                Ok(f(&vrf))
            }
            None => Ok(self.srv.vrfs.all().iter().flat_map(|v| f(v)).collect()),
        }
    }

    /// Synthesizes a link event from the current interface state, so admin
    /// changes flow through the same path as kernel ones.
    fn lookup_iface_event(&self, vrf: &str, ifname: &str) -> Result<IfEvent> {
        let vrf = self.lookup_vrf(vrf)?;
        let tables = vrf.tables.lock();
        let iface = tables
            .ifaces
            .get_by_name(ifname)
            .ok_or_else(|| Error::NoSuchInterface(ifname.to_string()))?;
        Ok(IfEvent {
            delete: false,
            name: iface.name.clone(),
            index: iface.index,
            vrf_id: vrf.id,
            flags: iface.flags,
            mtu: iface.mtu,
            metric: iface.metric,
            hw_addr: iface.hw_addr.clone(),
            master: iface.master,
        })
    }

    async fn admin_flags(
        &mut self,
        vrf: &str,
        ifname: &str,
        f: impl FnOnce(u32) -> u32,
    ) -> Result<()> {
        let mut ev = self.lookup_iface_event(vrf, ifname)?;
        ev.flags = f(ev.flags);
        self.handle_if_event(ev).await;
        Ok(())
    }

    async fn admin_addr(
        &mut self,
        vrf: &str,
        ifname: &str,
        prefix: IpNet,
        delete: bool,
    ) -> Result<()> {
        let vrf = self.lookup_vrf(vrf)?;
        let ifindex = {
            let tables = vrf.tables.lock();
            tables
                .ifaces
                .get_by_name(ifname)
                .ok_or_else(|| Error::NoSuchInterface(ifname.to_string()))?
                .index
        };
        self.handle_addr_event(AddrEvent {
            delete,
            ifindex,
            vrf_id: vrf.id,
            prefix,
            label: None,
        })
        .await;
        Ok(())
    }

    async fn handle_if_event(&mut self, ev: IfEvent) {
        let vrf = match self.srv.vrf_get_or_create(ev.vrf_id).await {
            Ok(vrf) => vrf,
            Err(e) => {
                log::warn!("interface event for unusable VRF {}: {}", ev.vrf_id, e);
                return;
            }
        };

        if ev.delete {
            let removed = vrf.tables.lock().ifaces.remove(ev.index);
            if let Some(iface) = removed {
                log::info!("interface {} removed", iface.name);
                let notices = self.connected_sync(&vrf, &iface, true);
                self.srv.deliver(&notices).await;
                self.notify_iface(&vrf, &iface, Command::InterfaceDelete).await;
                self.elect_and_push(&vrf).await;
            }
            return;
        }

        let (known, was_up, iface) = {
            let mut tables = vrf.tables.lock();
            let old = tables.ifaces.get(ev.index);
            let known = old.is_some();
            let was_up = old.map(Interface::is_up).unwrap_or(false);
            let mut iface = old.cloned().unwrap_or_default();
            iface.index = ev.index;
            iface.name = ev.name.clone();
            iface.vrf_id = ev.vrf_id;
            iface.flags = ev.flags;
            iface.mtu = ev.mtu;
            iface.metric = ev.metric;
            iface.hw_addr = ev.hw_addr.clone();
            iface.master = ev.master;
            tables.ifaces.insert(iface.clone());
            (known, was_up, iface)
        };

        let now_up = iface.is_up();
        if !known {
            log::info!("interface {} index {} added", iface.name, iface.index);
            self.srv.hooks.interface_added(vrf.id, &iface);
        }
        if was_up != now_up {
            let notices = self.connected_sync(&vrf, &iface, !now_up);
            self.srv.deliver(&notices).await;
        }

        let command = if !known {
            Command::InterfaceAdd
        } else if now_up && !was_up {
            Command::InterfaceUp
        } else if !now_up && was_up {
            Command::InterfaceDown
        } else {
            Command::InterfaceAdd
        };
        self.notify_iface(&vrf, &iface, command).await;
        self.complete_watches(&iface.name);
        self.elect_and_push(&vrf).await;
    }

    /// Adds or withdraws the connected routes for every address on an
    /// interface, with a resolution walk folded in by the tenant.
    fn connected_sync(&self, vrf: &Vrf, iface: &Interface, delete: bool) -> Vec<RibNotice> {
        let mut out = Vec::new();
        let template = Rib::with_nexthop(
            RibType::Connected,
            RibSrc::System,
            Nexthop::from_ifindex(iface.index),
        );
        for prefix in iface
            .addrs4
            .iter()
            .map(|a| IpNet::V4(a.prefix))
            .chain(iface.addrs6.iter().map(|a| IpNet::V6(a.prefix)))
        {
            if delete {
                out.extend(vrf.rib_delete(prefix, &template));
            } else {
                out.extend(vrf.rib_add(prefix, template.clone()));
            }
        }
        out
    }

    async fn handle_addr_event(&mut self, ev: AddrEvent) {
        let vrf = match self.srv.vrf_get_or_create(ev.vrf_id).await {
            Ok(vrf) => vrf,
            Err(e) => {
                log::warn!("address event for unusable VRF {}: {}", ev.vrf_id, e);
                return;
            }
        };

        let up = {
            let mut tables = vrf.tables.lock();
            let iface = match tables.ifaces.get_mut(ev.ifindex) {
                Some(iface) => iface,
                None => {
                    log::debug!("address event for unknown ifindex {}", ev.ifindex);
                    return;
                }
            };
            match ev.prefix {
                IpNet::V4(p) => {
                    if ev.delete {
                        iface.addrs4.retain(|a| a.prefix != p);
                    } else if !iface.addrs4.iter().any(|a| a.prefix == p) {
                        iface.addrs4.push(crate::interface::IfAddr {
                            prefix: p,
                            label: ev.label.clone(),
                        });
                    }
                }
                IpNet::V6(p) => {
                    if ev.delete {
                        iface.addrs6.retain(|a| a.prefix != p);
                    } else if !iface.addrs6.iter().any(|a| a.prefix == p) {
                        iface.addrs6.push(crate::interface::IfAddr {
                            prefix: p,
                            label: ev.label.clone(),
                        });
                    }
                }
            }
            iface.is_up()
        };

        if !ev.delete {
            self.srv.hooks.address_added(vrf.id, ev.ifindex, ev.prefix);
        }
        if up {
            let template = Rib::with_nexthop(
                RibType::Connected,
                RibSrc::System,
                Nexthop::from_ifindex(ev.ifindex),
            );
            let notices = if ev.delete {
                vrf.rib_delete(ev.prefix, &template)
            } else {
                vrf.rib_add(ev.prefix, template)
            };
            self.srv.deliver(&notices).await;
        }

        self.notify_addr(&vrf, &ev).await;
        self.elect_and_push(&vrf).await;
    }

    async fn handle_route_event(&mut self, ev: RouteEvent) {
        if ev.table == RT_TABLE_LOCAL || ev.discard() {
            return;
        }
        let vrf_id = table_vrf(ev.table);
        let vrf = match self.srv.vrf_get_or_create(vrf_id).await {
            Ok(vrf) => vrf,
            Err(e) => {
                log::warn!("route event for unusable table {}: {}", ev.table, e);
                return;
            }
        };
        let rib = ev.to_rib();
        let notices = if ev.delete {
            vrf.rib_delete(ev.prefix, &rib)
        } else {
            vrf.rib_add(ev.prefix, rib)
        };
        self.srv.deliver(&notices).await;
    }

    fn complete_watches(&mut self, name: &str) {
        let mut i = 0;
        while i < self.watches.len() {
            if self.watches[i].name == name {
                let watch = self.watches.remove(i);
                let _ = watch.reply.send(Ok(()));
            } else {
                i += 1;
            }
        }
    }

    async fn elect_and_push(&self, vrf: &Vrf) {
        let changed = {
            let mut tables = vrf.tables.lock();
            let crate::vrf::VrfTables {
                ifaces, router_id, ..
            } = &mut *tables;
            router_id.elect(ifaces)
        };
        let Some(addr) = changed else { return };
        log::info!("router id for VRF {} is now {}", vrf.name, addr);
        for client in self.srv.clients.all() {
            if !client.router_id_sub {
                continue;
            }
            if client.version == 2 && client.vrf_id != vrf.id {
                continue;
            }
            let mut body = BytesMut::new();
            RouterIdUpdateBody {
                addr: IpAddr::V4(addr),
                plen: 32,
            }
            .encode(&mut body);
            let buf = frame(
                client.version,
                vrf.id as u16,
                Command::RouterIdUpdate,
                &body,
            )
            .freeze();
            let _ = client.tx.send(buf).await;
        }
    }

    async fn notify_iface(&self, vrf: &Vrf, iface: &Interface, command: Command) {
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
        for client in self.srv.clients.all() {
            if !client.iface_sub {
                continue;
            }
            if client.version == 2 && client.vrf_id != vrf.id {
                continue;
            }
            let buf = frame(client.version, vrf.id as u16, command, &body).freeze();
            let _ = client.tx.send(buf).await;
        }
    }

    async fn notify_addr(&self, vrf: &Vrf, ev: &AddrEvent) {
        let command = if ev.delete {
            Command::InterfaceAddressDelete
        } else {
            Command::InterfaceAddressAdd
        };
        for client in self.srv.clients.all() {
            if !client.iface_sub {
                continue;
            }
            if client.version == 2 && client.vrf_id != vrf.id {
                continue;
            }
            let mut body = BytesMut::new();
            InterfaceAddressUpdateBody {
                index: ev.ifindex,
                flags: 0,
                prefix: ev.prefix,
            }
            .encode(&mut body);
            let buf = frame(client.version, vrf.id as u16, command, &body).freeze();
            let _ = client.tx.send(buf).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::IFF_LOOPBACK;
    use netlink_packet_route::route::RouteProtocol;

    fn setup() -> (Arc<Server>, RibApi, KernelChannels) {
        let config = Config {
            per_vrf_listen: false,
            ..Config::new()
        };
        let srv = Server::new(config);
        let (api, kernel) = spawn_dispatcher(srv.clone());
        (srv, api, kernel)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn link(name: &str, index: u32, flags: u32) -> IfEvent {
        IfEvent {
            delete: false,
            name: name.to_string(),
            index,
            vrf_id: 0,
            flags,
            mtu: 1500,
            metric: 1,
            hw_addr: vec![0, 1, 2, 3, 4, 5],
            master: 0,
        }
    }

    #[tokio::test]
    async fn vrf_add_and_delete_roundtrip() {
        let (srv, api, _kernel) = setup();
        let id = api.vrf_add("vrf7", None).await.unwrap();
        assert_eq!(id, 7);
        assert!(srv.vrfs.lookup_by_name("vrf7").is_some());
        api.vrf_delete("vrf7").await.unwrap();
        assert!(srv.vrfs.lookup_by_name("vrf7").is_none());
        assert!(matches!(
            api.vrf_delete("default").await,
            Err(Error::DefaultVrfImmutable)
        ));
    }

    #[tokio::test]
    async fn static_route_appears_in_dump() {
        let (_srv, api, _kernel) = setup();
        api.static_add(
            "default",
            "10.0.0.0/24".parse().unwrap(),
            Nexthop::from_ifindex(3),
            1,
        )
        .await
        .unwrap();
        let rows = api.show_routes(Some("default"), RouteFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].prefix, "10.0.0.0/24".parse::<IpNet>().unwrap());
        assert_eq!(rows[0].rib.rtype, RibType::Static);
        assert!(rows[0].rib.flags.selected());

        api.static_delete(
            "default",
            "10.0.0.0/24".parse().unwrap(),
            Nexthop::from_ifindex(3),
        )
        .await
        .unwrap();
        assert!(api.show_routes(Some("default"), RouteFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn address_on_up_interface_installs_connected_route() {
        let (_srv, api, kernel) = setup();
        kernel
            .if_tx
            .send(link("eth0", 2, IFF_UP | IFF_RUNNING))
            .await
            .unwrap();
        kernel
            .addr_tx
            .send(AddrEvent {
                delete: false,
                ifindex: 2,
                vrf_id: 0,
                prefix: "192.168.1.1/24".parse().unwrap(),
                label: None,
            })
            .await
            .unwrap();
        settle().await;

        let rows = api.show_routes(Some("default"), RouteFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rib.rtype, RibType::Connected);
        assert!(rows[0].rib.flags.selected());

        api.if_down("default", "eth0").await.unwrap();
        assert!(api.show_routes(Some("default"), RouteFilter::default()).await.unwrap().is_empty());

        api.if_up("default", "eth0").await.unwrap();
        assert_eq!(api.show_routes(Some("default"), RouteFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn kernel_route_event_populates_default_vrf() {
        let (_srv, api, kernel) = setup();
        kernel
            .route_tx
            .send(RouteEvent {
                delete: false,
                table: 254,
                prefix: "10.1.0.0/16".parse().unwrap(),
                nexthops: vec![Nexthop::from_addr("10.0.0.1".parse().unwrap())],
                metric: 0,
                protocol: RouteProtocol::from(3),
            })
            .await
            .unwrap();
        // Redirects never make it into the table.
        kernel
            .route_tx
            .send(RouteEvent {
                delete: false,
                table: 254,
                prefix: "10.2.0.0/16".parse().unwrap(),
                nexthops: vec![Nexthop::from_addr("10.0.0.1".parse().unwrap())],
                metric: 0,
                protocol: RouteProtocol::from(1),
            })
            .await
            .unwrap();
        settle().await;

        let rows = api.show_routes(None, RouteFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].prefix, "10.1.0.0/16".parse::<IpNet>().unwrap());
        assert_eq!(rows[0].rib.rtype, RibType::Kernel);
    }

    #[tokio::test]
    async fn route_event_in_foreign_table_creates_tenant() {
        let (srv, _api, kernel) = setup();
        kernel
            .route_tx
            .send(RouteEvent {
                delete: false,
                table: 11,
                prefix: "10.3.0.0/16".parse().unwrap(),
                nexthops: vec![Nexthop::from_ifindex(4)],
                metric: 0,
                protocol: RouteProtocol::from(3),
            })
            .await
            .unwrap();
        settle().await;

        let vrf = srv.vrfs.lookup(11).unwrap();
        assert_eq!(vrf.name, "vrf11");
        assert_eq!(vrf.routes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_interface_times_out() {
        let (_srv, api, _kernel) = setup();
        assert!(matches!(
            api.wait_interface("eth9").await,
            Err(Error::WatchTimeout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_interface_released_by_link_event() {
        let (_srv, api, kernel) = setup();
        let waiter = tokio::spawn({
            let api = api.clone();
            async move { api.wait_interface("eth1").await }
        });
        settle().await;
        kernel.if_tx.send(link("eth1", 5, IFF_UP)).await.unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn router_id_follows_loopback_address() {
        let (srv, api, kernel) = setup();
        kernel
            .if_tx
            .send(link("lo", 1, IFF_UP | IFF_RUNNING | IFF_LOOPBACK))
            .await
            .unwrap();
        kernel
            .addr_tx
            .send(AddrEvent {
                delete: false,
                ifindex: 1,
                vrf_id: 0,
                prefix: "1.2.3.4/32".parse().unwrap(),
                label: None,
            })
            .await
            .unwrap();
        settle().await;
        assert_eq!(
            srv.vrfs.default_vrf().tables.lock().router_id.current,
            "1.2.3.4".parse::<Ipv4Addr>().unwrap()
        );

        api.router_id_set("default", "9.9.9.9".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(
            srv.vrfs.default_vrf().tables.lock().router_id.current,
            "9.9.9.9".parse::<Ipv4Addr>().unwrap()
        );
    }
}
