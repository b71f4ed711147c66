use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::{Mutex, RwLock};
use prefix_trie::PrefixMap;

use crate::error::{Error, Result};
use crate::interface::IfTable;
use crate::kernel::FibHandler;
use crate::nexthop::Nexthop;
use crate::rib::{
    rib_add_in, rib_clean_in, rib_delete_in, rib_walk_in, Rib, RibCtx, RibNotice, RibSrc,
    RibType,
};
use crate::router_id::RouterId;
use crate::static_route::StaticRoute;
use crate::table::{AfiPrefix, RibTable};
use crate::zapi::ZServer;

pub const VRF_ID_DEFAULT: u32 = 0;
pub const VRF_ID_MIN: u32 = 1;
pub const VRF_ID_MAX: u32 = 253;

/// All mutable routing state of one tenant, guarded as a unit so every
/// operation sees a consistent view across both address families.
#[derive(Default)]
pub struct VrfTables {
    pub rib4: RibTable<Ipv4Net>,
    pub rib6: RibTable<Ipv6Net>,
    pub static4: PrefixMap<Ipv4Net, StaticRoute>,
    pub static6: PrefixMap<Ipv6Net, StaticRoute>,
    pub ifaces: IfTable,
    pub router_id: RouterId,
}

pub struct Vrf {
    pub id: u32,
    pub name: String,
    add_path_default: bool,
    fib: Arc<dyn FibHandler>,
    pub tables: Mutex<VrfTables>,
    /// Dedicated protocol server for this tenant, when one is running.
    pub zserver: Mutex<Option<ZServer>>,
}

impl Vrf {
    fn new(id: u32, name: &str, fib: Arc<dyn FibHandler>, add_path_default: bool) -> Arc<Vrf> {
        Arc::new(Vrf {
            id,
            name: name.to_string(),
            add_path_default,
            fib,
            tables: Mutex::new(VrfTables::default()),
            zserver: Mutex::new(None),
        })
    }

    fn ctx(&self) -> RibCtx<'_> {
        RibCtx {
            vrf_id: self.id,
            add_path_default: self.add_path_default,
            fib: &*self.fib,
        }
    }

    /// Selection notices are returned rather than delivered, so callers can
    /// drop the tenant lock before fanning out to subscribers.
    pub fn rib_add(&self, prefix: IpNet, rib: Rib) -> Vec<RibNotice> {
        let mut out = Vec::new();
        let ctx = self.ctx();
        let mut tables = self.tables.lock();
        match prefix {
            IpNet::V4(p) => {
                rib_add_in(&mut tables.rib4, &ctx, p, rib, &mut out);
                rib_walk_in(&mut tables.rib4, &ctx, &mut out);
            }
            IpNet::V6(p) => {
                rib_add_in(&mut tables.rib6, &ctx, p, rib, &mut out);
                rib_walk_in(&mut tables.rib6, &ctx, &mut out);
            }
        }
        out
    }

    pub fn rib_delete(&self, prefix: IpNet, rib: &Rib) -> Vec<RibNotice> {
        let mut out = Vec::new();
        let ctx = self.ctx();
        let mut tables = self.tables.lock();
        match prefix {
            IpNet::V4(p) => {
                rib_delete_in(&mut tables.rib4, &ctx, p, rib, &mut out);
                rib_walk_in(&mut tables.rib4, &ctx, &mut out);
            }
            IpNet::V6(p) => {
                rib_delete_in(&mut tables.rib6, &ctx, p, rib, &mut out);
                rib_walk_in(&mut tables.rib6, &ctx, &mut out);
            }
        }
        out
    }

    pub fn rib_clean(&self, src: RibSrc) -> Vec<RibNotice> {
        let mut out = Vec::new();
        let ctx = self.ctx();
        let mut tables = self.tables.lock();
        rib_clean_in(&mut tables.rib4, &ctx, src, &mut out);
        rib_clean_in(&mut tables.rib6, &ctx, src, &mut out);
        out
    }

    pub fn rib_walk(&self) -> Vec<RibNotice> {
        let mut out = Vec::new();
        let ctx = self.ctx();
        let mut tables = self.tables.lock();
        rib_walk_in(&mut tables.rib4, &ctx, &mut out);
        rib_walk_in(&mut tables.rib6, &ctx, &mut out);
        out
    }

    pub fn static_add(
        &self,
        prefix: IpNet,
        nexthop: Nexthop,
        distance: u8,
    ) -> Result<Vec<RibNotice>> {
        let mut out = Vec::new();
        let ctx = self.ctx();
        let mut tables = self.tables.lock();
        match prefix {
            IpNet::V4(p) => {
                let VrfTables { rib4, static4, .. } = &mut *tables;
                static_add_in(rib4, static4, &ctx, p.trunc(), nexthop, distance, &mut out)?;
            }
            IpNet::V6(p) => {
                let VrfTables { rib6, static6, .. } = &mut *tables;
                static_add_in(rib6, static6, &ctx, p.trunc(), nexthop, distance, &mut out)?;
            }
        }
        Ok(out)
    }

    pub fn static_delete(&self, prefix: IpNet, nexthop: &Nexthop) -> Result<Vec<RibNotice>> {
        let mut out = Vec::new();
        let ctx = self.ctx();
        let mut tables = self.tables.lock();
        match prefix {
            IpNet::V4(p) => {
                let VrfTables { rib4, static4, .. } = &mut *tables;
                static_delete_in(rib4, static4, &ctx, p.trunc(), nexthop, &mut out)?;
            }
            IpNet::V6(p) => {
                let VrfTables { rib6, static6, .. } = &mut *tables;
                static_delete_in(rib6, static6, &ctx, p.trunc(), nexthop, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Every record in both families, for dump-style output.
    pub fn routes(&self) -> Vec<(IpNet, Rib)> {
        let tables = self.tables.lock();
        let mut out = Vec::new();
        for (p, ribs) in tables.rib4.iter() {
            for rib in ribs {
                out.push((p.to_ipnet(), rib.clone()));
            }
        }
        for (p, ribs) in tables.rib6.iter() {
            for rib in ribs {
                out.push((p.to_ipnet(), rib.clone()));
            }
        }
        out
    }

    /// Records that are both selected and installed, the redistribution set.
    pub fn selected_routes(&self) -> Vec<(IpNet, Rib)> {
        self.routes()
            .into_iter()
            .filter(|(_, rib)| rib.is_selected_fib())
            .collect()
    }

    /// Longest-prefix match over the selected routes of one family.
    pub fn lookup_nexthop(&self, addr: IpAddr) -> Option<(IpNet, Rib)> {
        let tables = self.tables.lock();
        match addr {
            IpAddr::V4(_) => {
                let host = <Ipv4Net as AfiPrefix>::host(addr)?;
                let (p, ribs) = tables.rib4.get_lpm(&host)?;
                let rib = ribs.iter().find(|r| r.flags.selected())?;
                Some((p.to_ipnet(), rib.clone()))
            }
            IpAddr::V6(_) => {
                let host = <Ipv6Net as AfiPrefix>::host(addr)?;
                let (p, ribs) = tables.rib6.get_lpm(&host)?;
                let rib = ribs.iter().find(|r| r.flags.selected())?;
                Some((p.to_ipnet(), rib.clone()))
            }
        }
    }
}

fn static_add_in<P: AfiPrefix>(
    table: &mut RibTable<P>,
    statics: &mut PrefixMap<P, StaticRoute>,
    ctx: &RibCtx<'_>,
    prefix: P,
    nexthop: Nexthop,
    distance: u8,
    out: &mut Vec<RibNotice>,
) -> Result<()> {
    let mut route = statics
        .remove(&prefix)
        .unwrap_or_else(|| StaticRoute::new(distance));
    if let Err(e) = route.add_nexthop(nexthop) {
        statics.insert(prefix, route);
        return Err(e);
    }
    route.distance = distance;
    let rib = route.to_rib();
    statics.insert(prefix, route);
    rib_add_in(table, ctx, prefix, rib, out);
    rib_walk_in(table, ctx, out);
    Ok(())
}

fn static_delete_in<P: AfiPrefix>(
    table: &mut RibTable<P>,
    statics: &mut PrefixMap<P, StaticRoute>,
    ctx: &RibCtx<'_>,
    prefix: P,
    nexthop: &Nexthop,
    out: &mut Vec<RibNotice>,
) -> Result<()> {
    let mut route = statics.remove(&prefix).ok_or(Error::NoSuchRoute)?;
    match route.del_nexthop(nexthop) {
        Err(e) => {
            statics.insert(prefix, route);
            Err(e)
        }
        Ok(true) => {
            let template = Rib::new(RibType::Static, RibSrc::Config);
            rib_delete_in(table, ctx, prefix, &template, out);
            rib_walk_in(table, ctx, out);
            Ok(())
        }
        Ok(false) => {
            let rib = route.to_rib();
            statics.insert(prefix, route);
            rib_add_in(table, ctx, prefix, rib, out);
            rib_walk_in(table, ctx, out);
            Ok(())
        }
    }
}

struct RegistryInner {
    by_id: HashMap<u32, Arc<Vrf>>,
    by_name: HashMap<String, Arc<Vrf>>,
}

/// Tenant registry. The default tenant (id 0) always exists and can not be
/// removed.
pub struct VrfRegistry {
    inner: RwLock<RegistryInner>,
    fib: Arc<dyn FibHandler>,
    add_path_default: bool,
}

/// Numeric id embedded in a conventional name such as `vrf10`.
fn name_to_id(name: &str) -> Option<u32> {
    name.strip_prefix("vrf").and_then(|rest| rest.parse().ok())
}

impl VrfRegistry {
    pub fn new(fib: Arc<dyn FibHandler>, add_path_default: bool) -> VrfRegistry {
        let default = Vrf::new(VRF_ID_DEFAULT, "default", fib.clone(), add_path_default);
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        by_id.insert(VRF_ID_DEFAULT, default.clone());
        by_name.insert("default".to_string(), default);
        VrfRegistry {
            inner: RwLock::new(RegistryInner { by_id, by_name }),
            fib,
            add_path_default,
        }
    }

    pub fn lookup(&self, id: u32) -> Option<Arc<Vrf>> {
        self.inner.read().by_id.get(&id).cloned()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<Vrf>> {
        self.inner.read().by_name.get(name).cloned()
    }

    pub fn default_vrf(&self) -> Arc<Vrf> {
        // Inserted at construction, never removed.
        self.inner.read().by_id[&VRF_ID_DEFAULT].clone()
    }

    pub fn all(&self) -> Vec<Arc<Vrf>> {
        let mut vrfs: Vec<_> = self.inner.read().by_id.values().cloned().collect();
        vrfs.sort_by_key(|v| v.id);
        vrfs
    }

    /// Creates a tenant. Without an explicit id, one embedded in the name is
    /// honored, otherwise the 101-253 range is scanned before 1-100.
    pub fn add(&self, name: &str, id: Option<u32>) -> Result<Arc<Vrf>> {
        let mut inner = self.inner.write();
        if inner.by_name.contains_key(name) {
            return Err(Error::VrfExists(name.to_string()));
        }
        let id = match id {
            Some(id) => {
                if !(VRF_ID_MIN..=VRF_ID_MAX).contains(&id) {
                    return Err(Error::VrfIdOutOfRange(id));
                }
                if let Some(holder) = inner.by_id.get(&id) {
                    return Err(Error::VrfExists(holder.name.clone()));
                }
                id
            }
            None => {
                let named = name_to_id(name)
                    .filter(|id| (VRF_ID_MIN..=VRF_ID_MAX).contains(id))
                    .filter(|id| !inner.by_id.contains_key(id));
                match named {
                    Some(id) => id,
                    None => (101..=VRF_ID_MAX)
                        .chain(VRF_ID_MIN..=100)
                        .find(|id| !inner.by_id.contains_key(id))
                        .ok_or(Error::VrfIdExhausted)?,
                }
            }
        };
        let vrf = Vrf::new(id, name, self.fib.clone(), self.add_path_default);
        inner.by_id.insert(id, vrf.clone());
        inner.by_name.insert(name.to_string(), vrf.clone());
        Ok(vrf)
    }

    /// Removes a tenant and hands it back so the caller can stop its
    /// protocol server outside the registry lock.
    pub fn delete(&self, name: &str) -> Result<Arc<Vrf>> {
        let mut inner = self.inner.write();
        let vrf = inner
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NoSuchVrf(name.to_string()))?;
        if vrf.id == VRF_ID_DEFAULT {
            return Err(Error::DefaultVrfImmutable);
        }
        inner.by_name.remove(name);
        inner.by_id.remove(&vrf.id);
        Ok(vrf)
    }

    /// Purges one source from every tenant, as on client disconnect.
    pub fn rib_clear_src(&self, src: RibSrc) -> Vec<RibNotice> {
        let mut out = Vec::new();
        for vrf in self.all() {
            out.extend(vrf.rib_clean(src));
        }
        out
    }
}
