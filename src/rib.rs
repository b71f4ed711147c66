use ipnet::IpNet;

use crate::kernel::FibHandler;
use crate::nexthop::Nexthop;
use crate::table::{AfiPrefix, RibTable};

pub const DISTANCE_KERNEL: u8 = 0;
pub const DISTANCE_CONNECTED: u8 = 0;
pub const DISTANCE_STATIC: u8 = 1;
pub const DISTANCE_RIP: u8 = 120;
pub const DISTANCE_OSPF: u8 = 110;
pub const DISTANCE_ISIS: u8 = 115;
pub const DISTANCE_EBGP: u8 = 20;
pub const DISTANCE_IBGP: u8 = 200;

/// Identity of whoever contributed a route. Client routes are purged in
/// bulk when their connection goes away.
pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RibSrc {
    Kernel,
    System,
    Config,
    Client(ClientId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RibType {
    Kernel,
    Connected,
    Static,
    Rip,
    Ospf,
    Isis,
    Bgp,
}

impl RibType {
    pub fn code(&self) -> char {
        match self {
            RibType::Kernel => 'K',
            RibType::Connected => 'C',
            RibType::Static => 'S',
            RibType::Rip => 'R',
            RibType::Ospf => 'O',
            RibType::Isis => 'I',
            RibType::Bgp => 'B',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RibSubType {
    #[default]
    None,
    OspfIa,
    OspfNssa1,
    OspfNssa2,
    OspfExternal1,
    OspfExternal2,
    BgpIbgp,
    BgpEbgp,
    IsisLevel1,
    IsisLevel2,
}

pub fn default_distance(rtype: RibType, subtype: RibSubType) -> u8 {
    if rtype == RibType::Bgp && subtype == RibSubType::BgpEbgp {
        return DISTANCE_EBGP;
    }
    match rtype {
        RibType::Kernel => DISTANCE_KERNEL,
        RibType::Connected => DISTANCE_CONNECTED,
        RibType::Static => DISTANCE_STATIC,
        RibType::Rip => DISTANCE_RIP,
        RibType::Ospf => DISTANCE_OSPF,
        RibType::Isis => DISTANCE_ISIS,
        RibType::Bgp => DISTANCE_IBGP,
    }
}

const FLAG_SELECTED: u8 = 1 << 0;
const FLAG_FIB: u8 = 1 << 1;
const FLAG_DISTANCE: u8 = 1 << 2;
const FLAG_METRIC: u8 = 1 << 3;
const FLAG_RESOLVED: u8 = 1 << 4;

/// Route state bits, mutated only by the RIB engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RibFlags(u8);

impl RibFlags {
    fn get(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    fn set(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn selected(&self) -> bool {
        self.get(FLAG_SELECTED)
    }

    pub fn set_selected(&mut self, on: bool) {
        self.set(FLAG_SELECTED, on)
    }

    pub fn fib(&self) -> bool {
        self.get(FLAG_FIB)
    }

    pub fn set_fib(&mut self, on: bool) {
        self.set(FLAG_FIB, on)
    }

    pub fn resolved(&self) -> bool {
        self.get(FLAG_RESOLVED)
    }

    pub fn set_resolved(&mut self, on: bool) {
        self.set(FLAG_RESOLVED, on)
    }

    pub fn has_distance(&self) -> bool {
        self.get(FLAG_DISTANCE)
    }

    pub fn set_has_distance(&mut self, on: bool) {
        self.set(FLAG_DISTANCE, on)
    }

    pub fn has_metric(&self) -> bool {
        self.get(FLAG_METRIC)
    }

    pub fn set_has_metric(&mut self, on: bool) {
        self.set(FLAG_METRIC, on)
    }
}

/// One route record at a prefix. At most one record per (type, source) is
/// authoritative; the type-specific `equal` rule decides replacement.
#[derive(Debug, Clone, PartialEq)]
pub struct Rib {
    pub rtype: RibType,
    pub subtype: RibSubType,
    pub distance: u8,
    pub metric: u32,
    pub path_id: u32,
    pub flags: RibFlags,
    pub nexthops: Vec<Nexthop>,
    pub src: RibSrc,
    pub aux: Vec<u8>,
}

impl Rib {
    pub fn new(rtype: RibType, src: RibSrc) -> Rib {
        Rib {
            rtype,
            subtype: RibSubType::default(),
            distance: default_distance(rtype, RibSubType::default()),
            metric: 0,
            path_id: 0,
            flags: RibFlags::default(),
            nexthops: Vec::new(),
            src,
            aux: Vec::new(),
        }
    }

    pub fn with_nexthop(rtype: RibType, src: RibSrc, nexthop: Nexthop) -> Rib {
        let mut rib = Rib::new(rtype, src);
        rib.nexthops.push(nexthop);
        rib
    }

    /// Explicit administrative distance, overriding the per-type default.
    pub fn set_distance(&mut self, distance: u8) {
        self.distance = distance;
        self.flags.set_has_distance(true);
    }

    pub fn set_metric(&mut self, metric: u32) {
        self.metric = metric;
        self.flags.set_has_metric(true);
    }

    /// Kernel and connected routes are kernel-authoritative; they are never
    /// pushed back to the FIB.
    pub fn is_system(&self) -> bool {
        matches!(self.rtype, RibType::Kernel | RibType::Connected)
    }

    pub fn is_selected_fib(&self) -> bool {
        self.flags.selected() && self.flags.fib()
    }

    /// Type-specific equality used for replacement and deletion. Connected
    /// routes match per source and nexthop, BGP per source and path id,
    /// everything else is an implicit withdraw of the previous record.
    pub fn equal(&self, other: &Rib) -> bool {
        if self.rtype != other.rtype {
            return false;
        }
        match self.rtype {
            RibType::Connected => {
                self.src == other.src
                    && self.nexthops.len() == 1
                    && other.nexthops.len() == 1
                    && self.nexthops[0] == other.nexthops[0]
            }
            RibType::Bgp => self.src == other.src && self.path_id == other.path_id,
            RibType::Static => true,
            _ => true,
        }
    }

    fn normalize(&mut self) {
        if !self.flags.has_distance() {
            self.distance = default_distance(self.rtype, self.subtype);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RibUpdate {
    Announce,
    Change,
    Withdraw,
}

/// Selection change pending redistribution. Computed under the tenant lock,
/// delivered after it is released.
#[derive(Debug, Clone)]
pub struct RibNotice {
    pub vrf_id: u32,
    pub update: RibUpdate,
    pub prefix: IpNet,
    pub rib: Rib,
}

pub(crate) struct RibCtx<'a> {
    pub vrf_id: u32,
    pub add_path_default: bool,
    pub fib: &'a dyn FibHandler,
}

/// Recursive resolution. Static and BGP routes with a single address-only
/// nexthop resolve through a longest-prefix match over the same table; the
/// route under resolution may match itself, which is accepted. Everything
/// else is considered resolved.
fn resolve_against<P: AfiPrefix>(table: &RibTable<P>, rib: &Rib) -> bool {
    if !matches!(rib.rtype, RibType::Static | RibType::Bgp) {
        return true;
    }
    if rib.nexthops.len() != 1 || !rib.nexthops[0].is_addr_only() {
        return true;
    }
    let addr = match rib.nexthops[0].addr {
        Some(addr) => addr,
        None => return true,
    };
    match P::host(addr) {
        Some(host) => table.get_lpm(&host).is_some(),
        None => false,
    }
}

/// Best-path selection at one node, run whenever its record set changes.
/// `removed` records only contribute their old FIB/Selected state.
pub(crate) fn rib_process<P: AfiPrefix>(
    table: &mut RibTable<P>,
    ctx: &RibCtx<'_>,
    prefix: P,
    removed: &mut [Rib],
    force_resolve: bool,
    out: &mut Vec<RibNotice>,
) {
    // Resolution runs against the full table, before the node is taken out.
    let resolved: Vec<bool> = match table.get(&prefix) {
        Some(ribs) => ribs
            .iter()
            .map(|r| {
                if force_resolve {
                    resolve_against(table, r)
                } else {
                    r.flags.resolved()
                }
            })
            .collect(),
        None => Vec::new(),
    };

    let mut cur = table.remove(&prefix).unwrap_or_default();
    for (rib, ok) in cur.iter_mut().zip(resolved.iter()) {
        rib.flags.set_resolved(*ok);
    }

    // Rank by (distance, metric); exact ties join the FIB set as multipath.
    // A kernel default route is set aside when the carve-out is enabled.
    let mut best: Option<usize> = None;
    let mut new_fib: Vec<usize> = Vec::new();
    let mut def: Option<usize> = None;
    for i in 0..cur.len() {
        if !cur[i].flags.resolved() {
            continue;
        }
        if prefix.is_default() && ctx.add_path_default && cur[i].rtype == RibType::Kernel {
            def = Some(i);
            continue;
        }
        match best {
            None => {
                best = Some(i);
                new_fib.push(i);
            }
            Some(b) => {
                let (bd, bm) = (cur[b].distance, cur[b].metric);
                let (d, m) = (cur[i].distance, cur[i].metric);
                if d < bd || (d == bd && m < bm) {
                    best = Some(i);
                    new_fib.clear();
                    new_fib.push(i);
                } else if d == bd && m == bm {
                    new_fib.push(i);
                }
            }
        }
    }
    if let Some(d) = def {
        // The set-aside kernel default always stays installed.
        new_fib.push(d);
        if best.is_none() {
            best = Some(d);
        }
    }

    // Sync FIB flags against the computed set. Static and BGP entries are
    // re-installed even when already marked, to cover attribute changes.
    let ipnet = prefix.to_ipnet();
    for i in 0..cur.len() {
        let in_new = new_fib.contains(&i);
        let was_fib = cur[i].flags.fib();
        if was_fib && !in_new {
            if !cur[i].is_system() {
                ctx.fib.uninstall(ctx.vrf_id, &ipnet, &cur[i]);
            }
            cur[i].flags.set_fib(false);
        } else if in_new
            && (!was_fib || matches!(cur[i].rtype, RibType::Static | RibType::Bgp))
        {
            if !cur[i].is_system() {
                ctx.fib.install(ctx.vrf_id, &ipnet, &cur[i]);
            }
            cur[i].flags.set_fib(true);
        }
    }
    for rib in removed.iter_mut() {
        if rib.flags.fib() {
            if !rib.is_system() {
                ctx.fib.uninstall(ctx.vrf_id, &ipnet, rib);
            }
            rib.flags.set_fib(false);
        }
    }

    // Selection transition. Same route type is an in-place change, otherwise
    // the old record is withdrawn and the new one announced.
    let old_in_cur = (0..cur.len()).find(|&i| cur[i].flags.selected());
    let old_in_removed = removed.iter().position(|r| r.flags.selected());
    let unchanged = old_in_cur == best && old_in_removed.is_none();
    if !unchanged {
        let old = if let Some(i) = old_in_cur {
            cur[i].flags.set_selected(false);
            Some(cur[i].clone())
        } else if let Some(i) = old_in_removed {
            removed[i].flags.set_selected(false);
            Some(removed[i].clone())
        } else {
            None
        };
        let new = best.map(|i| {
            cur[i].flags.set_selected(true);
            cur[i].clone()
        });
        match (old, new) {
            (Some(old), Some(new)) if old.rtype == new.rtype => out.push(RibNotice {
                vrf_id: ctx.vrf_id,
                update: RibUpdate::Change,
                prefix: ipnet,
                rib: new,
            }),
            (old, new) => {
                if let Some(old) = old {
                    out.push(RibNotice {
                        vrf_id: ctx.vrf_id,
                        update: RibUpdate::Withdraw,
                        prefix: ipnet,
                        rib: old,
                    });
                }
                if let Some(new) = new {
                    out.push(RibNotice {
                        vrf_id: ctx.vrf_id,
                        update: RibUpdate::Announce,
                        prefix: ipnet,
                        rib: new,
                    });
                }
            }
        }
    }

    if !cur.is_empty() {
        table.insert(prefix, cur);
    }
}

pub(crate) fn rib_add_in<P: AfiPrefix>(
    table: &mut RibTable<P>,
    ctx: &RibCtx<'_>,
    prefix: P,
    mut rib: Rib,
    out: &mut Vec<RibNotice>,
) {
    let prefix = prefix.masked();
    rib.normalize();
    let ok = resolve_against(table, &rib);
    rib.flags.set_resolved(ok);

    // A Connected re-add with the same source and single nexthop is a
    // no-op. Other types go through replacement so attribute changes and
    // distinct BGP paths are kept.
    if rib.rtype == RibType::Connected {
        if let Some(ribs) = table.get(&prefix) {
            let dup = ribs.iter().any(|r| {
                r.rtype == rib.rtype
                    && r.src == rib.src
                    && r.nexthops.len() == 1
                    && rib.nexthops.len() == 1
                    && r.nexthops[0] == rib.nexthops[0]
            });
            if dup {
                return;
            }
        }
    }

    let cur = table.remove(&prefix).unwrap_or_default();
    let (mut removed, mut kept): (Vec<Rib>, Vec<Rib>) =
        cur.into_iter().partition(|r| r.equal(&rib));
    kept.push(rib);
    table.insert(prefix, kept);
    rib_process(table, ctx, prefix, &mut removed, false, out);
}

pub(crate) fn rib_delete_in<P: AfiPrefix>(
    table: &mut RibTable<P>,
    ctx: &RibCtx<'_>,
    prefix: P,
    rib: &Rib,
    out: &mut Vec<RibNotice>,
) {
    let prefix = prefix.masked();
    let mut cur = match table.remove(&prefix) {
        Some(cur) => cur,
        None => return,
    };
    let i = match cur.iter().position(|r| r.equal(rib)) {
        Some(i) => i,
        None => {
            table.insert(prefix, cur);
            return;
        }
    };
    let mut removed = vec![cur.remove(i)];
    if !cur.is_empty() {
        table.insert(prefix, cur);
    }
    rib_process(table, ctx, prefix, &mut removed, false, out);
}

/// Remove every record contributed by `src`, reprocessing each touched node.
pub(crate) fn rib_clean_in<P: AfiPrefix>(
    table: &mut RibTable<P>,
    ctx: &RibCtx<'_>,
    src: RibSrc,
    out: &mut Vec<RibNotice>,
) {
    let prefixes: Vec<P> = table.iter().map(|(p, _)| *p).collect();
    let mut touched = false;
    for prefix in prefixes {
        let cur = match table.remove(&prefix) {
            Some(cur) => cur,
            None => continue,
        };
        let (mut removed, kept): (Vec<Rib>, Vec<Rib>) =
            cur.into_iter().partition(|r| r.src == src);
        if removed.is_empty() {
            table.insert(prefix, kept);
            continue;
        }
        touched = true;
        if !kept.is_empty() {
            table.insert(prefix, kept);
        }
        rib_process(table, ctx, prefix, &mut removed, false, out);
    }
    if touched {
        rib_walk_in(table, ctx, out);
    }
}

/// Full-table reprocess with forced resolution, run after anything that can
/// change reachability of recursive nexthops.
pub(crate) fn rib_walk_in<P: AfiPrefix>(
    table: &mut RibTable<P>,
    ctx: &RibCtx<'_>,
    out: &mut Vec<RibNotice>,
) {
    let prefixes: Vec<P> = table.iter().map(|(p, _)| *p).collect();
    for prefix in prefixes {
        rib_process(table, ctx, prefix, &mut [], true, out);
    }
}
