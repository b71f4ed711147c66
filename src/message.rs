use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use octets::Octets;

use crate::error::{Error, Result};
use crate::nexthop::Nexthop;
use crate::rib::RibType;
use crate::table::Afi;

pub const HEADER_MARKER: u8 = 255;
pub const HEADER_V2_LEN: usize = 6;
pub const HEADER_V3_LEN: usize = 8;

pub const INTERFACE_NAMSIZ: usize = 20;

pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;

const LINK_TYPE_ETHER: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    InterfaceAdd = 1,
    InterfaceDelete = 2,
    InterfaceAddressAdd = 3,
    InterfaceAddressDelete = 4,
    InterfaceUp = 5,
    InterfaceDown = 6,
    Ipv4RouteAdd = 7,
    Ipv4RouteDelete = 8,
    Ipv6RouteAdd = 9,
    Ipv6RouteDelete = 10,
    RedistributeAdd = 11,
    RedistributeDelete = 12,
    RedistributeDefaultAdd = 13,
    RedistributeDefaultDelete = 14,
    Ipv4NexthopLookup = 15,
    Ipv6NexthopLookup = 16,
    Ipv4ImportLookup = 17,
    Ipv6ImportLookup = 18,
    InterfaceRename = 19,
    RouterIdAdd = 20,
    RouterIdDelete = 21,
    RouterIdUpdate = 22,
    Hello = 23,
}

impl Command {
    pub fn from_u16(v: u16) -> Result<Command> {
        use Command::*;
        Ok(match v {
            1 => InterfaceAdd,
            2 => InterfaceDelete,
            3 => InterfaceAddressAdd,
            4 => InterfaceAddressDelete,
            5 => InterfaceUp,
            6 => InterfaceDown,
            7 => Ipv4RouteAdd,
            8 => Ipv4RouteDelete,
            9 => Ipv6RouteAdd,
            10 => Ipv6RouteDelete,
            11 => RedistributeAdd,
            12 => RedistributeDelete,
            13 => RedistributeDefaultAdd,
            14 => RedistributeDefaultDelete,
            15 => Ipv4NexthopLookup,
            16 => Ipv6NexthopLookup,
            17 => Ipv4ImportLookup,
            18 => Ipv6ImportLookup,
            19 => InterfaceRename,
            20 => RouterIdAdd,
            21 => RouterIdDelete,
            22 => RouterIdUpdate,
            23 => Hello,
            other => return Err(Error::BadCommand(other)),
        })
    }
}

/// Route origin as carried on the wire. Protocol daemons announce
/// themselves with one of these in Hello and tag their route updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
    System = 0,
    Kernel = 1,
    Connect = 2,
    Static = 3,
    Rip = 4,
    Ripng = 5,
    Ospf = 6,
    Ospf6 = 7,
    Isis = 8,
    Bgp = 9,
}

impl RouteType {
    pub fn from_u8(v: u8) -> Result<RouteType> {
        use RouteType::*;
        Ok(match v {
            0 => System,
            1 => Kernel,
            2 => Connect,
            3 => Static,
            4 => Rip,
            5 => Ripng,
            6 => Ospf,
            7 => Ospf6,
            8 => Isis,
            9 => Bgp,
            other => return Err(Error::BadRouteType(other)),
        })
    }

    pub fn to_rib_type(self) -> RibType {
        match self {
            RouteType::System | RouteType::Kernel => RibType::Kernel,
            RouteType::Connect => RibType::Connected,
            RouteType::Static => RibType::Static,
            RouteType::Rip | RouteType::Ripng => RibType::Rip,
            RouteType::Ospf | RouteType::Ospf6 => RibType::Ospf,
            RouteType::Isis => RibType::Isis,
            RouteType::Bgp => RibType::Bgp,
        }
    }

    pub fn from_rib_type(rtype: RibType, afi: Afi) -> RouteType {
        match (rtype, afi) {
            (RibType::Kernel, _) => RouteType::Kernel,
            (RibType::Connected, _) => RouteType::Connect,
            (RibType::Static, _) => RouteType::Static,
            (RibType::Rip, Afi::Ip) => RouteType::Rip,
            (RibType::Rip, Afi::Ip6) => RouteType::Ripng,
            (RibType::Ospf, Afi::Ip) => RouteType::Ospf,
            (RibType::Ospf, Afi::Ip6) => RouteType::Ospf6,
            (RibType::Isis, _) => RouteType::Isis,
            (RibType::Bgp, _) => RouteType::Bgp,
        }
    }

    /// Family-specific types carry their address family; the rest are
    /// ambiguous on the wire.
    pub fn determined_afi(self) -> Option<Afi> {
        match self {
            RouteType::Rip | RouteType::Ospf => Some(Afi::Ip),
            RouteType::Ripng | RouteType::Ospf6 => Some(Afi::Ip6),
            _ => None,
        }
    }

    /// Address families a daemon of this type is interested in, used when
    /// a redistribution request does not determine one itself.
    pub fn interest_afis(self) -> &'static [Afi] {
        match self {
            RouteType::Rip | RouteType::Ospf => &[Afi::Ip],
            RouteType::Ripng | RouteType::Ospf6 => &[Afi::Ip6],
            _ => &[Afi::Ip, Afi::Ip6],
        }
    }
}

/*
    Version 2 header:
    0                   1                   2                   3
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |            Length             |     Marker    |    Version    |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |            Command            |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

    Version 3 inserts a VRF id before the command:
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |            Length             |     Marker    |    Version    |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |            VRF id             |            Command            |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

    Length covers the header itself.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZapiHeader {
    pub length: u16,
    pub version: u8,
    pub vrf_id: u16,
    pub command: u16,
}

impl ZapiHeader {
    pub fn size(version: u8) -> usize {
        if version == 3 {
            HEADER_V3_LEN
        } else {
            HEADER_V2_LEN
        }
    }

    pub fn decode(buf: &mut Octets<'_>) -> Result<ZapiHeader> {
        let length = buf.get_u16()?;
        let marker = buf.get_u8()?;
        if marker != HEADER_MARKER {
            return Err(Error::BadMarker(marker));
        }
        let version = buf.get_u8()?;
        let vrf_id = match version {
            2 => 0,
            3 => buf.get_u16()?,
            other => return Err(Error::BadVersion(other)),
        };
        let command = buf.get_u16()?;
        if (length as usize) < ZapiHeader::size(version) {
            return Err(Error::BadLength(length));
        }
        Ok(ZapiHeader {
            length,
            version,
            vrf_id,
            command,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.length);
        buf.put_u8(HEADER_MARKER);
        buf.put_u8(self.version);
        if self.version == 3 {
            buf.put_u16(self.vrf_id);
        }
        buf.put_u16(self.command);
    }
}

/// Header plus body in one buffer, length filled in.
pub fn frame(version: u8, vrf_id: u16, command: Command, body: &[u8]) -> BytesMut {
    let hlen = ZapiHeader::size(version);
    let mut buf = BytesMut::with_capacity(hlen + body.len());
    let header = ZapiHeader {
        length: (hlen + body.len()) as u16,
        version,
        vrf_id,
        command: command as u16,
    };
    header.encode(&mut buf);
    buf.put_slice(body);
    buf
}

fn get_ipv4(buf: &mut Octets<'_>) -> Result<Ipv4Addr> {
    let raw = buf.get_bytes(4)?;
    let mut a = [0u8; 4];
    a.copy_from_slice(raw.buf());
    Ok(Ipv4Addr::from(a))
}

fn get_ipv6(buf: &mut Octets<'_>) -> Result<Ipv6Addr> {
    let raw = buf.get_bytes(16)?;
    let mut a = [0u8; 16];
    a.copy_from_slice(raw.buf());
    Ok(Ipv6Addr::from(a))
}

fn put_addr(buf: &mut BytesMut, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => buf.put_slice(&v4.octets()),
        IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
    }
}

/*
    +-+-+-+-+-+-+-+-+
    |  Route Type   |
    +-+-+-+-+-+-+-+-+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloBody {
    pub route_type: RouteType,
}

impl HelloBody {
    pub fn decode(buf: &mut Octets<'_>) -> Result<HelloBody> {
        Ok(HelloBody {
            route_type: RouteType::from_u8(buf.get_u8()?)?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.route_type as u8);
    }
}

/*
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |  Family (1)   |   Address (4 or 16 octets)    ~
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    | Prefix Length |
    +-+-+-+-+-+-+-+-+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterIdUpdateBody {
    pub addr: IpAddr,
    pub plen: u8,
}

impl RouterIdUpdateBody {
    pub fn decode(buf: &mut Octets<'_>) -> Result<RouterIdUpdateBody> {
        let family = buf.get_u8()?;
        let addr = match family {
            AF_INET => IpAddr::V4(get_ipv4(buf)?),
            AF_INET6 => IpAddr::V6(get_ipv6(buf)?),
            other => return Err(Error::BadAddressFamily(other)),
        };
        let plen = buf.get_u8()?;
        Ok(RouterIdUpdateBody { addr, plen })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self.addr {
            IpAddr::V4(_) => buf.put_u8(AF_INET),
            IpAddr::V6(_) => buf.put_u8(AF_INET6),
        }
        put_addr(buf, &self.addr);
        buf.put_u8(self.plen);
    }
}

/*
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                     Name (20 octets, zero padded)             |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |           Index (4)           |   Status (1)  |   Flags (8)   ~
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    ~  Metric (4)   |    MTU (4)    |    MTU6 (4)   | Bandwidth (4) |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    | Link Type (4) | HW length (4) |      HW address (variable)    |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceUpdateBody {
    pub name: String,
    pub index: u32,
    pub status: u8,
    pub flags: u64,
    pub metric: u32,
    pub mtu: u32,
    pub mtu6: u32,
    pub bandwidth: u32,
    pub hw_addr: Vec<u8>,
}

impl InterfaceUpdateBody {
    pub fn decode(buf: &mut Octets<'_>) -> Result<InterfaceUpdateBody> {
        let raw = buf.get_bytes(INTERFACE_NAMSIZ)?;
        let end = raw
            .buf()
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(INTERFACE_NAMSIZ);
        let name = String::from_utf8_lossy(&raw.buf()[..end]).into_owned();
        let index = buf.get_u32()?;
        let status = buf.get_u8()?;
        let flags = buf.get_u64()?;
        let metric = buf.get_u32()?;
        let mtu = buf.get_u32()?;
        let mtu6 = buf.get_u32()?;
        let bandwidth = buf.get_u32()?;
        buf.skip(4)?; // link layer type
        let hw_len = buf.get_u32()? as usize;
        let hw_addr = buf.get_bytes(hw_len)?.to_vec();
        Ok(InterfaceUpdateBody {
            name,
            index,
            status,
            flags,
            metric,
            mtu,
            mtu6,
            bandwidth,
            hw_addr,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut name = [0u8; INTERFACE_NAMSIZ];
        let n = self.name.len().min(INTERFACE_NAMSIZ);
        name[..n].copy_from_slice(&self.name.as_bytes()[..n]);
        buf.put_slice(&name);
        buf.put_u32(self.index);
        buf.put_u8(self.status);
        buf.put_u64(self.flags);
        buf.put_u32(self.metric);
        buf.put_u32(self.mtu);
        buf.put_u32(self.mtu6);
        buf.put_u32(self.bandwidth);
        buf.put_u32(LINK_TYPE_ETHER);
        buf.put_u32(self.hw_addr.len() as u32);
        buf.put_slice(&self.hw_addr);
    }
}

/*
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |           Index (4)           |   Flags (1)   |  Family (1)   |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |      Address (4 or 16)        | Prefix Length | Dest (4, zero)|
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddressUpdateBody {
    pub index: u32,
    pub flags: u8,
    pub prefix: IpNet,
}

impl InterfaceAddressUpdateBody {
    pub fn decode(buf: &mut Octets<'_>) -> Result<InterfaceAddressUpdateBody> {
        let index = buf.get_u32()?;
        let flags = buf.get_u8()?;
        let family = buf.get_u8()?;
        let prefix = match family {
            AF_INET => {
                let addr = get_ipv4(buf)?;
                let plen = buf.get_u8()?;
                IpNet::V4(Ipv4Net::new(addr, plen)?)
            }
            AF_INET6 => {
                let addr = get_ipv6(buf)?;
                let plen = buf.get_u8()?;
                IpNet::V6(Ipv6Net::new(addr, plen)?)
            }
            other => return Err(Error::BadAddressFamily(other)),
        };
        buf.skip(4)?; // destination, unused
        Ok(InterfaceAddressUpdateBody {
            index,
            flags,
            prefix,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u8(self.flags);
        match self.prefix {
            IpNet::V4(p) => {
                buf.put_u8(AF_INET);
                buf.put_slice(&p.addr().octets());
                buf.put_u8(p.prefix_len());
            }
            IpNet::V6(p) => {
                buf.put_u8(AF_INET6);
                buf.put_slice(&p.addr().octets());
                buf.put_u8(p.prefix_len());
            }
        }
        buf.put_slice(&[0u8; 4]);
    }
}

pub const MESSAGE_NEXTHOP: u8 = 0x01;
pub const MESSAGE_IFINDEX: u8 = 0x02;
pub const MESSAGE_DISTANCE: u8 = 0x04;
pub const MESSAGE_METRIC: u8 = 0x08;
pub const MESSAGE_PATH_ID: u8 = 0x10;
pub const MESSAGE_ASPATH: u8 = 0x20;

const NEXTHOP_IFINDEX: u8 = 1;
const NEXTHOP_IPV4: u8 = 3;
const NEXTHOP_IPV4_IFINDEX: u8 = 4;
const NEXTHOP_IPV6: u8 = 6;
const NEXTHOP_IPV6_IFINDEX: u8 = 7;

/*
    0                   1                   2                   3
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |  Route Type   |     Flags     |    Message    |     SAFI      ~
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    ~               | Prefix Length |      Prefix (variable)        ~
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

    The prefix occupies only as many octets as its length requires.
    Optional sections follow, gated on Message bits in this order:
    nexthops, interface indexes, distance, metric, path id, AS path.

    Version 2 nexthops are bare addresses; version 3 nexthops carry a
    nexthop type octet each.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteUpdateBody {
    pub rtype: RouteType,
    pub flags: u8,
    pub safi: u16,
    pub prefix: IpNet,
    pub nexthops: Vec<Nexthop>,
    pub distance: Option<u8>,
    pub metric: Option<u32>,
    pub path_id: Option<u32>,
    pub aux: Vec<u8>,
}

impl RouteUpdateBody {
    pub fn new(rtype: RouteType, prefix: IpNet) -> RouteUpdateBody {
        RouteUpdateBody {
            rtype,
            flags: 0,
            safi: 1,
            prefix,
            nexthops: Vec::new(),
            distance: None,
            metric: None,
            path_id: None,
            aux: Vec::new(),
        }
    }

    pub fn decode(buf: &mut Octets<'_>, version: u8, afi: Afi) -> Result<RouteUpdateBody> {
        let rtype = RouteType::from_u8(buf.get_u8()?)?;
        let flags = buf.get_u8()?;
        let message = buf.get_u8()?;
        let safi = buf.get_u16()?;
        let plen = buf.get_u8()?;
        let nbytes = (plen as usize + 7) / 8;
        let raw = buf.get_bytes(nbytes)?;
        let prefix = match afi {
            Afi::Ip => {
                if plen > 32 {
                    return Err(Error::BadPrefix);
                }
                let mut a = [0u8; 4];
                a[..nbytes].copy_from_slice(raw.buf());
                IpNet::V4(Ipv4Net::new(Ipv4Addr::from(a), plen)?)
            }
            Afi::Ip6 => {
                if plen > 128 {
                    return Err(Error::BadPrefix);
                }
                let mut a = [0u8; 16];
                a[..nbytes].copy_from_slice(raw.buf());
                IpNet::V6(Ipv6Net::new(Ipv6Addr::from(a), plen)?)
            }
        };

        let mut body = RouteUpdateBody::new(rtype, prefix);
        body.flags = flags;
        body.safi = safi;

        if message & MESSAGE_NEXTHOP != 0 {
            let count = buf.get_u8()?;
            for _ in 0..count {
                let nexthop = if version == 2 {
                    match afi {
                        Afi::Ip => Nexthop::from_addr(IpAddr::V4(get_ipv4(buf)?)),
                        Afi::Ip6 => Nexthop::from_addr(IpAddr::V6(get_ipv6(buf)?)),
                    }
                } else {
                    match buf.get_u8()? {
                        NEXTHOP_IFINDEX => Nexthop::from_ifindex(buf.get_u32()?),
                        NEXTHOP_IPV4 => Nexthop::from_addr(IpAddr::V4(get_ipv4(buf)?)),
                        NEXTHOP_IPV4_IFINDEX => {
                            let addr = get_ipv4(buf)?;
                            Nexthop::from_addr_ifindex(IpAddr::V4(addr), buf.get_u32()?)
                        }
                        NEXTHOP_IPV6 => Nexthop::from_addr(IpAddr::V6(get_ipv6(buf)?)),
                        NEXTHOP_IPV6_IFINDEX => {
                            let addr = get_ipv6(buf)?;
                            Nexthop::from_addr_ifindex(IpAddr::V6(addr), buf.get_u32()?)
                        }
                        other => return Err(Error::BadNexthopType(other)),
                    }
                };
                body.nexthops.push(nexthop);
            }
        }
        if message & MESSAGE_IFINDEX != 0 {
            let count = buf.get_u8()?;
            for _ in 0..count {
                body.nexthops.push(Nexthop::from_ifindex(buf.get_u32()?));
            }
        }
        if message & MESSAGE_DISTANCE != 0 {
            body.distance = Some(buf.get_u8()?);
        }
        if message & MESSAGE_METRIC != 0 {
            body.metric = Some(buf.get_u32()?);
        }
        if message & MESSAGE_PATH_ID != 0 {
            body.path_id = Some(buf.get_u32()?);
        }
        if message & MESSAGE_ASPATH != 0 {
            let len = buf.get_u32()? as usize;
            body.aux = buf.get_bytes(len)?.to_vec();
        }
        Ok(body)
    }

    pub fn encode(&self, version: u8, buf: &mut BytesMut) {
        // Version 2 splits address and interface nexthops into separate
        // sections; version 3 tags every nexthop in one section.
        let (addrs, ifs): (Vec<&Nexthop>, Vec<&Nexthop>) = self
            .nexthops
            .iter()
            .partition(|n| n.addr.is_some() || version != 2);

        let mut message = 0u8;
        if !addrs.is_empty() {
            message |= MESSAGE_NEXTHOP;
        }
        if !ifs.is_empty() {
            message |= MESSAGE_IFINDEX;
        }
        if self.distance.is_some() {
            message |= MESSAGE_DISTANCE;
        }
        if self.metric.is_some() {
            message |= MESSAGE_METRIC;
        }
        if self.path_id.is_some() {
            message |= MESSAGE_PATH_ID;
        }
        if !self.aux.is_empty() {
            message |= MESSAGE_ASPATH;
        }

        buf.put_u8(self.rtype as u8);
        buf.put_u8(self.flags);
        buf.put_u8(message);
        buf.put_u16(self.safi);
        let plen = match self.prefix {
            IpNet::V4(p) => p.prefix_len(),
            IpNet::V6(p) => p.prefix_len(),
        };
        buf.put_u8(plen);
        let nbytes = (plen as usize + 7) / 8;
        match self.prefix {
            IpNet::V4(p) => buf.put_slice(&p.addr().octets()[..nbytes]),
            IpNet::V6(p) => buf.put_slice(&p.addr().octets()[..nbytes]),
        }

        if !addrs.is_empty() {
            buf.put_u8(addrs.len() as u8);
            for nexthop in &addrs {
                if version == 2 {
                    if let Some(addr) = nexthop.addr {
                        put_addr(buf, &addr);
                    }
                    continue;
                }
                match (nexthop.addr, nexthop.ifindex) {
                    (None, ifindex) => {
                        buf.put_u8(NEXTHOP_IFINDEX);
                        buf.put_u32(ifindex);
                    }
                    (Some(IpAddr::V4(a)), 0) => {
                        buf.put_u8(NEXTHOP_IPV4);
                        buf.put_slice(&a.octets());
                    }
                    (Some(IpAddr::V4(a)), ifindex) => {
                        buf.put_u8(NEXTHOP_IPV4_IFINDEX);
                        buf.put_slice(&a.octets());
                        buf.put_u32(ifindex);
                    }
                    (Some(IpAddr::V6(a)), 0) => {
                        buf.put_u8(NEXTHOP_IPV6);
                        buf.put_slice(&a.octets());
                    }
                    (Some(IpAddr::V6(a)), ifindex) => {
                        buf.put_u8(NEXTHOP_IPV6_IFINDEX);
                        buf.put_slice(&a.octets());
                        buf.put_u32(ifindex);
                    }
                }
            }
        }
        if !ifs.is_empty() {
            buf.put_u8(ifs.len() as u8);
            for nexthop in &ifs {
                buf.put_u32(nexthop.ifindex);
            }
        }
        if let Some(distance) = self.distance {
            buf.put_u8(distance);
        }
        if let Some(metric) = self.metric {
            buf.put_u32(metric);
        }
        if let Some(path_id) = self.path_id {
            buf.put_u32(path_id);
        }
        if !self.aux.is_empty() {
            buf.put_u32(self.aux.len() as u32);
            buf.put_slice(&self.aux);
        }
    }
}

/*
    +-+-+-+-+-+-+-+-+
    |  Route Type   |
    +-+-+-+-+-+-+-+-+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedistributeBody {
    pub route_type: RouteType,
}

impl RedistributeBody {
    pub fn decode(buf: &mut Octets<'_>) -> Result<RedistributeBody> {
        Ok(RedistributeBody {
            route_type: RouteType::from_u8(buf.get_u8()?)?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.route_type as u8);
    }
}

/*
    The query is a bare address; the reply repeats it and appends the
    metric and the resolved nexthops.

    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |      Address (4 or 16)        |   Metric (4)  |   Count (1)   |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                      Nexthops (variable)                      |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NexthopLookupBody {
    pub addr: IpAddr,
}

impl NexthopLookupBody {
    pub fn decode(buf: &mut Octets<'_>, afi: Afi) -> Result<NexthopLookupBody> {
        let addr = match afi {
            Afi::Ip => IpAddr::V4(get_ipv4(buf)?),
            Afi::Ip6 => IpAddr::V6(get_ipv6(buf)?),
        };
        Ok(NexthopLookupBody { addr })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put_addr(buf, &self.addr);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NexthopReplyBody {
    pub addr: IpAddr,
    pub metric: u32,
    pub nexthops: Vec<Nexthop>,
}

impl NexthopReplyBody {
    pub fn decode(buf: &mut Octets<'_>, afi: Afi) -> Result<NexthopReplyBody> {
        let addr = match afi {
            Afi::Ip => IpAddr::V4(get_ipv4(buf)?),
            Afi::Ip6 => IpAddr::V6(get_ipv6(buf)?),
        };
        let metric = buf.get_u32()?;
        let count = buf.get_u8()?;
        let mut nexthops = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let nexthop = match buf.get_u8()? {
                NEXTHOP_IFINDEX => Nexthop::from_ifindex(buf.get_u32()?),
                NEXTHOP_IPV4 => Nexthop::from_addr(IpAddr::V4(get_ipv4(buf)?)),
                NEXTHOP_IPV6 => Nexthop::from_addr(IpAddr::V6(get_ipv6(buf)?)),
                other => return Err(Error::BadNexthopType(other)),
            };
            nexthops.push(nexthop);
        }
        Ok(NexthopReplyBody {
            addr,
            metric,
            nexthops,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put_addr(buf, &self.addr);
        buf.put_u32(self.metric);
        buf.put_u8(self.nexthops.len() as u8);
        for nexthop in &self.nexthops {
            match (nexthop.addr, nexthop.ifindex) {
                (Some(IpAddr::V4(a)), _) => {
                    buf.put_u8(NEXTHOP_IPV4);
                    buf.put_slice(&a.octets());
                }
                (Some(IpAddr::V6(a)), _) => {
                    buf.put_u8(NEXTHOP_IPV6);
                    buf.put_slice(&a.octets());
                }
                (None, ifindex) => {
                    buf.put_u8(NEXTHOP_IFINDEX);
                    buf.put_u32(ifindex);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn octets(buf: &BytesMut) -> Octets<'_> {
        Octets::with_slice(buf)
    }

    #[test]
    fn header_v2_round_trip() {
        let header = ZapiHeader {
            length: 6,
            version: 2,
            vrf_id: 0,
            command: Command::Hello as u16,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_V2_LEN);
        assert_eq!(buf[2], HEADER_MARKER);
        assert_eq!(buf[3], 2);

        let decoded = ZapiHeader::decode(&mut octets(&buf)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_v3_round_trip() {
        let header = ZapiHeader {
            length: 8,
            version: 3,
            vrf_id: 42,
            command: Command::Ipv4RouteAdd as u16,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_V3_LEN);

        let decoded = ZapiHeader::decode(&mut octets(&buf)).unwrap();
        assert_eq!(decoded.vrf_id, 42);
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_rejects_bad_marker_and_version() {
        let mut buf = BytesMut::new();
        buf.put_u16(6);
        buf.put_u8(0xFE);
        buf.put_u8(2);
        buf.put_u16(23);
        assert!(matches!(
            ZapiHeader::decode(&mut octets(&buf)),
            Err(Error::BadMarker(0xFE))
        ));

        let mut buf = BytesMut::new();
        buf.put_u16(6);
        buf.put_u8(HEADER_MARKER);
        buf.put_u8(4);
        buf.put_u16(23);
        assert!(matches!(
            ZapiHeader::decode(&mut octets(&buf)),
            Err(Error::BadVersion(4))
        ));
    }

    #[test]
    fn route_body_v2_round_trip() {
        let mut body = RouteUpdateBody::new(RouteType::Bgp, "10.1.0.0/16".parse().unwrap());
        body.nexthops
            .push(Nexthop::from_addr("192.0.2.1".parse().unwrap()));
        body.nexthops.push(Nexthop::from_ifindex(3));
        body.distance = Some(20);
        body.metric = Some(100);

        let mut buf = BytesMut::new();
        body.encode(2, &mut buf);
        // Two octets of prefix for a /16.
        assert_eq!(buf[5], 16);

        let decoded = RouteUpdateBody::decode(&mut octets(&buf), 2, Afi::Ip).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn route_body_v3_round_trip() {
        let mut body = RouteUpdateBody::new(RouteType::Static, "2001:db8::/32".parse().unwrap());
        body.nexthops
            .push(Nexthop::from_addr_ifindex("2001:db8::1".parse().unwrap(), 7));
        body.metric = Some(5);
        body.path_id = Some(9);

        let mut buf = BytesMut::new();
        body.encode(3, &mut buf);
        let decoded = RouteUpdateBody::decode(&mut octets(&buf), 3, Afi::Ip6).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn route_body_aux_attributes_survive() {
        let mut body = RouteUpdateBody::new(RouteType::Bgp, "10.0.0.0/8".parse().unwrap());
        body.nexthops
            .push(Nexthop::from_addr("192.0.2.1".parse().unwrap()));
        body.aux = vec![0xde, 0xad, 0xbe, 0xef];

        let mut buf = BytesMut::new();
        body.encode(3, &mut buf);
        let decoded = RouteUpdateBody::decode(&mut octets(&buf), 3, Afi::Ip).unwrap();
        assert_eq!(decoded.aux, body.aux);
    }

    #[test]
    fn interface_body_round_trip_pads_name() {
        let body = InterfaceUpdateBody {
            name: "eth0".to_string(),
            index: 3,
            status: 1,
            flags: 0x41,
            metric: 1,
            mtu: 1500,
            mtu6: 1500,
            bandwidth: 0,
            hw_addr: vec![0, 1, 2, 3, 4, 5],
        };
        let mut buf = BytesMut::new();
        body.encode(&mut buf);
        assert_eq!(&buf[..4], b"eth0");
        assert!(buf[4..INTERFACE_NAMSIZ].iter().all(|&b| b == 0));

        let decoded = InterfaceUpdateBody::decode(&mut octets(&buf)).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn address_body_round_trip() {
        let body = InterfaceAddressUpdateBody {
            index: 3,
            flags: 0,
            prefix: "192.0.2.1/24".parse().unwrap(),
        };
        let mut buf = BytesMut::new();
        body.encode(&mut buf);
        let decoded = InterfaceAddressUpdateBody::decode(&mut octets(&buf)).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn router_id_body_round_trip() {
        let body = RouterIdUpdateBody {
            addr: "10.255.0.1".parse().unwrap(),
            plen: 32,
        };
        let mut buf = BytesMut::new();
        body.encode(&mut buf);
        let decoded = RouterIdUpdateBody::decode(&mut octets(&buf)).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn nexthop_reply_round_trip() {
        let body = NexthopReplyBody {
            addr: "10.1.2.3".parse().unwrap(),
            metric: 10,
            nexthops: vec![
                Nexthop::from_addr("192.0.2.1".parse().unwrap()),
                Nexthop::from_ifindex(3),
            ],
        };
        let mut buf = BytesMut::new();
        body.encode(&mut buf);
        let decoded = NexthopReplyBody::decode(&mut octets(&buf), Afi::Ip).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn route_type_mapping() {
        assert_eq!(RouteType::from_u8(9).unwrap(), RouteType::Bgp);
        assert!(RouteType::from_u8(42).is_err());
        assert_eq!(RouteType::Ospf6.to_rib_type(), RibType::Ospf);
        assert_eq!(
            RouteType::from_rib_type(RibType::Rip, Afi::Ip6),
            RouteType::Ripng
        );
        assert_eq!(RouteType::Ospf.determined_afi(), Some(Afi::Ip));
        assert_eq!(RouteType::Bgp.determined_afi(), None);
        assert_eq!(RouteType::Bgp.interest_afis(), &[Afi::Ip, Afi::Ip6]);
    }

    #[test]
    fn frame_fills_length() {
        let mut body = BytesMut::new();
        HelloBody {
            route_type: RouteType::Bgp,
        }
        .encode(&mut body);
        let buf = frame(3, 5, Command::Hello, &body);
        assert_eq!(buf.len(), HEADER_V3_LEN + 1);

        let header = ZapiHeader::decode(&mut octets(&buf)).unwrap();
        assert_eq!(header.length as usize, buf.len());
        assert_eq!(header.vrf_id, 5);
        assert_eq!(Command::from_u16(header.command).unwrap(), Command::Hello);
    }
}
