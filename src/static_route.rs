use crate::error::{Error, Result};
use crate::nexthop::Nexthop;
use crate::rib::{Rib, RibSrc, RibType, DISTANCE_STATIC};

/// Configured static route at one prefix. Nexthops accumulate across
/// repeated configuration; the whole set is pushed as one RIB record.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticRoute {
    pub distance: u8,
    pub nexthops: Vec<Nexthop>,
}

impl StaticRoute {
    pub fn new(distance: u8) -> StaticRoute {
        StaticRoute {
            distance,
            nexthops: Vec::new(),
        }
    }

    pub fn add_nexthop(&mut self, nexthop: Nexthop) -> Result<()> {
        if self.nexthops.contains(&nexthop) {
            return Err(Error::DuplicateNexthop);
        }
        self.nexthops.push(nexthop);
        Ok(())
    }

    /// Removes one nexthop; `Ok(true)` means the route is now empty and the
    /// whole node should go away.
    pub fn del_nexthop(&mut self, nexthop: &Nexthop) -> Result<bool> {
        let i = self
            .nexthops
            .iter()
            .position(|n| n == nexthop)
            .ok_or(Error::NoSuchNexthop)?;
        self.nexthops.remove(i);
        Ok(self.nexthops.is_empty())
    }

    /// RIB record carrying the current nexthop set.
    pub fn to_rib(&self) -> Rib {
        let mut rib = Rib::new(RibType::Static, RibSrc::Config);
        rib.nexthops = self.nexthops.clone();
        if self.distance != DISTANCE_STATIC {
            rib.set_distance(self.distance);
        }
        rib
    }
}

impl Default for StaticRoute {
    fn default() -> StaticRoute {
        StaticRoute::new(DISTANCE_STATIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn nh(s: &str) -> Nexthop {
        Nexthop::from_addr(s.parse::<IpAddr>().unwrap())
    }

    #[test]
    fn duplicate_nexthop_rejected() {
        let mut route = StaticRoute::default();
        route.add_nexthop(nh("192.0.2.1")).unwrap();
        assert!(matches!(
            route.add_nexthop(nh("192.0.2.1")),
            Err(Error::DuplicateNexthop)
        ));
        route.add_nexthop(nh("192.0.2.2")).unwrap();
        assert_eq!(route.nexthops.len(), 2);
    }

    #[test]
    fn delete_reports_emptiness() {
        let mut route = StaticRoute::default();
        route.add_nexthop(nh("192.0.2.1")).unwrap();
        route.add_nexthop(nh("192.0.2.2")).unwrap();
        assert!(matches!(
            route.del_nexthop(&nh("192.0.2.9")),
            Err(Error::NoSuchNexthop)
        ));
        assert!(!route.del_nexthop(&nh("192.0.2.1")).unwrap());
        assert!(route.del_nexthop(&nh("192.0.2.2")).unwrap());
    }

    #[test]
    fn rib_record_carries_distance_override() {
        let mut route = StaticRoute::new(5);
        route.add_nexthop(nh("192.0.2.1")).unwrap();
        let rib = route.to_rib();
        assert_eq!(rib.distance, 5);
        assert!(rib.flags.has_distance());

        let default = StaticRoute::default().to_rib();
        assert_eq!(default.distance, DISTANCE_STATIC);
        assert!(!default.flags.has_distance());
    }
}
