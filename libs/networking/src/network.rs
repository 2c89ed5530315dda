//! Subnets and the per-network allocator.

use std::collections::BTreeSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::{
    format_address, parse_address, Address, AddressRange, Ipv4Cidr, NetworkError, NetworkSetting,
    Reservation, ReservationKind,
};

/// Subnet as declared in a deployment plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubnetSpec {
    /// CIDR of the subnet.
    pub range: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    /// Ranges never handed out.
    #[serde(default)]
    pub reserved: Vec<String>,
    /// Ranges handed out only by explicit request.
    #[serde(default, rename = "static")]
    pub static_ips: Vec<String>,
    #[serde(default)]
    pub cloud_properties: serde_json::Value,
}

/// A validated subnet.
#[derive(Debug, Clone)]
pub struct Subnet {
    pub cidr: Ipv4Cidr,
    pub gateway: Option<Address>,
    pub dns: Vec<String>,
    pub reserved: Vec<AddressRange>,
    pub static_ranges: Vec<AddressRange>,
    pub cloud_properties: serde_json::Value,
    /// Sorted, merged ranges dynamic allocation must skip.
    not_dynamic: Vec<AddressRange>,
    dynamic_capacity: u64,
}

impl Subnet {
    pub fn from_spec(network: &str, spec: &SubnetSpec) -> Result<Self, NetworkError> {
        let cidr = Ipv4Cidr::from_cidr(&spec.range)?;
        let outside = |what: &'static str, address: Address| NetworkError::OutsideSubnet {
            network: network.to_string(),
            what,
            address: format_address(address),
            range: cidr.to_string(),
        };

        let gateway = match &spec.gateway {
            Some(gw) => {
                let gw = parse_address(gw)?;
                if !cidr.contains(gw) {
                    return Err(outside("gateway", gw));
                }
                Some(gw)
            }
            None => None,
        };

        let parse_ranges = |what: &'static str, ranges: &[String]| {
            ranges
                .iter()
                .map(|r| {
                    let range = AddressRange::parse(r)?;
                    for bound in [range.first, range.last] {
                        if !cidr.contains(bound) {
                            return Err(outside(what, bound));
                        }
                    }
                    Ok(range)
                })
                .collect::<Result<Vec<_>, NetworkError>>()
        };
        let reserved = parse_ranges("reserved range", &spec.reserved)?;
        let static_ranges = parse_ranges("static range", &spec.static_ips)?;

        let specials = [Some(cidr.network_id()), Some(cidr.broadcast()), gateway]
            .into_iter()
            .flatten()
            .map(|addr| AddressRange {
                first: addr,
                last: addr,
            });
        let not_dynamic = merge_ranges(
            reserved
                .iter()
                .chain(&static_ranges)
                .copied()
                .chain(specials)
                .collect(),
        );
        let excluded: u64 = not_dynamic.iter().map(AddressRange::size).sum();
        let dynamic_capacity = cidr.range().size().saturating_sub(excluded);

        Ok(Self {
            cidr,
            gateway,
            dns: spec.dns.clone(),
            reserved,
            static_ranges,
            cloud_properties: spec.cloud_properties.clone(),
            not_dynamic,
            dynamic_capacity,
        })
    }

    /// Addresses no reservation may ever hold.
    fn is_unusable(&self, addr: Address) -> bool {
        addr == self.cidr.network_id()
            || addr == self.cidr.broadcast()
            || Some(addr) == self.gateway
            || self.reserved.iter().any(|r| r.contains(addr))
    }

    fn is_static(&self, addr: Address) -> bool {
        self.static_ranges.iter().any(|r| r.contains(addr))
    }

    /// The pool an address belongs to, if any.
    fn pool_of(&self, addr: Address) -> Option<ReservationKind> {
        if !self.cidr.contains(addr) || self.is_unusable(addr) {
            None
        } else if self.is_static(addr) {
            Some(ReservationKind::Static)
        } else {
            Some(ReservationKind::Dynamic)
        }
    }

    /// Lowest dynamic address at or above `from` that `taken` does not hold.
    fn next_dynamic(&self, from: u64, taken: &BTreeSet<Address>) -> Option<Address> {
        let range = self.cidr.range();
        let mut candidate = from.max(u64::from(range.first));
        while candidate <= u64::from(range.last) {
            let addr = Address::try_from(candidate).ok()?;
            if let Some(skip) = self.not_dynamic.iter().find(|r| r.contains(addr)) {
                candidate = u64::from(skip.last) + 1;
            } else if taken.contains(&addr) {
                candidate += 1;
            } else {
                return Some(addr);
            }
        }
        None
    }
}

fn merge_ranges(mut ranges: Vec<AddressRange>) -> Vec<AddressRange> {
    ranges.sort_by_key(|r| r.first);
    let mut merged: Vec<AddressRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if u64::from(range.first) <= u64::from(last.last) + 1 => {
                last.last = last.last.max(range.last);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Reservation state of one subnet. Only taken addresses are stored.
#[derive(Debug, Default)]
struct SubnetUsage {
    taken: BTreeSet<Address>,
    dynamic_taken: u64,
    /// Every dynamic address below this one is taken.
    dynamic_floor: u64,
}

/// A named network with its subnets and in-memory reservation state.
///
/// State transitions are serialized behind one lock; the network lives for a
/// single deployment run.
#[derive(Debug)]
pub struct Network {
    name: String,
    subnets: Vec<Subnet>,
    usage: Mutex<Vec<SubnetUsage>>,
}

impl Network {
    /// Build a network. Overlapping subnets are rejected.
    pub fn new(name: impl Into<String>, specs: &[SubnetSpec]) -> Result<Self, NetworkError> {
        let name = name.into();
        let subnets = specs
            .iter()
            .map(|spec| Subnet::from_spec(&name, spec))
            .collect::<Result<Vec<_>, _>>()?;

        for (i, a) in subnets.iter().enumerate() {
            for b in &subnets[i + 1..] {
                if a.cidr.overlaps(&b.cidr) {
                    return Err(NetworkError::OverlappingSubnets {
                        network: name,
                        first: a.cidr.to_string(),
                        second: b.cidr.to_string(),
                    });
                }
            }
        }

        let usage = subnets.iter().map(|_| SubnetUsage::default()).collect();
        Ok(Self {
            name,
            subnets,
            usage: Mutex::new(usage),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subnets(&self) -> &[Subnet] {
        &self.subnets
    }

    fn subnet_index(&self, addr: Address) -> Option<usize> {
        self.subnets.iter().position(|s| s.cidr.contains(addr))
    }

    fn lock_usage(&self) -> std::sync::MutexGuard<'_, Vec<SubnetUsage>> {
        self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve a specific address.
    ///
    /// Returns the pool it was taken from, or `None` when the address is
    /// outside every subnet, unusable, or already reserved.
    pub fn reserve(&self, addr: Address) -> Option<ReservationKind> {
        let idx = self.subnet_index(addr)?;
        let kind = self.subnets[idx].pool_of(addr)?;
        let mut usage = self.lock_usage();
        let usage = &mut usage[idx];
        if !usage.taken.insert(addr) {
            return None;
        }
        if kind == ReservationKind::Dynamic {
            usage.dynamic_taken += 1;
        }
        Some(kind)
    }

    /// Hand out the lowest free dynamic address, scanning subnets in
    /// declaration order.
    pub fn allocate_dynamic(&self) -> Result<Address, NetworkError> {
        let mut usage = self.lock_usage();
        for (subnet, usage) in self.subnets.iter().zip(usage.iter_mut()) {
            match subnet.next_dynamic(usage.dynamic_floor, &usage.taken) {
                Some(addr) => {
                    usage.taken.insert(addr);
                    usage.dynamic_taken += 1;
                    usage.dynamic_floor = u64::from(addr) + 1;
                    return Ok(addr);
                }
                None => usage.dynamic_floor = u64::from(subnet.cidr.broadcast()) + 1,
            }
        }
        Err(NetworkError::PoolExhausted(self.name.clone()))
    }

    /// Return an address to the pool it came from.
    pub fn release(&self, addr: Address) -> Result<(), NetworkError> {
        let not_releasable = || NetworkError::NotReleasable {
            network: self.name.clone(),
            address: format_address(addr),
        };
        let idx = self.subnet_index(addr).ok_or_else(not_releasable)?;
        let kind = self.subnets[idx].pool_of(addr).ok_or_else(not_releasable)?;
        let mut usage = self.lock_usage();
        let usage = &mut usage[idx];
        if !usage.taken.remove(&addr) {
            return Err(not_releasable());
        }
        if kind == ReservationKind::Dynamic {
            usage.dynamic_taken -= 1;
            usage.dynamic_floor = usage.dynamic_floor.min(u64::from(addr));
        }
        Ok(())
    }

    /// Check that a declared static IP lies in a static range.
    pub fn validate_static(&self, addr: Address) -> Result<(), NetworkError> {
        let in_static = self
            .subnet_index(addr)
            .is_some_and(|idx| self.subnets[idx].pool_of(addr) == Some(ReservationKind::Static));
        if in_static {
            Ok(())
        } else {
            Err(NetworkError::InvalidStaticIp {
                network: self.name.clone(),
                address: format_address(addr),
            })
        }
    }

    /// Fulfil a reservation: a requested address is reserved as-is, an
    /// unassigned dynamic one gets the next free address.
    pub fn reserve_for(&self, reservation: &mut Reservation) -> Result<(), NetworkError> {
        if reservation.is_fulfilled() {
            return Ok(());
        }
        match reservation.ip {
            Some(ip) => {
                if self.reserve(ip) != Some(reservation.kind) {
                    return Err(NetworkError::ReservationFailed {
                        network: self.name.clone(),
                        address: format_address(ip),
                        kind: reservation.kind.as_str(),
                    });
                }
            }
            None => {
                if reservation.kind == ReservationKind::Static {
                    return Err(NetworkError::InvalidStaticIp {
                        network: self.name.clone(),
                        address: String::from("(none)"),
                    });
                }
                reservation.ip = Some(self.allocate_dynamic()?);
            }
        }
        reservation.reserved = true;
        Ok(())
    }

    /// Settings for an interface holding `addr` on this network.
    pub fn network_settings(
        &self,
        addr: Address,
        default: &[String],
    ) -> Result<NetworkSetting, NetworkError> {
        let idx = self
            .subnet_index(addr)
            .ok_or_else(|| NetworkError::InvalidAddress(format_address(addr)))?;
        let subnet = &self.subnets[idx];
        Ok(NetworkSetting {
            ip: format_address(addr),
            netmask: format_address(subnet.cidr.netmask()),
            gateway: subnet.gateway.map(format_address),
            dns: subnet.dns.clone(),
            cloud_properties: subnet.cloud_properties.clone(),
            default: default.to_vec(),
        })
    }

    /// Free dynamic addresses across all subnets.
    pub fn dynamic_remaining(&self) -> usize {
        let usage = self.lock_usage();
        let remaining: u64 = self
            .subnets
            .iter()
            .zip(usage.iter())
            .map(|(subnet, usage)| subnet.dynamic_capacity.saturating_sub(usage.dynamic_taken))
            .sum();
        usize::try_from(remaining).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ip(s: &str) -> Address {
        parse_address(s).unwrap()
    }

    fn subnet(range: &str) -> SubnetSpec {
        SubnetSpec {
            range: range.to_string(),
            gateway: None,
            dns: vec![],
            reserved: vec![],
            static_ips: vec![],
            cloud_properties: serde_json::Value::Null,
        }
    }

    /// 10.0.0.0/28: gateway .1, reserved .2-.3, static .4-.7, dynamic .8-.14.
    fn small_network() -> Network {
        let spec = SubnetSpec {
            gateway: Some("10.0.0.1".into()),
            dns: vec!["10.0.0.2".into()],
            reserved: vec!["10.0.0.2 - 10.0.0.3".into()],
            static_ips: vec!["10.0.0.4 - 10.0.0.7".into()],
            ..subnet("10.0.0.0/28")
        };
        Network::new("default", &[spec]).unwrap()
    }

    #[test]
    fn test_reserve_classifies_pools() {
        let net = small_network();
        assert_eq!(net.reserve(ip("10.0.0.5")), Some(ReservationKind::Static));
        assert_eq!(net.reserve(ip("10.0.0.9")), Some(ReservationKind::Dynamic));
    }

    #[test]
    fn test_reserve_rejects_unusable_addresses() {
        let net = small_network();
        assert_eq!(net.reserve(ip("10.0.0.0")), None, "network id");
        assert_eq!(net.reserve(ip("10.0.0.1")), None, "gateway");
        assert_eq!(net.reserve(ip("10.0.0.3")), None, "reserved");
        assert_eq!(net.reserve(ip("10.0.0.15")), None, "broadcast");
        assert_eq!(net.reserve(ip("10.0.1.9")), None, "outside");
    }

    #[test]
    fn test_duplicate_reservation_returns_none() {
        let net = small_network();
        assert!(net.reserve(ip("10.0.0.9")).is_some());
        assert_eq!(net.reserve(ip("10.0.0.9")), None);
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let net = small_network();
        let allocated: Vec<_> = (0..7).map(|_| net.allocate_dynamic().unwrap()).collect();
        assert_eq!(allocated.first(), Some(&ip("10.0.0.8")));
        assert_eq!(allocated.last(), Some(&ip("10.0.0.14")));
        let err = net.allocate_dynamic().unwrap_err();
        assert!(err.is_capacity_error());
    }

    #[test]
    fn test_allocate_scans_subnets_in_order() {
        let net = Network::new("two", &[subnet("10.0.1.0/30"), subnet("10.0.0.0/30")]).unwrap();
        assert_eq!(net.allocate_dynamic().unwrap(), ip("10.0.1.1"));
        assert_eq!(net.allocate_dynamic().unwrap(), ip("10.0.1.2"));
        assert_eq!(net.allocate_dynamic().unwrap(), ip("10.0.0.1"));
    }

    #[test]
    fn test_reserve_release_reserve_round_trip() {
        let net = small_network();
        for addr in [ip("10.0.0.5"), ip("10.0.0.10")] {
            let kind = net.reserve(addr).unwrap();
            net.release(addr).unwrap();
            assert_eq!(net.reserve(addr), Some(kind));
        }
    }

    #[test]
    fn test_release_unknown_address_fails() {
        let net = small_network();
        assert!(net.release(ip("10.0.0.1")).is_err());
        assert!(net.release(ip("192.168.0.1")).is_err());
        // Never reserved.
        assert!(net.release(ip("10.0.0.12")).is_err());
    }

    #[test]
    fn test_large_subnet_allocates_lazily() {
        let spec = SubnetSpec {
            gateway: Some("10.0.0.1".into()),
            static_ips: vec!["10.0.0.2 - 10.0.255.255".into()],
            ..subnet("10.0.0.0/8")
        };
        let net = Network::new("wide", &[spec]).unwrap();
        // 10.0.0.0 - 10.0.255.255 and the broadcast address are excluded.
        let capacity = (1 << 24) - 65_537;
        assert_eq!(net.dynamic_remaining(), capacity);
        assert_eq!(net.allocate_dynamic().unwrap(), ip("10.1.0.0"));
        assert_eq!(net.reserve(ip("10.0.0.9")), Some(ReservationKind::Static));
        assert_eq!(net.dynamic_remaining(), capacity - 1);
    }

    #[test]
    fn test_released_address_is_handed_out_first() {
        let net = small_network();
        let first = net.allocate_dynamic().unwrap();
        assert_eq!(net.allocate_dynamic().unwrap(), ip("10.0.0.9"));
        net.release(first).unwrap();
        assert_eq!(net.allocate_dynamic().unwrap(), first);
        assert_eq!(net.allocate_dynamic().unwrap(), ip("10.0.0.10"));
        assert_eq!(net.dynamic_remaining(), 4);
    }

    #[test]
    fn test_overlapping_subnets_rejected() {
        let err = Network::new("dup", &[subnet("10.0.0.0/24"), subnet("10.0.0.128/25")])
            .unwrap_err();
        assert!(matches!(err, NetworkError::OverlappingSubnets { .. }));
    }

    #[test]
    fn test_gateway_outside_subnet_rejected() {
        let spec = SubnetSpec {
            gateway: Some("10.0.1.1".into()),
            ..subnet("10.0.0.0/24")
        };
        assert!(matches!(
            Network::new("bad", &[spec]).unwrap_err(),
            NetworkError::OutsideSubnet { .. }
        ));
    }

    #[test]
    fn test_validate_static() {
        let net = small_network();
        assert!(net.validate_static(ip("10.0.0.6")).is_ok());
        assert!(matches!(
            net.validate_static(ip("10.0.0.10")).unwrap_err(),
            NetworkError::InvalidStaticIp { .. }
        ));
    }

    #[test]
    fn test_reserve_for_static_and_dynamic() {
        let net = small_network();
        let mut fixed = Reservation::static_ip(ip("10.0.0.4"));
        net.reserve_for(&mut fixed).unwrap();
        assert!(fixed.is_fulfilled());

        let mut again = Reservation::static_ip(ip("10.0.0.4"));
        assert!(matches!(
            net.reserve_for(&mut again).unwrap_err(),
            NetworkError::ReservationFailed { .. }
        ));

        let mut any = Reservation::dynamic();
        net.reserve_for(&mut any).unwrap();
        assert_eq!(any.ip, Some(ip("10.0.0.8")));
    }

    #[test]
    fn test_network_settings() {
        let net = small_network();
        let settings = net
            .network_settings(ip("10.0.0.9"), &["dns".to_string()])
            .unwrap();
        assert_eq!(settings.ip, "10.0.0.9");
        assert_eq!(settings.netmask, "255.255.255.240");
        assert_eq!(settings.gateway.as_deref(), Some("10.0.0.1"));
        assert_eq!(settings.dns, vec!["10.0.0.2".to_string()]);
        assert_eq!(settings.default, vec!["dns".to_string()]);
    }

    proptest! {
        #[test]
        fn dynamic_allocation_never_returns_static_or_reserved(count in 0usize..=7) {
            let net = small_network();
            for _ in 0..count {
                let addr = net.allocate_dynamic().unwrap();
                prop_assert!((ip("10.0.0.8")..=ip("10.0.0.14")).contains(&addr));
            }
            prop_assert_eq!(net.dynamic_remaining(), 7 - count);
        }

        #[test]
        fn allocation_is_unique(prefix in 26u8..=29) {
            let net = Network::new("p", &[subnet(&format!("10.1.0.0/{}", prefix))]).unwrap();
            let total = (1usize << (32 - prefix)) - 2;
            let mut seen = BTreeSet::new();
            for _ in 0..total {
                prop_assert!(seen.insert(net.allocate_dynamic().unwrap()));
            }
            prop_assert!(net.allocate_dynamic().is_err());
        }
    }
}
