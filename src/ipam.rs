// Per-subnet IPv4/IPv6 address allocator. One process-wide instance is
// shared by every caller; pools are keyed by subnet so concurrent callers on
// different subnets cannot collide.
//
// Allocation policy: a free preferred address is honored exactly; otherwise
// the lowest free host address is handed out, never the network or broadcast
// address nor a reserved gateway.

use std::collections::BTreeSet;
use std::net::IpAddr;

use dashmap::DashMap;
use ipnet::IpNet;

use crate::error::{BridgeError, BridgeResult};

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn u128_to_ip(subnet: &IpNet, value: u128) -> IpAddr {
    match subnet {
        IpNet::V4(_) => IpAddr::from(std::net::Ipv4Addr::from(value as u32)),
        IpNet::V6(_) => IpAddr::from(std::net::Ipv6Addr::from(value)),
    }
}

#[derive(Debug, Default)]
struct Pool {
    allocated: BTreeSet<u128>,
    reserved: BTreeSet<u128>,
}

/// Process-wide IP allocator, keyed by subnet.
#[derive(Debug, Default)]
pub struct IpAllocator {
    pools: DashMap<IpNet, Pool>,
}

impl IpAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(subnet: IpNet) -> IpNet {
        subnet.trunc()
    }

    /// Host-address bounds of a subnet, excluding network and broadcast.
    fn host_range(subnet: &IpNet) -> (u128, u128) {
        let network = ip_to_u128(subnet.network());
        let hosts = match subnet {
            IpNet::V4(n) => 1u128 << (32 - n.prefix_len()),
            // A v6 prefix of 0 would overflow the shift; the pool is
            // unbounded for practical purposes either way.
            IpNet::V6(n) if n.prefix_len() == 0 => u128::MAX,
            IpNet::V6(n) => 1u128 << (128 - n.prefix_len()),
        };
        (
            network + 1,
            network.saturating_add(hosts.saturating_sub(2)),
        )
    }

    /// Create the pool for a subnet if it does not exist yet.
    pub fn register_subnet(&self, subnet: IpNet) {
        self.pools.entry(Self::key(subnet)).or_default();
    }

    /// Mark an address (typically the gateway) as never allocatable.
    pub fn reserve(&self, subnet: IpNet, ip: IpAddr) -> BridgeResult<()> {
        let key = Self::key(subnet);
        if !key.contains(&ip) {
            return Err(BridgeError::IpOutOfRange { subnet: key, addr: ip });
        }
        self.pools
            .entry(key)
            .or_default()
            .reserved
            .insert(ip_to_u128(ip));
        Ok(())
    }

    /// Grant an address from the subnet's pool. A free `preferred` address is
    /// returned exactly; otherwise the lowest free host address wins.
    pub fn request(&self, subnet: IpNet, preferred: Option<IpAddr>) -> BridgeResult<IpAddr> {
        let key = Self::key(subnet);
        let (first, last) = Self::host_range(&key);
        let mut pool = self.pools.entry(key).or_default();

        if let Some(want) = preferred {
            if !key.contains(&want) {
                return Err(BridgeError::IpOutOfRange { subnet: key, addr: want });
            }
            let v = ip_to_u128(want);
            if (first..=last).contains(&v)
                && !pool.allocated.contains(&v)
                && !pool.reserved.contains(&v)
            {
                pool.allocated.insert(v);
                return Ok(want);
            }
        }

        let mut candidate = first;
        while candidate <= last {
            if !pool.allocated.contains(&candidate) && !pool.reserved.contains(&candidate) {
                pool.allocated.insert(candidate);
                return Ok(u128_to_ip(&key, candidate));
            }
            candidate += 1;
        }

        Err(BridgeError::NoAvailableIps(key))
    }

    /// Return an address to its pool. Releasing an address that was never
    /// allocated is a no-op; releasing into an unknown subnet is an error.
    pub fn release(&self, subnet: IpNet, ip: IpAddr) -> BridgeResult<()> {
        let key = Self::key(subnet);
        match self.pools.get_mut(&key) {
            Some(mut pool) => {
                pool.allocated.remove(&ip_to_u128(ip));
                Ok(())
            }
            None => Err(BridgeError::UnknownSubnet(key)),
        }
    }

    /// Number of live allocations in a subnet (zero for unknown subnets).
    pub fn allocated_count(&self, subnet: IpNet) -> usize {
        self.pools
            .get(&Self::key(subnet))
            .map(|p| p.allocated.len())
            .unwrap_or(0)
    }

    pub fn is_allocated(&self, subnet: IpNet, ip: IpAddr) -> bool {
        self.pools
            .get(&Self::key(subnet))
            .map(|p| p.allocated.contains(&ip_to_u128(ip)))
            .unwrap_or(false)
    }
}
