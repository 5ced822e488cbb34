pub mod error;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;

pub use error::IpamError;

/// A pool of candidate host addresses to allocate from (§4.1). The node pool
/// is the full host range of `network_cidr` minus the reserved set; the
/// client sub-pool is the contiguous `[start, end]` range of the last octet,
/// still bounded by `network_cidr` and the reserved set.
#[derive(Debug, Clone)]
pub struct Pool {
    pub network_cidr: Ipv4Net,
    pub reserved: HashSet<Ipv4Addr>,
    /// `Some((start, end))` restricts the pool to that inclusive range of the
    /// last octet (the client sub-pool); `None` means the full host range.
    pub last_octet_range: Option<(u8, u8)>,
}

impl Pool {
    pub fn node_pool(network_cidr: Ipv4Net, gateway: Ipv4Addr) -> Self {
        let mut reserved = HashSet::new();
        reserved.insert(network_cidr.network());
        reserved.insert(network_cidr.broadcast());
        reserved.insert(gateway);
        Pool {
            network_cidr,
            reserved,
            last_octet_range: None,
        }
    }

    pub fn client_pool(network_cidr: Ipv4Net, gateway: Ipv4Addr, start: u8, end: u8) -> Self {
        let mut pool = Self::node_pool(network_cidr, gateway);
        pool.last_octet_range = Some((start, end));
        pool
    }

    fn in_range(&self, addr: Ipv4Addr) -> bool {
        if !self.network_cidr.contains(&addr) {
            return false;
        }
        if self.reserved.contains(&addr) {
            return false;
        }
        if let Some((start, end)) = self.last_octet_range {
            let last = addr.octets()[3];
            if last < start || last > end {
                return false;
            }
        }
        true
    }

    /// All candidate addresses in this pool, in ascending numeric order.
    fn candidates(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.network_cidr.hosts().filter(move |a| self.in_range(*a))
    }

    pub fn total_hosts(&self) -> usize {
        self.candidates().count()
    }
}

/// Returns the numerically lowest address in `pool` not present in `taken`.
/// `taken` is the caller's already-assembled set of addresses held by any
/// Node or ClientDevice (including revoked ones — §9 IP release policy).
pub fn first_free(pool: &Pool, taken: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr, IpamError> {
    pool.candidates()
        .find(|addr| !taken.contains(addr))
        .ok_or(IpamError::PoolExhausted)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_hosts: usize,
    pub used: usize,
    pub available: usize,
    pub utilization_percent: f64,
    pub reserved: Vec<Ipv4Addr>,
}

pub fn stats(pool: &Pool, taken: &HashSet<Ipv4Addr>) -> PoolStats {
    let total_hosts = pool.total_hosts();
    let used = pool.candidates().filter(|a| taken.contains(a)).count();
    let available = total_hosts.saturating_sub(used);
    let utilization_percent = if total_hosts == 0 {
        0.0
    } else {
        (used as f64 / total_hosts as f64) * 100.0
    };
    let mut reserved: Vec<Ipv4Addr> = pool.reserved.iter().copied().collect();
    reserved.sort();
    PoolStats {
        total_hosts,
        used,
        available,
        utilization_percent,
        reserved,
    }
}

/// Normalizes an address given in `a.b.c.d/n` form by stripping the prefix,
/// and validates it lies within `network_cidr` and outside the reserved set.
pub fn validate_address(pool: &Pool, input: &str) -> Result<Ipv4Addr, IpamError> {
    let addr: Ipv4Addr = match input.split('/').next() {
        Some(host) => host.parse().map_err(|_| IpamError::InvalidAddress)?,
        None => return Err(IpamError::InvalidAddress),
    };
    if !pool.network_cidr.contains(&addr) {
        return Err(IpamError::OutsideNetwork);
    }
    if pool.reserved.contains(&addr) {
        return Err(IpamError::Reserved);
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_pool() -> Pool {
        Pool::node_pool("10.0.0.0/24".parse().unwrap(), "10.0.0.1".parse().unwrap())
    }

    #[test]
    fn first_free_skips_reserved_and_taken() {
        let pool = node_pool();
        let mut taken = HashSet::new();
        taken.insert("10.0.0.2".parse().unwrap());

        let free = first_free(&pool, &taken).unwrap();
        assert_eq!(free, "10.0.0.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn exhausted_pool_of_one_host() {
        // /30 network: 10.0.0.0/30 -> hosts 10.0.0.1, 10.0.0.2 (network .0, broadcast .3)
        let cidr: Ipv4Net = "10.0.0.0/30".parse().unwrap();
        let gateway: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let pool = Pool::node_pool(cidr, gateway); // reserves network, broadcast, gateway -> only .2 left

        let taken = HashSet::new();
        let free = first_free(&pool, &taken).unwrap();
        assert_eq!(free, "10.0.0.2".parse::<Ipv4Addr>().unwrap());

        let mut taken = HashSet::new();
        taken.insert(free);
        let err = first_free(&pool, &taken).unwrap_err();
        assert!(matches!(err, IpamError::PoolExhausted));
    }

    #[test]
    fn client_pool_restricts_last_octet() {
        let pool = Pool::client_pool(
            "10.0.0.0/24".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            200,
            201,
        );
        let taken = HashSet::new();
        let free = first_free(&pool, &taken).unwrap();
        assert_eq!(free, "10.0.0.200".parse::<Ipv4Addr>().unwrap());

        let mut taken = HashSet::new();
        taken.insert("10.0.0.200".parse().unwrap());
        let free = first_free(&pool, &taken).unwrap();
        assert_eq!(free, "10.0.0.201".parse::<Ipv4Addr>().unwrap());

        let mut taken = HashSet::new();
        taken.insert("10.0.0.200".parse().unwrap());
        taken.insert("10.0.0.201".parse().unwrap());
        assert!(matches!(
            first_free(&pool, &taken).unwrap_err(),
            IpamError::PoolExhausted
        ));
    }

    #[test]
    fn validate_strips_prefix_and_checks_bounds() {
        let pool = node_pool();
        assert_eq!(
            validate_address(&pool, "10.0.0.5/24").unwrap(),
            "10.0.0.5".parse::<Ipv4Addr>().unwrap()
        );
        assert!(matches!(
            validate_address(&pool, "10.0.0.1").unwrap_err(),
            IpamError::Reserved
        ));
        assert!(matches!(
            validate_address(&pool, "10.0.1.5").unwrap_err(),
            IpamError::OutsideNetwork
        ));
    }
}
