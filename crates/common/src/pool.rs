//! Address allocation from the hub's private CIDR pool
//!
//! Allocation is a pure function of the pool and a snapshot of used
//! addresses supplied by the caller. The lowest free host always wins so
//! that allocations are reproducible.

use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;

/// Smallest accepted prefix length
pub const MIN_PREFIX: u8 = 8;

/// Largest accepted prefix length
pub const MAX_PREFIX: u8 = 30;

/// Host offsets skipped at the bottom of the range (the network address)
pub const DEFAULT_RESERVE_FIRST: u32 = 1;

/// A validated IPv4 address pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    network: Ipv4Network,
}

impl AddressPool {
    /// Wrap a network, normalizing it to its network address
    pub fn new(network: Ipv4Network) -> Result<Self> {
        let prefix = network.prefix();
        if !(MIN_PREFIX..=MAX_PREFIX).contains(&prefix) {
            return Err(Error::InvalidCidr {
                cidr: network.to_string(),
                reason: format!("prefix must be between /{} and /{}", MIN_PREFIX, MAX_PREFIX),
            });
        }
        let network = Ipv4Network::new(network.network(), prefix)?;
        Ok(Self { network })
    }

    /// Parse dotted-quad CIDR notation such as `10.0.1.0/24`
    pub fn parse(cidr: &str) -> Result<Self> {
        let (addr, prefix) = cidr.trim().split_once('/').ok_or_else(|| Error::InvalidCidr {
            cidr: cidr.to_string(),
            reason: "missing prefix length".to_string(),
        })?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| Error::InvalidCidr {
            cidr: cidr.to_string(),
            reason: "network address is not a dotted quad".to_string(),
        })?;
        let prefix: u8 = prefix.parse().map_err(|_| Error::InvalidCidr {
            cidr: cidr.to_string(),
            reason: "prefix length is not a number".to_string(),
        })?;
        if prefix > 32 {
            return Err(Error::InvalidCidr {
                cidr: cidr.to_string(),
                reason: "prefix length exceeds 32".to_string(),
            });
        }
        Self::new(Ipv4Network::new(addr, prefix)?)
    }

    pub fn network(&self) -> Ipv4Network {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.network.prefix()
    }

    /// Number of addresses in the block, network and broadcast included
    fn block_size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix()))
    }

    /// Exclusive upper bound for allocatable host offsets.
    ///
    /// The broadcast address and the host directly below it are never handed
    /// out, so a /30 yields exactly one spoke address.
    fn offset_limit(&self) -> u64 {
        self.block_size() - 2
    }

    /// The hub's own interface address: the first usable host
    pub fn hub_address(&self) -> Ipv4Network {
        self.at_offset(1)
    }

    fn at_offset(&self, offset: u64) -> Ipv4Network {
        let base = u64::from(u32::from(self.network.network()));
        let ip = Ipv4Addr::from((base + offset) as u32);
        // Prefix was validated on construction
        Ipv4Network::new(ip, self.prefix()).unwrap_or(self.network)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(addr)
    }

    /// True for the network and broadcast addresses of the block
    pub fn is_reserved(&self, addr: Ipv4Addr) -> bool {
        addr == self.network.network() || addr == self.network.broadcast()
    }

    /// Number of offsets `allocate` may return with the given reservation
    pub fn capacity(&self, reserve_first: u32) -> u64 {
        self.offset_limit().saturating_sub(u64::from(reserve_first))
    }

    /// Return the lowest free host address, carrying the pool's prefix
    pub fn allocate(&self, used: &HashSet<Ipv4Addr>, reserve_first: u32) -> Result<Ipv4Network> {
        for offset in u64::from(reserve_first)..self.offset_limit() {
            let candidate = self.at_offset(offset);
            if !used.contains(&candidate.ip()) {
                return Ok(candidate);
            }
        }
        Err(Error::PoolExhausted(self.network.to_string()))
    }
}

/// Allocate from a textual CIDR and a list of used addresses.
///
/// Entries in `used` may carry a `/prefix` suffix; it is ignored.
pub fn allocate<S: AsRef<str>>(cidr: &str, used: &[S], reserve_first: u32) -> Result<Ipv4Network> {
    let pool = AddressPool::parse(cidr)?;
    let used: HashSet<Ipv4Addr> = used
        .iter()
        .filter_map(|entry| strip_prefix(entry.as_ref()).parse().ok())
        .collect();
    pool.allocate(&used, reserve_first)
}

/// Drop an optional `/prefix` suffix
pub fn strip_prefix(address: &str) -> &str {
    address.split('/').next().unwrap_or(address).trim()
}

/// Dotted-quad syntax check; a trailing `/prefix` is tolerated
pub fn is_valid_address(address: &str) -> bool {
    let mut parts = address.trim().splitn(2, '/');
    let ip_ok = parts
        .next()
        .map(|ip| ip.parse::<Ipv4Addr>().is_ok())
        .unwrap_or(false);
    let prefix_ok = parts
        .next()
        .map(|p| p.parse::<u8>().map(|p| p <= 32).unwrap_or(false))
        .unwrap_or(true);
    ip_ok && prefix_ok
}

/// Whether `address` shares the network bits of `cidr`
pub fn is_in_network(address: &str, cidr: &str) -> bool {
    let Ok(network) = cidr.trim().parse::<Ipv4Network>() else {
        return false;
    };
    let Ok(ip) = strip_prefix(address).parse::<Ipv4Addr>() else {
        return false;
    };
    let mask = u32::from(network.mask());
    u32::from(network.ip()) & mask == u32::from(ip) & mask
}

/// Allocated addresses as they come out of storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredAddresses {
    /// JSON-encoded list, e.g. `["10.0.1.2/24"]`
    Encoded(String),
    /// Already-decoded list
    List(Vec<String>),
}

/// Flatten heterogeneous allocation records into one set of host addresses
pub fn flatten_allocated<I>(records: I) -> Result<BTreeSet<Ipv4Addr>>
where
    I: IntoIterator<Item = StoredAddresses>,
{
    let mut out = BTreeSet::new();
    for record in records {
        let entries = match record {
            StoredAddresses::Encoded(text) if text.trim().is_empty() => Vec::new(),
            StoredAddresses::Encoded(text) => serde_json::from_str::<Vec<String>>(&text)?,
            StoredAddresses::List(list) => list,
        };
        for entry in entries {
            let ip: Ipv4Addr = strip_prefix(&entry)
                .parse()
                .map_err(|_| Error::InvalidAddress(entry.clone()))?;
            out.insert(ip);
        }
    }
    Ok(out)
}
