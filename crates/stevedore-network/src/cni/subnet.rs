//! CIDR arithmetic for subnet validation and allocation.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use stevedore_common::error::{Result, StevedoreError};

/// Pool new IPv4 networks are carved from, one /24 at a time.
const FREE_POOL: Ipv4Addr = Ipv4Addr::new(10, 89, 0, 0);
const FREE_POOL_PREFIX: u8 = 16;
const ALLOCATED_PREFIX: u8 = 24;

/// A parsed network range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Parses `a.b.c.d/n` or an IPv6 equivalent.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Network` for malformed ranges or ranges
    /// whose address is not the network address.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |reason: &str| StevedoreError::Network {
            message: format!("invalid subnet {value:?}: {reason}"),
        };
        let (addr, prefix) = value
            .split_once('/')
            .ok_or_else(|| invalid("missing prefix length"))?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid("bad address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid("bad prefix length"))?;
        if prefix > bits(addr) {
            return Err(invalid("prefix length out of range"));
        }
        let cidr = Self { addr, prefix };
        if cidr.network() != to_u128(addr) {
            return Err(invalid("host bits are set"));
        }
        Ok(cidr)
    }

    /// Whether this is an IPv6 range.
    #[must_use]
    pub const fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// Whether the two ranges share any address.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.is_ipv6() != other.is_ipv6() {
            return false;
        }
        let prefix = self.prefix.min(other.prefix);
        let mask = mask(self.addr, prefix);
        to_u128(self.addr) & mask == to_u128(other.addr) & mask
    }

    /// Whether `ip` lies inside the range.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        ip.is_ipv6() == self.is_ipv6() && to_u128(ip) & mask(ip, self.prefix) == self.network()
    }

    /// The first usable host address, used as default gateway.
    #[must_use]
    pub fn first_host(&self) -> IpAddr {
        from_u128(self.addr, self.network() + 1)
    }

    fn network(&self) -> u128 {
        to_u128(self.addr) & mask(self.addr, self.prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Returns the first /24 of the free pool not overlapping `used`.
///
/// # Errors
///
/// Returns `StevedoreError::Network` once the pool is exhausted.
pub fn next_free_ipv4(used: &[Cidr]) -> Result<Cidr> {
    let base = u32::from(FREE_POOL);
    let count = 1u32 << (ALLOCATED_PREFIX - FREE_POOL_PREFIX);
    (0..count)
        .map(|i| Cidr {
            addr: IpAddr::V4(Ipv4Addr::from(base + (i << (32 - ALLOCATED_PREFIX)))),
            prefix: ALLOCATED_PREFIX,
        })
        .find(|candidate| !used.iter().any(|u| u.overlaps(candidate)))
        .ok_or_else(|| StevedoreError::Network {
            message: format!("no free subnet left in {FREE_POOL}/{FREE_POOL_PREFIX}"),
        })
}

const fn bits(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask(addr: IpAddr, prefix: u8) -> u128 {
    let width = u32::from(bits(addr));
    let all = if width == 128 { u128::MAX } else { (1u128 << width) - 1 };
    if prefix == 0 {
        0
    } else {
        all & !((1u128 << (width - u32::from(prefix))) - 1)
    }
}

fn to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_u128(like: IpAddr, value: u128) -> IpAddr {
    match like {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(u32::try_from(value).unwrap_or(u32::MAX))),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
    }
}
