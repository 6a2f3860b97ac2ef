//! CIDR blocks and ordinal arithmetic.
//!
//! A [`Cidr`] is always stored in canonical form: the address is the network
//! address of the block. Ordinals are zero-based host offsets from that
//! network address, which is how the bitmap layer indexes addresses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Errors produced while parsing or building a CIDR block
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CidrError {
    #[error("invalid CIDR notation: {0}")]
    Syntax(String),

    #[error("prefix length {prefix} exceeds {max} bits")]
    PrefixTooLong { prefix: u8, max: u8 },
}

/// A network block in canonical (masked) form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

/// A single address together with the prefix length of its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssignedAddress {
    pub ip: IpAddr,
    pub prefix_len: u8,
}

impl fmt::Display for AssignedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

fn family_bits(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn to_u128(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(*v4) as u128,
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn from_u128(value: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(Ipv4Addr::from(value as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(value))
    }
}

impl Cidr {
    /// Build a block from any address inside it; host bits are cleared.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, CidrError> {
        let max = family_bits(&addr);
        if prefix > max {
            return Err(CidrError::PrefixTooLong { prefix, max });
        }
        let mut cidr = Cidr { network: addr, prefix };
        cidr.network = from_u128(to_u128(&addr) & cidr.mask(), cidr.is_ipv4());
        Ok(cidr)
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix
    }

    pub fn is_ipv4(&self) -> bool {
        self.network.is_ipv4()
    }

    /// Number of host bits in the block
    pub fn host_bits(&self) -> u8 {
        family_bits(&self.network) - self.prefix
    }

    fn mask(&self) -> u128 {
        let width = family_bits(&self.network) as u32;
        let host = width - self.prefix as u32;
        let full = if width == 128 { u128::MAX } else { (1u128 << width) - 1 };
        if host >= 128 {
            0
        } else {
            full & !((1u128 << host) - 1)
        }
    }

    /// Whether `ip` belongs to this block. Addresses of the other family never do.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        if ip.is_ipv4() != self.is_ipv4() {
            return false;
        }
        to_u128(ip) & self.mask() == to_u128(&self.network)
    }

    /// Address-range intersection test between two blocks
    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.contains(&other.network) || other.contains(&self.network)
    }

    /// Whether `other` lies entirely within this block
    pub fn contains_cidr(&self, other: &Cidr) -> bool {
        other.prefix >= self.prefix && self.contains(&other.network)
    }

    /// Last address of the block
    pub fn broadcast(&self) -> IpAddr {
        let value = to_u128(&self.network) | !self.mask();
        let value = if self.is_ipv4() { value & u32::MAX as u128 } else { value };
        from_u128(value, self.is_ipv4())
    }

    /// Host offset of `ip` from the network address, ignoring whether it fits a bitmap.
    pub fn host_part(&self, ip: &IpAddr) -> Option<u128> {
        if !self.contains(ip) {
            return None;
        }
        Some(to_u128(ip) & !self.mask())
    }

    /// Ordinal of `ip` within this block, if it is inside and addressable by a 64-bit ordinal.
    pub fn ordinal_of(&self, ip: &IpAddr) -> Option<u64> {
        self.host_part(ip).and_then(|h| u64::try_from(h).ok())
    }

    /// The address `ordinal` positions past the network address.
    pub fn address_at(&self, ordinal: u64) -> IpAddr {
        let value = to_u128(&self.network).wrapping_add(ordinal as u128);
        from_u128(value, self.is_ipv4())
    }

    /// Number of bitmap slots needed for the block.
    ///
    /// Blocks with 64 or more host bits saturate at `u64::MAX`: the natural
    /// `1 << 64` would wrap to zero and leave a degenerate allocator.
    pub fn ordinal_capacity(&self) -> u64 {
        let host = self.host_bits() as u32;
        if host >= 64 {
            u64::MAX
        } else {
            1u64 << host
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| CidrError::Syntax(s.to_string()))?;
        let addr: IpAddr = addr.parse().map_err(|_| CidrError::Syntax(s.to_string()))?;
        let prefix: u8 = prefix.parse().map_err(|_| CidrError::Syntax(s.to_string()))?;
        Cidr::new(addr, prefix)
    }
}

impl From<Cidr> for String {
    fn from(c: Cidr) -> Self {
        c.to_string()
    }
}

impl TryFrom<String> for Cidr {
    type Error = CidrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
