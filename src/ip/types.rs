//! Pool identities and pool records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::cidr::Cidr;
use crate::error::IpamError;

/// Composite key naming a pool: `{address space, subnet, child subnet}`.
///
/// The string form (`AS/subnet` or `AS/subnet/child`) is the public pool id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SubnetKey {
    pub address_space: String,
    pub subnet: String,
    pub child_subnet: String,
}

impl SubnetKey {
    pub fn new(address_space: &str, subnet: &str, child_subnet: &str) -> Self {
        SubnetKey {
            address_space: address_space.to_string(),
            subnet: subnet.to_string(),
            child_subnet: child_subnet.to_string(),
        }
    }

    /// Key of the root pool this key's subnet belongs to
    pub fn root(&self) -> SubnetKey {
        SubnetKey {
            address_space: self.address_space.clone(),
            subnet: self.subnet.clone(),
            child_subnet: String::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.child_subnet.is_empty()
    }
}

impl fmt::Display for SubnetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.child_subnet.is_empty() {
            write!(f, "{}/{}", self.address_space, self.subnet)
        } else {
            write!(f, "{}/{}/{}", self.address_space, self.subnet, self.child_subnet)
        }
    }
}

impl FromStr for SubnetKey {
    type Err = IpamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 && parts.len() != 5 {
            return Err(IpamError::BadRequest(format!("invalid string form for subnet key: {}", s)));
        }
        if parts[0].is_empty() {
            return Err(IpamError::BadRequest(format!("missing address space in subnet key: {}", s)));
        }
        let child_subnet = if parts.len() == 5 {
            format!("{}/{}", parts[3], parts[4])
        } else {
            String::new()
        };
        Ok(SubnetKey {
            address_space: parts[0].to_string(),
            subnet: format!("{}/{}", parts[1], parts[2]),
            child_subnet,
        })
    }
}

impl From<SubnetKey> for String {
    fn from(k: SubnetKey) -> Self {
        k.to_string()
    }
}

impl TryFrom<String> for SubnetKey {
    type Error = IpamError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Ordinal window `[start, end]` of a sub-pool within its root pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub sub: Cidr,
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    /// Compute the window `sub` occupies inside `master`.
    pub fn within(sub: Cidr, master: &Cidr) -> Result<Self, IpamError> {
        if !master.contains_cidr(&sub) {
            return Err(IpamError::InvalidSubPool);
        }
        let start = master
            .ordinal_of(&sub.network())
            .ok_or_else(|| IpamError::Internal(format!("failed to compute range's lowest ip address for {}", sub)))?;
        let end = master
            .ordinal_of(&sub.broadcast())
            .ok_or_else(|| IpamError::Internal(format!("failed to compute range's highest ip address for {}", sub)))?;
        Ok(AddressRange { sub, start, end })
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub: {}, range [{}, {}]", self.sub, self.start, self.end)
    }
}

/// One reserved pool: a root subnet (no range) or a range inside a root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<SubnetKey>,
    pub pool: Cidr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<AddressRange>,
    pub ref_count: u32,
}

impl PoolData {
    pub fn root(pool: Cidr) -> Self {
        PoolData { parent_key: None, pool, range: None, ref_count: 1 }
    }

    pub fn derived(parent_key: SubnetKey, pool: Cidr, range: AddressRange) -> Self {
        PoolData { parent_key: Some(parent_key), pool, range: Some(range), ref_count: 1 }
    }

    pub fn is_root(&self) -> bool {
        self.range.is_none()
    }
}

impl fmt::Display for PoolData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parent = self.parent_key.as_ref().map(|k| k.to_string()).unwrap_or_default();
        let range = self.range.as_ref().map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "ParentKey: {}, Pool: {}, Range: {}, RefCount: {}",
            parent, self.pool, range, self.ref_count
        )
    }
}
