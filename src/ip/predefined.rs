//! Predefined pool catalogs.
//!
//! The local catalog is coarse (/16 and /20 blocks) for host-scoped networks;
//! the global catalog is granular (/24 blocks) for overlay networks that must
//! coexist across many hosts.

use std::net::{IpAddr, Ipv4Addr};

use super::cidr::{Cidr, CidrError};

/// `172.17.0.0/16`..`172.31.0.0/16`, then `192.168.0.0/20`..`192.168.240.0/20`
pub fn broad_networks() -> Vec<Cidr> {
    let mut pools = Vec::with_capacity(31);
    for i in 17..32u8 {
        pools.push(v4_block([172, i, 0, 0], 16));
    }
    for i in 0..16u8 {
        pools.push(v4_block([192, 168, i << 4, 0], 20));
    }
    pools
}

/// Every `10.x.y.0/24`
pub fn granular_networks() -> Vec<Cidr> {
    let mut pools = Vec::with_capacity(256 * 256);
    for i in 0..=255u8 {
        for j in 0..=255u8 {
            pools.push(v4_block([10, i, j, 0], 24));
        }
    }
    pools
}

fn v4_block(octets: [u8; 4], prefix: u8) -> Cidr {
    Cidr::new(IpAddr::V4(Ipv4Addr::from(octets)), prefix).expect("Invalid catalog prefix")
}

/// Parse a user-supplied catalog, keeping list order.
pub fn parse_catalog(entries: &[String]) -> Result<Vec<Cidr>, CidrError> {
    entries.iter().map(|e| e.parse()).collect()
}
