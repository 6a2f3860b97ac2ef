//! DHCP lease side path.
//!
//! An address request that carries both the `dhcp_interface` option and an
//! endpoint MAC address is answered by a DHCP lease obtained over that
//! interface instead of the pool bitmap. A `parent.vid` interface that does not
//! exist yet is created as a VLAN sub-interface of `parent` first.
//!
//! Host manipulation sits behind [`HostNetwork`]; the default
//! [`NoHostNetwork`] reports the path as unavailable.

use regex::Regex;
use std::fmt;
use std::net::IpAddr;
use std::sync::LazyLock;

use crate::error::IpamError;

/// Option naming the interface to lease addresses on (`--ipam-opt dhcp_interface=eth0.10`)
pub const DHCP_INTERFACE: &str = "dhcp_interface";
/// Option carrying the endpoint MAC address
pub const MAC_ADDRESS: &str = "com.docker.network.endpoint.macaddress";

static VLAN_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^.]+)\.([^.]+)$").expect("Invalid vlan name regex"));

/// A VLAN sub-interface request, parsed from `parent.vid`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanLink {
    pub name: String,
    pub parent: String,
    pub vlan_id: u16,
}

/// Host-side operations the DHCP path needs
pub trait HostNetwork: Send + Sync + fmt::Debug {
    fn link_exists(&self, name: &str) -> bool;

    fn create_vlan_link(&self, link: &VlanLink) -> Result<(), IpamError>;

    fn request_lease(&self, mac: &str, interface: &str) -> Result<IpAddr, IpamError>;
}

/// Host binding used when no network integration is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHostNetwork;

impl HostNetwork for NoHostNetwork {
    fn link_exists(&self, _name: &str) -> bool {
        false
    }

    fn create_vlan_link(&self, link: &VlanLink) -> Result<(), IpamError> {
        Err(IpamError::NotImplemented(format!("cannot create vlan link {}: no host network integration", link.name)))
    }

    fn request_lease(&self, _mac: &str, interface: &str) -> Result<IpAddr, IpamError> {
        Err(IpamError::NotImplemented(format!("cannot lease on {}: no host network integration", interface)))
    }
}

/// Parse `eth0.10` into its parent and VLAN id, checking the parent exists.
pub fn parse_vlan(host: &dyn HostNetwork, link_name: &str) -> Result<VlanLink, IpamError> {
    let caps = VLAN_NAME.captures(link_name).ok_or_else(|| {
        IpamError::BadRequest(format!(
            "required interface name format is: name.vlan_id, ex. eth0.10 for vlan 10, instead received {}",
            link_name
        ))
    })?;
    let parent = caps[1].to_string();
    let vid: i64 = caps[2].parse().map_err(|_| {
        IpamError::BadRequest(format!("unable to parse a valid vlan id from: {} (ex. eth0.10 for vlan 10)", &caps[2]))
    })?;
    if !host.link_exists(&parent) {
        return Err(IpamError::NotFound(format!("parent interface was not found on the host: {}", parent)));
    }
    // 12-bit VID field; 0 and 4095 are reserved
    if !(1..=4094).contains(&vid) {
        return Err(IpamError::BadRequest(format!("vlan id must be between 1-4094, received: {}", vid)));
    }
    Ok(VlanLink { name: link_name.to_string(), parent, vlan_id: vid as u16 })
}

/// Make sure `interface` exists, creating it as a VLAN sub-interface when needed.
pub fn ensure_interface(host: &dyn HostNetwork, interface: &str) -> Result<(), IpamError> {
    if host.link_exists(interface) {
        return Ok(());
    }
    if !interface.contains('.') {
        return Err(IpamError::BadRequest(format!(
            "invalid parent name {}, examples are \"eth0,eth1,eth0.10\"",
            interface
        )));
    }
    let link = parse_vlan(host, interface)?;
    host.create_vlan_link(&link)?;
    log::debug!("Added a vlan tagged subinterface: {} with a vlan id: {}", link.name, link.vlan_id);
    Ok(())
}

/// Lease an address for `mac` on `interface`.
pub fn lease_address(host: &dyn HostNetwork, interface: &str, mac: &str) -> Result<IpAddr, IpamError> {
    ensure_interface(host, interface)?;
    let ip = host.request_lease(mac, interface)?;
    log::debug!("Leased {} for {} on {}", ip, mac, interface);
    Ok(ip)
}
