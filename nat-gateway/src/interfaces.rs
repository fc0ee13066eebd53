//! Enumeration of the host's network interfaces.

use std::net::IpAddr;

use tracing::trace;

/// A local address assigned to a network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAddr {
    /// Name of the interface owning the address.
    pub interface: String,
    /// The address itself.
    pub addr: IpAddr,
    /// Whether the interface is a loopback interface.
    pub is_loopback: bool,
}

/// Lists every address assigned to a local network interface.
pub fn local_addrs() -> Vec<LocalAddr> {
    let mut addrs = Vec::new();
    for iface in netdev::get_interfaces() {
        let is_loopback = iface.is_loopback();
        let v4 = iface.ipv4.iter().map(|net| IpAddr::V4(net.addr()));
        let v6 = iface.ipv6.iter().map(|net| IpAddr::V6(net.addr()));
        for addr in v4.chain(v6) {
            addrs.push(LocalAddr {
                interface: iface.name.clone(),
                addr,
                is_loopback: is_loopback || addr.is_loopback(),
            });
        }
    }
    trace!(count = addrs.len(), "enumerated local addresses");
    addrs
}

/// Keeps the non-loopback addresses, optionally only those of the interface named `interface`.
pub fn external(addrs: Vec<LocalAddr>, interface: Option<&str>) -> Vec<LocalAddr> {
    addrs
        .into_iter()
        .filter(|local| !local.is_loopback)
        .filter(|local| interface.is_none_or(|name| local.interface == name))
        .collect()
}
