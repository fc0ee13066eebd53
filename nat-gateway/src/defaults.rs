//! Default values used by the port mapping clients.

use std::net::{Ipv4Addr, SocketAddrV4};

// PCP and NAT-PMP share same ports, reasigned by IANA from the older version to the new one. See
// <https://datatracker.ietf.org/doc/html/rfc6887#section-19>

/// Port to use when acting as a NAT-PMP client. This is the one we bind to.
pub const NAT_PMP_CLIENT_PORT: u16 = 5350;

/// Port of a NAT-PMP server. This is the one we direct requests to.
pub const NAT_PMP_SERVER_PORT: u16 = 5351;

/// The recommended NAT-PMP port mapping lifetime, 2 hours. See
/// <https://datatracker.ietf.org/doc/html/rfc6886#section-3.3>
pub const NAT_PMP_LIFETIME_SECONDS: u32 = 7200;

/// Lease requested from UPnP gateways when the caller does not specify one.
pub const UPNP_LEASE_DURATION_SECONDS: u32 = 60 * 30;

/// Multicast group SSDP queries are sent to.
pub const SSDP_MULTICAST_ADDR: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900);

/// Search target used to find an Internet Gateway Device.
pub const INTERNET_GATEWAY_DEVICE: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";

/// Service types able to manage port mappings, in order of preference.
pub const WAN_CONNECTION_SERVICES: [&str; 3] = [
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "urn:schemas-upnp-org:service:WANIPConnection:2",
    "urn:schemas-upnp-org:service:WANPPPConnection:1",
];

/// Name with which we register mappings in the router when no description is given.
pub const PORT_MAPPING_DESCRIPTION: &str = "nat-gateway:upnp";

/// Upper bound on the number of lease entries read from a gateway.
pub const MAX_PORT_MAPPING_ENTRIES: u32 = 1 << 16;

/// Contains all timeouts that we use in `nat-gateway`.
pub mod timeouts {
    use std::time::Duration;

    /// Maximum duration an UPnP gateway search can take before failing.
    pub const GATEWAY_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(1800);

    /// How long a fetched device description is considered fresh.
    pub const DEVICE_DESCRIPTION_TTL: Duration = Duration::from_secs(60);
}
