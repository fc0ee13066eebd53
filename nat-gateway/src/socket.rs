//! UDP socket creation.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use tracing::debug;

/// Ip family selection between Ipv4 and Ipv6.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IpFamily {
    /// Ipv4
    V4,
    /// Ipv6
    V6,
}

impl From<IpAddr> for IpFamily {
    fn from(value: IpAddr) -> Self {
        match value {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

impl IpFamily {
    /// Returns the matching default address.
    pub fn unspecified_addr(&self) -> IpAddr {
        match self {
            Self::V4 => Ipv4Addr::UNSPECIFIED.into(),
            Self::V6 => Ipv6Addr::UNSPECIFIED.into(),
        }
    }
}

impl From<IpFamily> for socket2::Domain {
    fn from(value: IpFamily) -> Self {
        match value {
            IpFamily::V4 => socket2::Domain::IPV4,
            IpFamily::V6 => socket2::Domain::IPV6,
        }
    }
}

/// Binds a non-blocking UDP socket to `addr` and hands it over to tokio.
///
/// When `multicast` is set and `addr` is an Ipv4 address, outgoing multicast traffic is sent
/// through the interface owning `addr` rather than the default route. Failing to select the
/// interface is not fatal.
///
/// Must be called from within a tokio runtime.
pub fn bind_udp(addr: SocketAddr, multicast: bool) -> io::Result<tokio::net::UdpSocket> {
    let network = IpFamily::from(addr.ip());
    let socket = socket2::Socket::new(
        network.into(),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    if network == IpFamily::V6 {
        // Avoid dualstack
        socket.set_only_v6(true)?;
    }

    socket.bind(&addr.into())?;

    if multicast {
        if let IpAddr::V4(ip) = addr.ip() {
            if !ip.is_unspecified() {
                if let Err(err) = socket.set_multicast_if_v4(&ip) {
                    debug!(%ip, "failed to select multicast interface: {err:?}");
                }
            }
        }
    }

    // Ensure nonblocking
    socket.set_nonblocking(true)?;

    let socket: std::net::UdpSocket = socket.into();
    let socket = tokio::net::UdpSocket::from_std(socket)?;

    let local_addr = socket.local_addr()?;
    if addr.port() != 0 && local_addr.port() != addr.port() {
        return Err(io::Error::other(format!(
            "wrong port bound: {:?}: wanted: {} got {}",
            network,
            addr.port(),
            local_addr.port(),
        )));
    }

    Ok(socket)
}
