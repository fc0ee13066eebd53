use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{Opcode, Version};
use crate::mapping::Protocol;

/// A NAT-PMP Request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Ask for the external address of the gateway.
    ExternalAddress,
    /// Create, renew or (with a zero lifetime) delete a mapping.
    Mapping {
        /// Protocol of the mapping.
        proto: MapProtocol,
        /// Port on this host.
        local_port: u16,
        /// Suggested external port. The server may pick another one.
        external_port: u16,
        /// Requested lifetime. Zero deletes the mapping.
        lifetime_seconds: u32,
    },
}

/// Protocol for which a port mapping is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MapProtocol {
    /// UDP mapping, uses [`Opcode::MapUdp`].
    UDP = 1,
    /// TCP mapping, uses [`Opcode::MapTcp`].
    TCP = 2,
}

impl From<Protocol> for MapProtocol {
    fn from(value: Protocol) -> Self {
        match value {
            Protocol::Tcp => MapProtocol::TCP,
            Protocol::Udp => MapProtocol::UDP,
        }
    }
}

impl From<MapProtocol> for Protocol {
    fn from(value: MapProtocol) -> Self {
        match value {
            MapProtocol::TCP => Protocol::Tcp,
            MapProtocol::UDP => Protocol::Udp,
        }
    }
}

impl Request {
    /// Size of an encoded [`Request::ExternalAddress`].
    pub const EXTERNAL_ADDRESS_SIZE: usize = 1 + // version
        1; // opcode

    /// Size of an encoded [`Request::Mapping`].
    pub const MAPPING_SIZE: usize = 1 + // version
        1 + // opcode
        2 + // reserved
        2 + // local port
        2 + // external port
        4; // lifetime

    /// Opcode this request is sent with.
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::ExternalAddress => Opcode::DetermineExternalAddress,
            Request::Mapping {
                proto: MapProtocol::UDP,
                ..
            } => Opcode::MapUdp,
            Request::Mapping {
                proto: MapProtocol::TCP,
                ..
            } => Opcode::MapTcp,
        }
    }

    /// Encode this [`Request`].
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::ExternalAddress => vec![Version::NatPmp.into(), self.opcode().into()],
            Request::Mapping {
                proto: _,
                local_port,
                external_port,
                lifetime_seconds,
            } => {
                let mut buf = Vec::with_capacity(Self::MAPPING_SIZE);
                buf.push(Version::NatPmp.into());
                buf.push(self.opcode().into());
                // reserved
                buf.push(0);
                buf.push(0);
                buf.extend_from_slice(&local_port.to_be_bytes());
                buf.extend_from_slice(&external_port.to_be_bytes());
                buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
                buf
            }
        }
    }

    /// Decode a [`Request`], as a server would.
    #[cfg(test)]
    pub(crate) fn decode(buf: &[u8]) -> Option<Self> {
        let (&version, rest) = buf.split_first()?;
        Version::try_from(version).ok()?;
        let (&opcode, rest) = rest.split_first()?;
        match Opcode::try_from(opcode).ok()? {
            Opcode::DetermineExternalAddress => {
                rest.is_empty().then_some(Request::ExternalAddress)
            }
            opcode @ (Opcode::MapUdp | Opcode::MapTcp) => {
                if buf.len() != Self::MAPPING_SIZE {
                    return None;
                }
                let proto = if opcode == Opcode::MapUdp {
                    MapProtocol::UDP
                } else {
                    MapProtocol::TCP
                };
                Some(Request::Mapping {
                    proto,
                    local_port: u16::from_be_bytes([buf[4], buf[5]]),
                    external_port: u16::from_be_bytes([buf[6], buf[7]]),
                    lifetime_seconds: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
                })
            }
        }
    }
}
