//! A NAT-PMP response encoding and decoding.

use std::{fmt, net::Ipv4Addr};

use num_enum::FromPrimitive;
use snafu::{Snafu, ensure};

use super::{MapProtocol, Opcode, Version};

/// A NAT-PMP successful Response/Notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Response to a [`Opcode::DetermineExternalAddress`] request.
    PublicAddress {
        /// Epoch time of the server.
        epoch_time: u32,
        /// External address of the gateway.
        public_ip: Ipv4Addr,
    },
    /// Response to a [`Opcode::MapUdp`] or [`Opcode::MapTcp`] request.
    PortMap {
        /// Protocol for which the mapping was requested.
        proto: MapProtocol,
        /// Epoch time of the server.
        epoch_time: u32,
        /// Local port for which the mapping was created.
        private_port: u16,
        /// External port registered for this mapping.
        external_port: u16,
        /// Lifetime in seconds that can be assumed by this mapping.
        lifetime_seconds: u32,
    },
}

/// Result code obtained in a NAT-PMP response.
///
/// See [RFC 6886 Result Codes](https://datatracker.ietf.org/doc/html/rfc6886#section-3.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum ResultCode {
    /// A successful response.
    Success = 0,
    /// The sent version is not supported by the NAT-PMP server.
    UnsupportedVersion = 1,
    /// Functionality is suported but not allowerd: e.g. box supports mapping, but user has turned
    /// feature off.
    NotAuthorizedOrRefused = 2,
    /// Netfork failures, e.g. NAT device itself has not obtained a DHCP lease.
    NetworkFailure = 3,
    /// NAT-PMP server cannot create any more mappings at this time.
    OutOfResources = 4,
    /// Opcode is not supported by the server.
    UnsupportedOpcode = 5,
    /// A code this client does not know about.
    #[num_enum(catch_all)]
    Unknown(u16),
}

impl ResultCode {
    /// The numeric value of this code, as sent on the wire.
    pub fn code(&self) -> u16 {
        match self {
            ResultCode::Success => 0,
            ResultCode::UnsupportedVersion => 1,
            ResultCode::NotAuthorizedOrRefused => 2,
            ResultCode::NetworkFailure => 3,
            ResultCode::OutOfResources => 4,
            ResultCode::UnsupportedOpcode => 5,
            ResultCode::Unknown(code) => *code,
        }
    }

    /// Human readable meaning of this code, if it is a known one.
    pub fn message(&self) -> Option<&'static str> {
        let msg = match self {
            ResultCode::Success => "Success",
            ResultCode::UnsupportedVersion => "Unsupported Version",
            ResultCode::NotAuthorizedOrRefused => {
                "Not Authorized/Refused (gateway may have NAT-PMP disabled)"
            }
            ResultCode::NetworkFailure => {
                "Network Failure (gateway may have not obtained a DHCP lease)"
            }
            ResultCode::OutOfResources => "Out of Resources (no ports left)",
            ResultCode::UnsupportedOpcode => "Unsupported opcode",
            ResultCode::Unknown(_) => return None,
        };
        Some(msg)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => f.write_str(msg),
            None => write!(f, "{}", self.code()),
        }
    }
}

/// Errors that can occur when decoding a [`Response`] from a server.
#[allow(missing_docs)]
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(module)]
#[non_exhaustive]
pub enum DecodeError {
    #[snafu(display("Response is malformed ({len} bytes)"))]
    Malformed { len: usize },
    #[snafu(display("Packet does not appear to be a response"))]
    NotAResponse,
    #[snafu(display("Invalid Opcode received: {opcode}"))]
    InvalidOpcode { opcode: u8 },
    #[snafu(display("Invalid version received: {version}"))]
    InvalidVersion { version: u8 },
    /// The server answered with a non zero result code.
    #[snafu(display("Server reported a failure: {code} (code {})", code.code()))]
    Failure { code: ResultCode },
}

impl Response {
    /// Size of the fields common to every response.
    pub const HEADER_SIZE: usize = 1 + // version
        1 + // opcode
        2; // result code

    /// Size of an encoded [`Response::PublicAddress`].
    pub const MIN_SIZE: usize = // parts of a public ip response
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        4; // public ip

    /// Size of an encoded [`Response::PortMap`].
    pub const MAX_SIZE: usize = // parts of mapping response
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        2 + // private port
        2 + // public port
        4; // lifetime

    /// Decode a response.
    ///
    /// A response with a non zero result code is reported as [`DecodeError::Failure`].
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        ensure!(
            buf.len() >= 2,
            decode_error::MalformedSnafu { len: buf.len() }
        );
        let version = buf[0];
        let _: Version = version
            .try_into()
            .map_err(|_| decode_error::InvalidVersionSnafu { version }.build())?;
        let opcode = buf[1];
        ensure!(
            opcode & Opcode::RESPONSE_INDICATOR == Opcode::RESPONSE_INDICATOR,
            decode_error::NotAResponseSnafu
        );
        let opcode = opcode & !Opcode::RESPONSE_INDICATOR;
        let opcode: Opcode = opcode
            .try_into()
            .map_err(|_| decode_error::InvalidOpcodeSnafu { opcode }.build())?;

        ensure!(
            buf.len() >= Self::HEADER_SIZE,
            decode_error::MalformedSnafu { len: buf.len() }
        );
        let code = ResultCode::from(u16::from_be_bytes([buf[2], buf[3]]));
        ensure!(
            code == ResultCode::Success,
            decode_error::FailureSnafu { code }
        );

        let epoch_time = || u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        let response = match opcode {
            Opcode::DetermineExternalAddress => {
                ensure!(
                    buf.len() >= Self::MIN_SIZE,
                    decode_error::MalformedSnafu { len: buf.len() }
                );
                let ip_bytes = [buf[8], buf[9], buf[10], buf[11]];
                Response::PublicAddress {
                    epoch_time: epoch_time(),
                    public_ip: ip_bytes.into(),
                }
            }
            Opcode::MapUdp | Opcode::MapTcp => {
                ensure!(
                    buf.len() >= Self::MAX_SIZE,
                    decode_error::MalformedSnafu { len: buf.len() }
                );
                let proto = if opcode == Opcode::MapUdp {
                    MapProtocol::UDP
                } else {
                    MapProtocol::TCP
                };

                Response::PortMap {
                    proto,
                    epoch_time: epoch_time(),
                    private_port: u16::from_be_bytes([buf[8], buf[9]]),
                    external_port: u16::from_be_bytes([buf[10], buf[11]]),
                    lifetime_seconds: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
                }
            }
        };

        Ok(response)
    }

    /// Opcode of the request this is an answer to.
    pub fn opcode(&self) -> Opcode {
        match self {
            Response::PublicAddress { .. } => Opcode::DetermineExternalAddress,
            Response::PortMap {
                proto: MapProtocol::UDP,
                ..
            } => Opcode::MapUdp,
            Response::PortMap {
                proto: MapProtocol::TCP,
                ..
            } => Opcode::MapTcp,
        }
    }

    #[cfg(test)]
    pub(crate) fn random<R: rand::Rng>(opcode: Opcode, rng: &mut R) -> Self {
        match opcode {
            Opcode::DetermineExternalAddress => {
                let octects: [u8; 4] = rng.r#gen();
                Response::PublicAddress {
                    epoch_time: rng.r#gen(),
                    public_ip: octects.into(),
                }
            }
            Opcode::MapUdp | Opcode::MapTcp => Response::PortMap {
                proto: if opcode == Opcode::MapUdp {
                    MapProtocol::UDP
                } else {
                    MapProtocol::TCP
                },
                epoch_time: rng.r#gen(),
                private_port: rng.r#gen(),
                external_port: rng.r#gen(),
                lifetime_seconds: rng.r#gen(),
            },
        }
    }

    /// Encodes this response as a server would send it.
    #[cfg(test)]
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::MAX_SIZE);
        // version
        buf.push(Version::NatPmp.into());
        // response indicator and opcode
        buf.push(self.opcode().response());
        // result code
        buf.extend_from_slice(&ResultCode::Success.code().to_be_bytes());
        match self {
            Response::PublicAddress {
                epoch_time,
                public_ip,
            } => {
                buf.extend_from_slice(&epoch_time.to_be_bytes());
                buf.extend_from_slice(&public_ip.octets());
            }
            Response::PortMap {
                proto: _,
                epoch_time,
                private_port,
                external_port,
                lifetime_seconds,
            } => {
                buf.extend_from_slice(&epoch_time.to_be_bytes());
                buf.extend_from_slice(&private_port.to_be_bytes());
                buf.extend_from_slice(&external_port.to_be_bytes());
                buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
            }
        }
        buf
    }

    /// Encodes a failure answer to a request with `opcode`.
    #[cfg(test)]
    pub(crate) fn encode_failure(opcode: Opcode, code: u16, epoch_time: u32) -> Vec<u8> {
        let mut buf = vec![Version::NatPmp.into(), opcode.response()];
        buf.extend_from_slice(&code.to_be_bytes());
        buf.extend_from_slice(&epoch_time.to_be_bytes());
        buf
    }
}
