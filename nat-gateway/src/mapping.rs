//! Typed inputs shared by both port mapping protocols.

use std::{fmt, str::FromStr};

use snafu::{Snafu, ensure};

/// Transport protocol of a port mapping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// A TCP port mapping.
    #[default]
    Tcp,
    /// A UDP port mapping.
    Udp,
}

impl Protocol {
    /// The upper case name used on the wire by UPnP gateways.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Protocol::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Protocol::Udp)
        } else {
            Err(validation_error::ProtocolSnafu { value: s }.build())
        }
    }
}

/// Malformed caller input, detected before any network I/O.
#[allow(missing_docs)]
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(module, visibility(pub(crate)))]
#[non_exhaustive]
pub enum ValidationError {
    #[snafu(display("protocol must be either \"tcp\" or \"udp\", got {value:?}"))]
    Protocol { value: String },
    #[snafu(display("a port is required"))]
    MissingPort,
    #[snafu(display("port must be a whole number >= 0, got {value:?}"))]
    InvalidPort { value: String },
    #[snafu(display("port {value} does not fit in 16 bits"))]
    PortOutOfRange { value: String },
    #[snafu(display("host is empty in {value:?}"))]
    EmptyHost { value: String },
    #[snafu(display("cannot unmap port 0"))]
    UnmapPortZero,
}

/// A port, optionally qualified with a host.
///
/// Can be built from a bare port number, or parsed from either a numeric string (`"8080"`) or a
/// `host:port` pair (`"192.168.1.10:8080"`, `"[fe80::1]:8080"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// The host, if one was given.
    pub host: Option<String>,
    /// The port.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint with both host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port,
        }
    }
}

impl From<u16> for Endpoint {
    fn from(port: u16) -> Self {
        Self { host: None, port }
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Endpoint {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        ensure!(!s.is_empty(), validation_error::MissingPortSnafu);

        match s.rsplit_once(':') {
            Some((host, port)) => {
                let host = host
                    .strip_prefix('[')
                    .and_then(|h| h.strip_suffix(']'))
                    .unwrap_or(host);
                ensure!(
                    !host.is_empty(),
                    validation_error::EmptyHostSnafu { value: s }
                );
                Ok(Self::new(host, parse_port(port)?))
            }
            None => Ok(Self::from(parse_port(s)?)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) if host.contains(':') => write!(f, "[{host}]:{}", self.port),
            Some(host) => write!(f, "{host}:{}", self.port),
            None => write!(f, "{}", self.port),
        }
    }
}

fn parse_port(value: &str) -> Result<u16, ValidationError> {
    ensure!(!value.is_empty(), validation_error::MissingPortSnafu);
    ensure!(
        value.bytes().all(|b| b.is_ascii_digit()),
        validation_error::InvalidPortSnafu { value }
    );
    value
        .parse()
        .map_err(|_| validation_error::PortOutOfRangeSnafu { value }.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("tcp".parse(), Ok(Protocol::Tcp));
        assert_eq!("UDP".parse(), Ok(Protocol::Udp));
        assert_eq!("Tcp".parse(), Ok(Protocol::Tcp));
        assert!(matches!(
            "sctp".parse::<Protocol>(),
            Err(ValidationError::Protocol { .. })
        ));
    }

    #[test]
    fn test_endpoint_from_port() {
        let endpoint = Endpoint::from(25565);
        assert_eq!(endpoint.host, None);
        assert_eq!(endpoint.port, 25565);
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!("8080".parse(), Ok(Endpoint::from(8080)));
        assert_eq!(" 0 ".parse(), Ok(Endpoint::from(0)));
        assert_eq!(
            "192.168.1.10:8080".parse(),
            Ok(Endpoint::new("192.168.1.10", 8080))
        );
        assert_eq!("[fe80::1]:22".parse(), Ok(Endpoint::new("fe80::1", 22)));
        assert_eq!(
            "router.lan:443".parse::<Endpoint>().map(|e| e.to_string()),
            Ok("router.lan:443".to_string())
        );
    }

    #[test]
    fn test_endpoint_parse_invalid() {
        assert_eq!("".parse::<Endpoint>(), Err(ValidationError::MissingPort));
        assert_eq!(
            "host:".parse::<Endpoint>(),
            Err(ValidationError::MissingPort)
        );
        assert!(matches!(
            "-1".parse::<Endpoint>(),
            Err(ValidationError::InvalidPort { .. })
        ));
        assert!(matches!(
            "80.5".parse::<Endpoint>(),
            Err(ValidationError::InvalidPort { .. })
        ));
        assert!(matches!(
            "65536".parse::<Endpoint>(),
            Err(ValidationError::PortOutOfRange { .. })
        ));
        assert!(matches!(
            ":80".parse::<Endpoint>(),
            Err(ValidationError::EmptyHost { .. })
        ));
    }
}
