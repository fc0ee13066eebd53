//! A [NAT-PMP](https://datatracker.ietf.org/doc/html/rfc6886) client.
//!
//! The [`Client`] owns one UDP socket and talks to a single gateway. Requests are strictly
//! serialized: a new request is not encoded nor sent until the previous exchange has settled, so a
//! response can always be attributed to the request that caused it.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use snafu::{IntoError, ResultExt, Snafu, ensure};
use tokio::{net::UdpSocket, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    ErrorKind,
    defaults::{NAT_PMP_CLIENT_PORT, NAT_PMP_LIFETIME_SECONDS, NAT_PMP_SERVER_PORT},
    mapping::Protocol,
    metrics::Metrics,
    socket::{IpFamily, bind_udp},
};

pub mod protocol;

use self::protocol::{DecodeError, Opcode, Request, Response, ResultCode};

/// Configuration of a NAT-PMP [`Client`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address requests are sent to.
    pub gateway: SocketAddr,
    /// Local address the client socket binds to.
    pub bind_addr: SocketAddr,
    /// How long to wait for the answer to a single request.
    ///
    /// `None` waits until an answer arrives or the client is closed.
    pub recv_timeout: Option<Duration>,
}

impl Config {
    /// Configuration to talk to the gateway at `gateway` from the well known client port.
    pub fn new(gateway: Ipv4Addr) -> Self {
        Self {
            gateway: SocketAddr::new(gateway.into(), NAT_PMP_SERVER_PORT),
            bind_addr: SocketAddr::new(IpFamily::V4.unspecified_addr(), NAT_PMP_CLIENT_PORT),
            recv_timeout: None,
        }
    }

    /// Sets the local address to bind to.
    pub fn bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    /// Sets the per request receive timeout.
    pub fn recv_timeout(mut self, recv_timeout: Option<Duration>) -> Self {
        self.recv_timeout = recv_timeout;
        self
    }
}

/// A port mapping request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    /// Protocol of the mapping.
    pub protocol: Protocol,
    /// Port on this host traffic should be forwarded to.
    pub private_port: u16,
    /// Suggested external port. `0` lets the gateway choose.
    pub public_port: u16,
    /// Requested lifetime, defaults to [`NAT_PMP_LIFETIME_SECONDS`].
    pub ttl: Option<u32>,
}

impl MapRequest {
    /// Creates a request mapping `public_port` on the gateway to `private_port` on this host.
    pub fn new(protocol: Protocol, private_port: u16, public_port: u16) -> Self {
        Self {
            protocol,
            private_port,
            public_port,
            ttl: None,
        }
    }

    /// Sets the requested lifetime.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn to_request(self) -> Request {
        Request::Mapping {
            proto: self.protocol.into(),
            local_port: self.private_port,
            external_port: self.public_port,
            lifetime_seconds: self.ttl.unwrap_or(NAT_PMP_LIFETIME_SECONDS),
        }
    }
}

/// A mapping as confirmed by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Protocol of the mapping.
    pub protocol: Protocol,
    /// Port on this host.
    pub private_port: u16,
    /// Port assigned on the gateway.
    pub public_port: u16,
    /// Lifetime granted by the gateway. Zero for a deleted mapping.
    pub lifetime_seconds: u32,
    /// Seconds since the gateway started or reset its mappings.
    pub epoch_time: u32,
}

/// External address of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalAddress {
    /// The address.
    pub ip: Ipv4Addr,
    /// Seconds since the gateway started or reset its mappings.
    pub epoch_time: u32,
}

/// Errors of a NAT-PMP [`Client`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum NatPmpError {
    #[snafu(display("Failed to bind NAT-PMP socket to {addr}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Client is closed"))]
    Closed,
    #[snafu(display("Failed to send request"))]
    Send { source: std::io::Error },
    #[snafu(display("Unable to write whole packet: packet size {expected} but only {actual} written"))]
    SizeMismatch { expected: usize, actual: usize },
    #[snafu(display("Failed to receive response"))]
    Recv { source: std::io::Error },
    #[snafu(display("Timed out waiting for a response"))]
    Timeout,
    #[snafu(display("\"vers\" must be 0. Got: {version}"))]
    UnsupportedVersion { version: u8 },
    #[snafu(display("Gateway reported an error: {code}"))]
    Gateway { code: ResultCode },
    #[snafu(display("Malformed response"))]
    Malformed { source: DecodeError },
}

impl NatPmpError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NatPmpError::Closed => ErrorKind::Closed,
            NatPmpError::Gateway { .. } => ErrorKind::Protocol,
            NatPmpError::Bind { .. }
            | NatPmpError::Send { .. }
            | NatPmpError::SizeMismatch { .. }
            | NatPmpError::Recv { .. }
            | NatPmpError::Timeout
            | NatPmpError::UnsupportedVersion { .. }
            | NatPmpError::Malformed { .. } => ErrorKind::Transport,
        }
    }

    /// The numeric result code reported by the gateway, if this is a gateway error.
    pub fn result_code(&self) -> Option<u16> {
        match self {
            NatPmpError::Gateway { code } => Some(code.code()),
            _ => None,
        }
    }

    /// Whether the socket can no longer be used after this error.
    fn is_socket_failure(&self) -> bool {
        matches!(
            self,
            NatPmpError::Send { .. } | NatPmpError::SizeMismatch { .. } | NatPmpError::Recv { .. }
        )
    }
}

impl From<DecodeError> for NatPmpError {
    fn from(value: DecodeError) -> Self {
        match value {
            DecodeError::InvalidVersion { version } => NatPmpError::UnsupportedVersion { version },
            DecodeError::Failure { code } => NatPmpError::Gateway { code },
            source => NatPmpError::Malformed { source },
        }
    }
}

/// A NAT-PMP client bound to a single gateway.
#[derive(Debug)]
pub struct Client {
    gateway: SocketAddr,
    local_addr: SocketAddr,
    recv_timeout: Option<Duration>,
    /// The socket, `None` once closed.
    ///
    /// Holding the lock for the duration of an exchange is what serializes requests.
    socket: Mutex<Option<UdpSocket>>,
    closed: CancellationToken,
    metrics: Arc<Metrics>,
}

impl Client {
    /// Creates a client for `gateway`, bound to the NAT-PMP client port.
    ///
    /// Fails if the port is already in use or cannot be bound.
    pub fn new(gateway: Ipv4Addr) -> Result<Self, NatPmpError> {
        Self::with_config(Config::new(gateway))
    }

    /// Creates a client from a [`Config`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_config(config: Config) -> Result<Self, NatPmpError> {
        let Config {
            gateway,
            bind_addr,
            recv_timeout,
        } = config;
        let socket = bind_udp(bind_addr, false).context(nat_pmp_error::BindSnafu {
            addr: bind_addr,
        })?;
        let local_addr = socket
            .local_addr()
            .context(nat_pmp_error::BindSnafu { addr: bind_addr })?;
        debug!(%local_addr, %gateway, "NAT-PMP client bound");
        Ok(Client {
            gateway,
            local_addr,
            recv_timeout,
            socket: Mutex::new(Some(socket)),
            closed: CancellationToken::new(),
            metrics: Default::default(),
        })
    }

    /// Address requests are sent to.
    pub fn gateway(&self) -> SocketAddr {
        self.gateway
    }

    /// Local address of the client socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Metrics of this client.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Requests a port mapping.
    pub async fn map(&self, request: MapRequest) -> Result<Mapping, NatPmpError> {
        match self.request(request.to_request()).await? {
            Response::PortMap {
                proto,
                epoch_time,
                private_port,
                external_port,
                lifetime_seconds,
            } => Ok(Mapping {
                protocol: proto.into(),
                private_port,
                public_port: external_port,
                lifetime_seconds,
                epoch_time,
            }),
            Response::PublicAddress { .. } => Err(nat_pmp_error::MalformedSnafu.into_error(
                DecodeError::InvalidOpcode {
                    opcode: Opcode::DetermineExternalAddress.into(),
                },
            )),
        }
    }

    /// Deletes a port mapping. This is [`Client::map`] with a zero lifetime.
    pub async fn unmap(&self, request: MapRequest) -> Result<Mapping, NatPmpError> {
        self.map(request.ttl(0)).await
    }

    /// Asks the gateway for its external address.
    pub async fn external_address(&self) -> Result<ExternalAddress, NatPmpError> {
        match self.request(Request::ExternalAddress).await? {
            Response::PublicAddress {
                epoch_time,
                public_ip,
            } => Ok(ExternalAddress {
                ip: public_ip,
                epoch_time,
            }),
            response @ Response::PortMap { .. } => Err(nat_pmp_error::MalformedSnafu
                .into_error(DecodeError::InvalidOpcode {
                    opcode: response.opcode().into(),
                })),
        }
    }

    /// Closes the client.
    ///
    /// Any exchange in flight fails with [`NatPmpError::Closed`], as does every later call. Closing
    /// more than once is fine.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(local_addr = %self.local_addr, "closing NAT-PMP client");
        }
        self.closed.cancel();
        if let Ok(mut socket) = self.socket.try_lock() {
            socket.take();
        }
    }

    /// Whether [`Client::close`] was called or the socket failed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Sends a request and waits for its answer, after every earlier request has settled.
    #[instrument(skip(self), fields(gateway = %self.gateway))]
    async fn request(&self, request: Request) -> Result<Response, NatPmpError> {
        ensure!(!self.closed.is_cancelled(), nat_pmp_error::ClosedSnafu);

        let mut socket = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return nat_pmp_error::ClosedSnafu.fail(),
            socket = self.socket.lock() => socket,
        };
        let Some(udp) = socket.as_ref() else {
            return nat_pmp_error::ClosedSnafu.fail();
        };

        let res = tokio::select! {
            biased;
            _ = self.closed.cancelled() => nat_pmp_error::ClosedSnafu.fail(),
            res = self.exchange(udp, &request) => res,
        };

        match &res {
            Err(err) if err.is_socket_failure() => {
                warn!("NAT-PMP socket failed, closing: {err:#}");
                self.metrics.pmp_socket_failures.inc();
                socket.take();
                self.closed.cancel();
            }
            Err(NatPmpError::Gateway { code }) => {
                debug!(code = code.code(), "gateway reported an error: {code}");
                self.metrics.pmp_gateway_errors.inc();
            }
            _ => {}
        }
        if self.closed.is_cancelled() {
            socket.take();
        }

        res
    }

    async fn exchange(&self, socket: &UdpSocket, request: &Request) -> Result<Response, NatPmpError> {
        let encoded = request.encode();
        let sent = socket
            .send_to(&encoded, self.gateway)
            .await
            .context(nat_pmp_error::SendSnafu)?;
        ensure!(
            sent == encoded.len(),
            nat_pmp_error::SizeMismatchSnafu {
                expected: encoded.len(),
                actual: sent,
            }
        );
        self.metrics.pmp_requests.inc();
        trace!(?request, "request sent");

        let recv = self.recv_response(socket, request.opcode());
        match self.recv_timeout {
            Some(timeout) => tokio::time::timeout(timeout, recv)
                .await
                .map_err(|_| nat_pmp_error::TimeoutSnafu.build())?,
            None => recv.await,
        }
    }

    /// Waits for the next datagram from the gateway answering a request with `opcode`.
    ///
    /// Datagrams from other senders or carrying any other opcode are dropped.
    async fn recv_response(
        &self,
        socket: &UdpSocket,
        opcode: Opcode,
    ) -> Result<Response, NatPmpError> {
        let mut buffer = [0; Response::MAX_SIZE];
        loop {
            let (read, from) = socket
                .recv_from(&mut buffer)
                .await
                .context(nat_pmp_error::RecvSnafu)?;
            if from != self.gateway {
                trace!(%from, len = read, "ignoring datagram from unknown sender");
                self.metrics.pmp_ignored_datagrams.inc();
                continue;
            }
            let datagram = &buffer[..read];
            if datagram.get(1) != Some(&opcode.response()) {
                trace!(%from, len = read, "ignoring unexpected datagram");
                self.metrics.pmp_ignored_datagrams.inc();
                continue;
            }
            let response = Response::decode(datagram)?;
            trace!(%from, ?response, "response received");
            return Ok(response);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
