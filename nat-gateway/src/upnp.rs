//! An UPnP Internet Gateway Device client.
//!
//! Every operation discovers the gateway with an SSDP search, then drives its WAN connection
//! service with SOAP calls. The device description is kept for a while and shared by successive
//! operations as long as the gateway keeps answering from the same location.

use std::{
    future::Future,
    net::{AddrParseError, IpAddr},
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};
use url::Url;

use crate::{
    ErrorKind,
    defaults::{
        INTERNET_GATEWAY_DEVICE, MAX_PORT_MAPPING_ENTRIES, PORT_MAPPING_DESCRIPTION,
        UPNP_LEASE_DURATION_SECONDS,
        timeouts::{DEVICE_DESCRIPTION_TTL, GATEWAY_DISCOVERY_TIMEOUT},
    },
    mapping::{Endpoint, Protocol, ValidationError, validation_error},
    metrics::Metrics,
};

pub mod device;
pub mod ssdp;
pub mod xml;

use self::{
    device::{Device, DeviceError},
    ssdp::{Ssdp, SsdpError},
    xml::Element,
};

/// Errors of the UPnP [`Client`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum UpnpError {
    #[snafu(display("Client is destroyed"))]
    Closed,
    #[snafu(transparent)]
    Validation { source: ValidationError },
    #[snafu(display("Fail to find gateway. Maybe your router does not support upnp!"))]
    GatewayNotFound,
    #[snafu(display("Gateway discovery failed"))]
    Discovery { source: SsdpError },
    #[snafu(display("Failed to create HTTP client"))]
    HttpClient { source: reqwest::Error },
    #[snafu(display("Gateway answered without a LOCATION"))]
    MissingLocation,
    #[snafu(display("Invalid gateway LOCATION {location:?}"))]
    InvalidLocation {
        location: String,
        source: url::ParseError,
    },
    #[snafu(transparent)]
    Device { source: DeviceError },
    #[snafu(display("Incorrect response to {action}"))]
    IncorrectResponse { action: String },
    #[snafu(display("Invalid external address {value:?}"))]
    InvalidExternalIp {
        value: String,
        source: AddrParseError,
    },
}

impl UpnpError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpnpError::Closed
            | UpnpError::Discovery {
                source: SsdpError::Destroyed,
            } => ErrorKind::Closed,
            UpnpError::Validation { .. } => ErrorKind::Validation,
            UpnpError::GatewayNotFound => ErrorKind::DiscoveryTimeout,
            UpnpError::Device {
                source: DeviceError::Soap { .. },
            }
            | UpnpError::IncorrectResponse { .. }
            | UpnpError::InvalidExternalIp { .. } => ErrorKind::Protocol,
            UpnpError::Discovery { .. }
            | UpnpError::HttpClient { .. }
            | UpnpError::MissingLocation
            | UpnpError::InvalidLocation { .. }
            | UpnpError::Device { .. } => ErrorKind::Transport,
        }
    }
}

/// A discovered gateway.
#[derive(Debug, Clone)]
pub struct Gateway {
    /// The gateway device.
    pub device: Arc<Device>,
    /// Local address on which the gateway answered the search.
    pub local_addr: IpAddr,
}

/// Options of [`Client::map`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapOptions {
    /// Port to open on the gateway, optionally restricted to a remote host.
    pub public: Endpoint,
    /// Where to forward traffic to. Defaults to the public port on the local address that
    /// discovered the gateway.
    pub private: Option<Endpoint>,
    /// Protocol of the mapping.
    pub protocol: Protocol,
    /// Description of the mapping, defaults to [`PORT_MAPPING_DESCRIPTION`].
    pub description: Option<String>,
    /// Lease duration, defaults to [`UPNP_LEASE_DURATION_SECONDS`].
    pub ttl: Option<u32>,
}

impl MapOptions {
    /// Maps `public` with every other option defaulted.
    pub fn new(public: impl Into<Endpoint>) -> Self {
        Self {
            public: public.into(),
            private: None,
            protocol: Protocol::default(),
            description: None,
            ttl: None,
        }
    }

    /// Sets where traffic is forwarded to.
    pub fn private(mut self, private: impl Into<Endpoint>) -> Self {
        self.private = Some(private.into());
        self
    }

    /// Sets the protocol.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the lease duration.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Options of [`Client::unmap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmapOptions {
    /// The mapped public port, with the remote host it was restricted to if any.
    pub public: Endpoint,
    /// Protocol of the mapping.
    pub protocol: Protocol,
}

impl UnmapOptions {
    /// Removes the TCP mapping of `public`.
    pub fn new(public: impl Into<Endpoint>) -> Self {
        Self {
            public: public.into(),
            protocol: Protocol::default(),
        }
    }

    /// Sets the protocol.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }
}

/// Matches a mapping description.
#[derive(Debug, Clone)]
pub enum DescriptionFilter {
    /// The description contains this text.
    Contains(String),
    /// The description matches this expression.
    Regex(regex::Regex),
}

impl DescriptionFilter {
    fn matches(&self, description: &str) -> bool {
        match self {
            DescriptionFilter::Contains(text) => description.contains(text.as_str()),
            DescriptionFilter::Regex(regex) => regex.is_match(description),
        }
    }
}

/// Filter of [`Client::mappings`].
#[derive(Debug, Clone, Default)]
pub struct MappingFilter {
    /// Only keep mappings whose remote host is the local address that discovered the gateway.
    pub local: bool,
    /// Only keep mappings with a matching description.
    pub description: Option<DescriptionFilter>,
}

impl MappingFilter {
    fn matches(&self, entry: &MappingEntry) -> bool {
        (!self.local || entry.is_local)
            && self
                .description
                .as_ref()
                .is_none_or(|filter| filter.matches(&entry.description))
    }
}

/// A lease entry held by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    /// Remote host the mapping is restricted to.
    pub public_host: Option<String>,
    /// Port opened on the gateway.
    pub public_port: u16,
    /// Host traffic is forwarded to.
    pub private_host: String,
    /// Port traffic is forwarded to.
    pub private_port: u16,
    /// Protocol of the mapping.
    pub protocol: Protocol,
    /// Whether the mapping is active.
    pub enabled: bool,
    /// Description of the mapping.
    pub description: String,
    /// Remaining lease, `0` for a permanent mapping.
    pub ttl_seconds: u32,
    /// Whether the remote host is the local address that discovered the gateway.
    pub is_local: bool,
}

/// Maps ports on the UPnP gateway of the local network.
#[derive(Debug)]
pub struct Client {
    ssdp: Ssdp,
    http: reqwest::Client,
    discovery_timeout: Duration,
    description_ttl: Duration,
    /// Last discovered device, reused while the gateway answers from the same location.
    device: Mutex<Option<Arc<Device>>>,
    destroyed: CancellationToken,
    metrics: Arc<Metrics>,
}

impl Client {
    /// Creates a client discovering gateways on the interfaces selected by `options`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(options: ssdp::Options) -> Result<Self, UpnpError> {
        let metrics = Arc::new(Metrics::default());
        let ssdp = Ssdp::new(options, metrics.clone()).context(upnp_error::DiscoverySnafu)?;
        Self::from_ssdp(ssdp, metrics)
    }

    pub(crate) fn from_ssdp(ssdp: Ssdp, metrics: Arc<Metrics>) -> Result<Self, UpnpError> {
        let http = reqwest::Client::builder()
            .build()
            .context(upnp_error::HttpClientSnafu)?;
        Ok(Client {
            ssdp,
            http,
            discovery_timeout: GATEWAY_DISCOVERY_TIMEOUT,
            description_ttl: DEVICE_DESCRIPTION_TTL,
            device: Mutex::new(None),
            destroyed: CancellationToken::new(),
            metrics,
        })
    }

    /// Sets how long to wait for a gateway to answer a search.
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Sets for how long a gateway's device description is reused.
    pub fn description_ttl(mut self, ttl: Duration) -> Self {
        self.description_ttl = ttl;
        self
    }

    /// Metrics of this client.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Searches for the gateway.
    ///
    /// Fails with [`UpnpError::GatewayNotFound`] if nothing answers within the discovery timeout.
    pub async fn find_gateway(&self) -> Result<Gateway, UpnpError> {
        self.guard(self.find_gateway_inner()).await
    }

    async fn find_gateway_inner(&self) -> Result<Gateway, UpnpError> {
        let search = self.ssdp.search(INTERNET_GATEWAY_DEVICE);
        let response = match tokio::time::timeout(self.discovery_timeout, search).await {
            Ok(response) => response.context(upnp_error::DiscoverySnafu)?,
            Err(_) => {
                debug!(timeout = ?self.discovery_timeout, "no gateway answered");
                self.metrics.upnp_gateway_not_found.inc();
                return upnp_error::GatewayNotFoundSnafu.fail();
            }
        };

        let location = response.location().context(upnp_error::MissingLocationSnafu)?;
        let url = Url::parse(location).context(upnp_error::InvalidLocationSnafu { location })?;
        trace!(%url, local_addr = %response.local_addr, "gateway found");

        let device = {
            let mut cached = self.device.lock().expect("poisoned");
            match cached.as_ref() {
                Some(device) if device.url() == &url => device.clone(),
                _ => {
                    let device = Arc::new(
                        Device::new(url, self.http.clone(), self.metrics.clone())
                            .cache_ttl(self.description_ttl),
                    );
                    *cached = Some(device.clone());
                    device
                }
            }
        };

        Ok(Gateway {
            device,
            local_addr: response.local_addr.ip(),
        })
    }

    /// Maps a port on the gateway.
    #[instrument(skip_all, fields(public = %options.public))]
    pub async fn map(&self, options: MapOptions) -> Result<(), UpnpError> {
        self.guard(self.map_inner(options)).await
    }

    async fn map_inner(&self, options: MapOptions) -> Result<(), UpnpError> {
        let gateway = self.find_gateway_inner().await?;
        let MapOptions {
            public,
            private,
            protocol,
            description,
            ttl,
        } = options;
        let (private_host, private_port) = match private {
            Some(private) => (private.host, private.port),
            None => (None, public.port),
        };
        let private_host = private_host.unwrap_or_else(|| gateway.local_addr.to_string());
        let description = description.unwrap_or_else(|| PORT_MAPPING_DESCRIPTION.to_string());
        let ttl = ttl.unwrap_or(UPNP_LEASE_DURATION_SECONDS);

        gateway
            .device
            .run(
                "AddPortMapping",
                &[
                    ("NewRemoteHost", public.host),
                    ("NewExternalPort", Some(public.port.to_string())),
                    ("NewProtocol", Some(protocol.to_string())),
                    ("NewInternalPort", Some(private_port.to_string())),
                    ("NewInternalClient", Some(private_host)),
                    ("NewEnabled", Some("1".to_string())),
                    ("NewPortMappingDescription", Some(description)),
                    ("NewLeaseDuration", Some(ttl.to_string())),
                ],
            )
            .await?;
        Ok(())
    }

    /// Removes a port mapping from the gateway.
    #[instrument(skip_all, fields(public = %options.public))]
    pub async fn unmap(&self, options: UnmapOptions) -> Result<(), UpnpError> {
        self.guard(self.unmap_inner(options)).await
    }

    async fn unmap_inner(&self, options: UnmapOptions) -> Result<(), UpnpError> {
        let UnmapOptions { public, protocol } = options;
        ensure!(public.port != 0, validation_error::UnmapPortZeroSnafu);

        let gateway = self.find_gateway_inner().await?;
        gateway
            .device
            .run(
                "DeletePortMapping",
                &[
                    ("NewRemoteHost", public.host),
                    ("NewExternalPort", Some(public.port.to_string())),
                    ("NewProtocol", Some(protocol.to_string())),
                ],
            )
            .await?;
        Ok(())
    }

    /// Lists the mappings held by the gateway.
    ///
    /// Entries are read by increasing index until the gateway reports an error. A failure at index
    /// 1 is skipped, some gateways number their entries from 1.
    #[instrument(skip_all)]
    pub async fn mappings(&self, filter: MappingFilter) -> Result<Vec<MappingEntry>, UpnpError> {
        self.guard(self.mappings_inner(filter)).await
    }

    async fn mappings_inner(&self, filter: MappingFilter) -> Result<Vec<MappingEntry>, UpnpError> {
        let gateway = self.find_gateway_inner().await?;
        let local = gateway.local_addr.to_string();

        let mut entries = Vec::new();
        for index in 0..MAX_PORT_MAPPING_ENTRIES {
            match mapping_entry(&gateway.device, index, &local).await {
                Ok(entry) => entries.push(entry),
                Err(err) if index == 1 => {
                    debug!("ignoring failure to read entry 1: {err:#}");
                }
                Err(err) => {
                    debug!(index, "end of mappings: {err:#}");
                    break;
                }
            }
        }

        entries.retain(|entry| filter.matches(entry));
        Ok(entries)
    }

    /// Asks the gateway for its external address.
    #[instrument(skip_all)]
    pub async fn external_ip(&self) -> Result<IpAddr, UpnpError> {
        self.guard(self.external_ip_inner()).await
    }

    async fn external_ip_inner(&self) -> Result<IpAddr, UpnpError> {
        let gateway = self.find_gateway_inner().await?;
        let action = "GetExternalIPAddress";
        let body = gateway.device.run(action, &[]).await?;
        let value = action_response(&body, action)?
            .child_text("NewExternalIPAddress")
            .context(upnp_error::IncorrectResponseSnafu { action })?;
        value
            .parse()
            .context(upnp_error::InvalidExternalIpSnafu { value })
    }

    /// Destroys the client, releasing its discovery sockets.
    ///
    /// Operations in flight and every later call fail with [`UpnpError::Closed`]. Calling this
    /// more than once is fine.
    pub fn destroy(&self) {
        self.destroyed.cancel();
        self.ssdp.destroy();
    }

    /// Whether [`Client::destroy`] was called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.is_cancelled()
    }

    /// Runs `fut` unless the client is destroyed before it completes.
    async fn guard<T>(
        &self,
        fut: impl Future<Output = Result<T, UpnpError>>,
    ) -> Result<T, UpnpError> {
        ensure!(!self.destroyed.is_cancelled(), upnp_error::ClosedSnafu);
        tokio::select! {
            biased;
            _ = self.destroyed.cancelled() => upnp_error::ClosedSnafu.fail(),
            res = fut => res,
        }
    }
}

/// The `<action>Response` element in a SOAP body.
fn action_response<'a>(body: &'a Element, action: &str) -> Result<&'a Element, UpnpError> {
    let name = format!("{action}Response");
    body.child(&name)
        .context(upnp_error::IncorrectResponseSnafu { action })
}

async fn mapping_entry(device: &Device, index: u32, local: &str) -> Result<MappingEntry, UpnpError> {
    let action = "GetGenericPortMappingEntry";
    let body = device
        .run(action, &[("NewPortMappingIndex", Some(index.to_string()))])
        .await?;
    let entry = action_response(&body, action)?;

    let text = |name: &str| {
        entry
            .child_text(name)
            .context(upnp_error::IncorrectResponseSnafu { action })
    };
    fn parse<T: FromStr>(value: &str, action: &str) -> Result<T, UpnpError> {
        value
            .parse()
            .ok()
            .context(upnp_error::IncorrectResponseSnafu { action })
    }

    let public_host = entry
        .child_text("NewRemoteHost")
        .filter(|host| !host.is_empty())
        .map(ToString::to_string);
    let is_local = public_host.as_deref() == Some(local);
    Ok(MappingEntry {
        public_host,
        public_port: parse(text("NewExternalPort")?, action)?,
        private_host: text("NewInternalClient")?.to_string(),
        private_port: parse(text("NewInternalPort")?, action)?,
        protocol: parse(text("NewProtocol")?, action)?,
        enabled: text("NewEnabled")? == "1",
        description: entry
            .child_text("NewPortMappingDescription")
            .unwrap_or_default()
            .to_string(),
        ttl_seconds: parse(text("NewLeaseDuration")?, action)?,
        is_local,
    })
}
