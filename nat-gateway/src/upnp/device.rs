//! An UPnP Internet Gateway Device, driven with SOAP over HTTP.

use std::{sync::Arc, time::Duration};

use quick_xml::escape::escape;
use reqwest::{
    StatusCode,
    header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE},
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, trace};
use url::Url;

use super::xml::{Element, XmlError};
use crate::{
    defaults::{WAN_CONNECTION_SERVICES, timeouts::DEVICE_DESCRIPTION_TTL},
    metrics::Metrics,
};

/// Errors talking to a [`Device`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum DeviceError {
    #[snafu(display("Request to {url} failed"))]
    Http { url: Url, source: reqwest::Error },
    #[snafu(display("Request to {url} failed: {status}"))]
    HttpStatus { url: Url, status: StatusCode },
    #[snafu(display("Invalid XML from {url}"))]
    Xml { url: Url, source: XmlError },
    #[snafu(display("Invalid router device description, no root device"))]
    MissingDevice,
    #[snafu(display("Service not found"))]
    ServiceNotFound,
    #[snafu(display("Invalid URL {url:?}"))]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[snafu(display("UPnP error {code}: {description}"))]
    Soap { code: u32, description: String },
    #[snafu(display("Response from {url} is not a SOAP envelope"))]
    InvalidEnvelope { url: Url },
}

/// A parsed device description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    /// The `root/device` element.
    pub device: Element,
    /// URL relative service URLs are resolved against.
    pub base_url: Url,
}

/// The service used to manage port mappings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Service type, one of [`WAN_CONNECTION_SERVICES`].
    pub service_type: String,
    /// Absolute URL SOAP calls are posted to.
    pub control_url: Url,
    /// Absolute URL of the service description.
    pub scpd_url: Url,
}

#[derive(Debug)]
struct CachedDescription {
    description: Arc<Description>,
    fetched_at: Instant,
}

/// A gateway device, known by the URL of its description.
#[derive(Debug)]
pub struct Device {
    url: Url,
    http: reqwest::Client,
    cache_ttl: Duration,
    cached: Mutex<Option<CachedDescription>>,
    metrics: Arc<Metrics>,
}

impl Device {
    /// Creates a device whose description lives at `url`.
    ///
    /// Nothing is fetched until the device is used.
    pub fn new(url: Url, http: reqwest::Client, metrics: Arc<Metrics>) -> Self {
        Self {
            url,
            http,
            cache_ttl: DEVICE_DESCRIPTION_TTL,
            cached: Mutex::new(None),
            metrics,
        }
    }

    /// Sets for how long a fetched description is reused.
    pub fn cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    /// URL of the device description.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the device description, fetching it if the cached one expired.
    pub async fn connect(&self) -> Result<Arc<Description>, DeviceError> {
        let mut cached = self.cached.lock().await;
        if let Some(cached) = cached.as_ref() {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                trace!(url = %self.url, "using cached device description");
                return Ok(cached.description.clone());
            }
        }

        let description = Arc::new(self.fetch().await?);
        *cached = Some(CachedDescription {
            description: description.clone(),
            fetched_at: Instant::now(),
        });
        Ok(description)
    }

    async fn fetch(&self) -> Result<Description, DeviceError> {
        let url = &self.url;
        debug!(%url, "fetching device description");
        self.metrics.upnp_description_fetches.inc();

        let res = self
            .http
            .get(url.clone())
            .send()
            .await
            .context(device_error::HttpSnafu { url: url.clone() })?;
        if res.status() != StatusCode::OK {
            return device_error::HttpStatusSnafu {
                url: url.clone(),
                status: res.status(),
            }
            .fail();
        }
        let effective_url = res.url().clone();
        let text = res
            .text()
            .await
            .context(device_error::HttpSnafu { url: url.clone() })?;

        let root = Element::parse(&text).context(device_error::XmlSnafu { url: url.clone() })?;
        let device = root
            .child("device")
            .cloned()
            .context(device_error::MissingDeviceSnafu)?;
        let base_url = match root.child_text("URLBase").filter(|base| !base.is_empty()) {
            Some(base) => Url::parse(base).context(device_error::InvalidUrlSnafu { url: base })?,
            None => effective_url,
        };

        Ok(Description { device, base_url })
    }

    /// Finds the WAN connection service of the device.
    pub async fn service(&self) -> Result<Service, DeviceError> {
        let description = self.connect().await?;
        let service = find_service(&description.device).context(device_error::ServiceNotFoundSnafu)?;

        let service_type = service.child_text("serviceType").unwrap_or_default();
        let control_url = non_empty(service.child_text("controlURL"));
        let scpd_url = non_empty(service.child_text("SCPDURL"));
        let (Some(control_url), Some(scpd_url)) = (control_url, scpd_url) else {
            return device_error::ServiceNotFoundSnafu.fail();
        };

        Ok(Service {
            service_type: service_type.to_string(),
            control_url: resolve(&description.base_url, control_url)?,
            scpd_url: resolve(&description.base_url, scpd_url)?,
        })
    }

    /// Invokes `action` on the WAN connection service and returns the SOAP `Body` of the answer.
    ///
    /// Arguments are sent in order. A `None` value is sent as an empty element.
    pub async fn run(
        &self,
        action: &str,
        args: &[(&str, Option<String>)],
    ) -> Result<Element, DeviceError> {
        let service = self.service().await?;
        let body = envelope(&service.service_type, action, args);
        let url = service.control_url;

        debug!(%url, %action, "invoking SOAP action");
        self.metrics.upnp_soap_calls.inc();
        let res = self
            .http
            .post(url.clone())
            .header(CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
            .header(CONTENT_LENGTH, body.len())
            .header(CONNECTION, "close")
            .header("SOAPAction", format!("\"{}#{action}\"", service.service_type))
            .body(body)
            .send()
            .await
            .context(device_error::HttpSnafu { url: url.clone() })?;

        let status = res.status();
        let text = res
            .text()
            .await
            .context(device_error::HttpSnafu { url: url.clone() })?;
        trace!(%action, %status, "SOAP response received");

        if status != StatusCode::OK {
            self.metrics.upnp_soap_failures.inc();
            return Err(match Element::parse(&text).ok().and_then(|doc| parse_fault(&doc)) {
                Some((code, description)) => {
                    device_error::SoapSnafu { code, description }.build()
                }
                None => device_error::HttpStatusSnafu { url, status }.build(),
            });
        }

        let envelope = Element::parse(&text).context(device_error::XmlSnafu { url: url.clone() })?;
        envelope
            .child("Body")
            .cloned()
            .context(device_error::InvalidEnvelopeSnafu { url })
    }
}

/// Every service of `device` and its embedded devices.
///
/// Services of embedded devices come before the device's own.
fn services(device: &Element) -> Vec<&Element> {
    fn walk<'a>(device: &'a Element, out: &mut Vec<&'a Element>) {
        if let Some(devices) = device.child("deviceList") {
            for nested in devices.children_named("device") {
                walk(nested, out);
            }
        }
        if let Some(services) = device.child("serviceList") {
            out.extend(services.children_named("service"));
        }
    }

    let mut out = Vec::new();
    walk(device, &mut out);
    out
}

/// The first service able to manage port mappings.
fn find_service(device: &Element) -> Option<&Element> {
    services(device).into_iter().find(|service| {
        service
            .child_text("serviceType")
            .is_some_and(|ty| WAN_CONNECTION_SERVICES.contains(&ty))
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}

/// Resolves a possibly relative URL against `base`. Absolute URLs are kept as they are.
fn resolve(base: &Url, url: &str) -> Result<Url, DeviceError> {
    base.join(url)
        .context(device_error::InvalidUrlSnafu { url })
}

/// A SOAP 1.1 envelope invoking `action`.
fn envelope(service_type: &str, action: &str, args: &[(&str, Option<String>)]) -> String {
    let mut body = String::from(
        "<?xml version=\"1.0\"?>\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body>",
    );
    body.push_str(&format!(
        "<u:{action} xmlns:u=\"{}\">",
        escape(service_type)
    ));
    for (name, value) in args {
        let value = value.as_deref().unwrap_or_default();
        body.push_str(&format!("<{name}>{}</{name}>", escape(value)));
    }
    body.push_str(&format!("</u:{action}></s:Body></s:Envelope>"));
    body
}

/// Extracts `errorCode` and `errorDescription` from a SOAP fault.
fn parse_fault(envelope: &Element) -> Option<(u32, String)> {
    let error = envelope
        .child("Body")?
        .child("Fault")?
        .child("detail")?
        .child("UPnPError")?;
    let code = error.child_text("errorCode")?.parse().ok()?;
    let description = error.child_text("errorDescription").unwrap_or_default();
    Some((code, description.to_string()))
}
