//! Counters kept by the port mapping clients.

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked by the port mapping clients.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "nat_gateway")]
#[non_exhaustive]
pub struct Metrics {
    /// Number of NAT-PMP requests sent to the gateway.
    pub pmp_requests: Counter,
    /// NAT-PMP responses carrying a non zero result code.
    pub pmp_gateway_errors: Counter,
    /// Datagrams dropped while waiting for a NAT-PMP response.
    pub pmp_ignored_datagrams: Counter,
    /// NAT-PMP sockets closed after an I/O failure.
    pub pmp_socket_failures: Counter,

    /// Number of SSDP searches issued.
    pub ssdp_searches: Counter,
    /// SSDP datagrams discarded as malformed or without a search target.
    pub ssdp_datagrams_discarded: Counter,
    /// Gateway searches that did not get an answer in time.
    pub upnp_gateway_not_found: Counter,

    /// Device descriptions fetched over HTTP.
    pub upnp_description_fetches: Counter,
    /// SOAP actions invoked.
    pub upnp_soap_calls: Counter,
    /// SOAP actions that failed.
    pub upnp_soap_failures: Counter,
}
