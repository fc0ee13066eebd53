//! Port mapping clients for home gateways.
//!
//! Two unrelated protocols are supported, each with its own client:
//!
//! - [`nat_pmp::Client`] speaks [NAT-PMP](https://datatracker.ietf.org/doc/html/rfc6886) to a
//!   known gateway over a single UDP socket.
//! - [`upnp::Client`] discovers an UPnP Internet Gateway Device using SSDP and drives it with
//!   SOAP calls over HTTP.
//!
//! Both expose the same set of operations: map a port, unmap it, and query the external
//! address. The UPnP client can additionally list the mappings held by the gateway.
//!
//! ```no_run
//! # async fn wrapper() -> n0_snafu::Result {
//! use nat_gateway::{mapping::Protocol, upnp};
//!
//! let client = upnp::Client::new(Default::default())?;
//! client
//!     .map(upnp::MapOptions::new(25565).protocol(Protocol::Tcp))
//!     .await?;
//! let ip = client.external_ip().await?;
//! println!("reachable at {ip}:25565");
//! client.destroy();
//! # Ok(())
//! # }
//! ```
#![cfg_attr(nat_gateway_docsrs, feature(doc_cfg))]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod defaults;
pub mod interfaces;
pub mod mapping;
pub mod metrics;
pub mod nat_pmp;
pub mod socket;
pub mod upnp;

#[cfg(test)]
pub(crate) mod test_utils;

pub use metrics::Metrics;

/// Broad classification of the failures reported by the clients in this crate.
///
/// Every error type exposed by a client can be turned into an [`ErrorKind`], which allows callers
/// to decide on retries without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ErrorKind {
    /// The caller supplied malformed input. No network I/O happened.
    #[display("validation")]
    Validation,
    /// The gateway answered with a well formed response reporting a failure.
    #[display("protocol")]
    Protocol,
    /// Socket or HTTP failure, or a response that could not be understood.
    #[display("transport")]
    Transport,
    /// No gateway answered within the discovery window.
    #[display("discovery timeout")]
    DiscoveryTimeout,
    /// The client was closed or destroyed before or during the operation.
    #[display("closed")]
    Closed,
}
