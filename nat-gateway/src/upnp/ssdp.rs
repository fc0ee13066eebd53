//! SSDP discovery of UPnP devices.
//!
//! [`Ssdp`] binds one UDP socket on every external Ipv4 address of the host and multicasts
//! `M-SEARCH` queries from all of them. Answers are dispatched to every pending
//! [`Ssdp::search`] whose search target matches.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
};

use snafu::{IntoError, Snafu, ensure};
use tokio::{net::UdpSocket, sync::oneshot};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::{
    defaults::SSDP_MULTICAST_ADDR,
    interfaces,
    metrics::Metrics,
    socket::bind_udp,
};

/// Largest datagram we expect an SSDP responder to send.
const MAX_DATAGRAM_SIZE: usize = 4096;

/// Where to bind the discovery sockets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Local port of every discovery socket. `0` lets the OS pick one.
    pub source_port: u16,
    /// Only use the addresses of the interface with this name.
    pub interface: Option<String>,
}

/// Errors of SSDP discovery.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum SsdpError {
    #[snafu(display("No usable network interface found"))]
    NoInterfaces,
    #[snafu(display("Failed to bind a discovery socket on any interface, last tried {addr}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Failed to send search query"))]
    Send { source: std::io::Error },
    #[snafu(display("SSDP client is destroyed"))]
    Destroyed,
}

/// An answer to a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    /// Headers of the answer, keyed by lower case name.
    pub headers: HashMap<String, String>,
    /// Local address of the socket that received the answer.
    pub local_addr: SocketAddr,
    /// Address the answer was sent from.
    pub from: SocketAddr,
}

impl SearchResponse {
    /// The `LOCATION` header, pointing at the device description.
    pub fn location(&self) -> Option<&str> {
        self.headers.get("location").map(String::as_str)
    }

    /// The search target this answers.
    pub fn search_target(&self) -> Option<&str> {
        self.headers.get("st").map(String::as_str)
    }
}

#[derive(Debug)]
struct PendingSearch {
    service_type: String,
    tx: oneshot::Sender<SearchResponse>,
}

type Pending = Arc<Mutex<Vec<PendingSearch>>>;

/// SSDP discovery over every qualifying local interface.
#[derive(Debug)]
pub struct Ssdp {
    sockets: Mutex<Vec<Arc<UdpSocket>>>,
    target: SocketAddr,
    pending: Pending,
    tasks: Mutex<Vec<AbortOnDropHandle<()>>>,
    destroyed: CancellationToken,
    metrics: Arc<Metrics>,
}

impl Ssdp {
    /// Binds discovery sockets on the external Ipv4 addresses of the host.
    ///
    /// Interfaces failing to bind are skipped. Fails only when no socket could be bound.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(options: Options, metrics: Arc<Metrics>) -> Result<Self, SsdpError> {
        let addrs = interfaces::external(interfaces::local_addrs(), options.interface.as_deref())
            .into_iter()
            .map(|local| local.addr)
            .filter(IpAddr::is_ipv4)
            .collect();
        Self::bind_with(
            addrs,
            options.source_port,
            SSDP_MULTICAST_ADDR.into(),
            metrics,
        )
    }

    /// Binds one socket per address in `addrs` and directs queries to `target`.
    pub(crate) fn bind_with(
        addrs: Vec<IpAddr>,
        source_port: u16,
        target: SocketAddr,
        metrics: Arc<Metrics>,
    ) -> Result<Self, SsdpError> {
        ensure!(!addrs.is_empty(), ssdp_error::NoInterfacesSnafu);

        let mut sockets = Vec::new();
        let mut last_err = None;
        for ip in addrs {
            let addr = SocketAddr::new(ip, source_port);
            match bind_udp(addr, true) {
                Ok(socket) => {
                    debug!(%addr, "bound SSDP socket");
                    sockets.push(Arc::new(socket));
                }
                Err(err) => {
                    warn!(%addr, "failed to bind SSDP socket: {err:#}");
                    last_err = Some((addr, err));
                }
            }
        }
        if sockets.is_empty() {
            return match last_err {
                Some((addr, source)) => Err(ssdp_error::BindSnafu { addr }.into_error(source)),
                None => ssdp_error::NoInterfacesSnafu.fail(),
            };
        }

        let pending = Pending::default();
        let destroyed = CancellationToken::new();
        let tasks = sockets
            .iter()
            .map(|socket| {
                let span = info_span!(
                    "ssdp.recv",
                    local_addr = ?socket.local_addr().ok()
                );
                let task = recv_loop(
                    socket.clone(),
                    pending.clone(),
                    destroyed.child_token(),
                    metrics.clone(),
                );
                AbortOnDropHandle::new(tokio::spawn(task.instrument(span)))
            })
            .collect();

        Ok(Ssdp {
            sockets: Mutex::new(sockets),
            target,
            pending,
            tasks: Mutex::new(tasks),
            destroyed,
            metrics,
        })
    }

    /// Local addresses of the discovery sockets.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .lock()
            .expect("poisoned")
            .iter()
            .filter_map(|socket| socket.local_addr().ok())
            .collect()
    }

    /// Searches for `service_type` and waits for the first answer with a matching `ST` header.
    ///
    /// This waits indefinitely if nothing answers, callers are expected to apply a timeout.
    pub async fn search(&self, service_type: &str) -> Result<SearchResponse, SsdpError> {
        ensure!(!self.destroyed.is_cancelled(), ssdp_error::DestroyedSnafu);

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("poisoned");
            // searches abandoned by their caller
            pending.retain(|search| !search.tx.is_closed());
            pending.push(PendingSearch {
                service_type: service_type.to_string(),
                tx,
            });
        }

        let query = search_query(service_type);
        let sockets = self.sockets.lock().expect("poisoned").clone();
        let mut sent = 0;
        let mut last_err = None;
        for socket in sockets {
            match socket.send_to(query.as_bytes(), self.target).await {
                Ok(_) => sent += 1,
                Err(err) => {
                    debug!(local_addr = ?socket.local_addr().ok(), "failed to send query: {err:#}");
                    last_err = Some(err);
                }
            }
        }
        if let (0, Some(source)) = (sent, last_err) {
            return Err(ssdp_error::SendSnafu.into_error(source));
        }
        self.metrics.ssdp_searches.inc();
        trace!(%service_type, sent, "search query sent");

        tokio::select! {
            biased;
            _ = self.destroyed.cancelled() => ssdp_error::DestroyedSnafu.fail(),
            res = rx => res.map_err(|_| ssdp_error::DestroyedSnafu.build()),
        }
    }

    /// Stops listening and closes every socket.
    ///
    /// Pending and later searches fail with [`SsdpError::Destroyed`]. Calling this more than once
    /// is fine.
    pub fn destroy(&self) {
        if self.destroyed.is_cancelled() {
            return;
        }
        debug!("destroying SSDP client");
        self.destroyed.cancel();
        self.tasks.lock().expect("poisoned").clear();
        self.sockets.lock().expect("poisoned").clear();
        self.pending.lock().expect("poisoned").clear();
    }

    /// Whether [`Ssdp::destroy`] was called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.is_cancelled()
    }
}

impl Drop for Ssdp {
    fn drop(&mut self) {
        self.destroyed.cancel();
    }
}

/// The `M-SEARCH` query for `service_type`.
fn search_query(service_type: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {SSDP_MULTICAST_ADDR}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 1\r\n\
         ST: {service_type}\r\n\
         \r\n"
    )
}

/// Parses an SSDP answer or notification into its headers.
///
/// Returns `None` for anything that is not an HTTP style status line or a `NOTIFY`, and for
/// messages without a search target.
fn parse_response(datagram: &[u8]) -> Option<HashMap<String, String>> {
    let text = String::from_utf8_lossy(datagram);
    let mut lines = text.split("\r\n");
    let first = lines.next()?;
    if !(first.starts_with("HTTP") || first.starts_with("NOTIFY")) {
        return None;
    }

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    headers.contains_key("st").then_some(headers)
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    pending: Pending,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
) {
    let local_addr = match socket.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            warn!("SSDP socket has no local address: {err:#}");
            return;
        }
    };
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = socket.recv_from(&mut buffer) => res,
        };
        let (len, from) = match res {
            Ok(res) => res,
            Err(err) => {
                warn!("SSDP socket failed, no longer listening: {err:#}");
                break;
            }
        };

        let Some(headers) = parse_response(&buffer[..len]) else {
            trace!(%from, len, "discarding malformed datagram");
            metrics.ssdp_datagrams_discarded.inc();
            continue;
        };
        let response = SearchResponse {
            headers,
            local_addr,
            from,
        };
        dispatch(&pending, response, &metrics);
    }
    trace!("SSDP receive loop stopped");
}

/// Completes every pending search the response answers.
fn dispatch(pending: &Mutex<Vec<PendingSearch>>, response: SearchResponse, metrics: &Metrics) {
    let st = response.search_target().unwrap_or_default();
    let mut pending = pending.lock().expect("poisoned");
    let (matching, rest): (Vec<_>, Vec<_>) = pending
        .drain(..)
        .filter(|search| !search.tx.is_closed())
        .partition(|search| search.service_type == st);
    *pending = rest;
    drop(pending);

    if matching.is_empty() {
        trace!(from = %response.from, %st, "discarding answer for another search target");
        metrics.ssdp_datagrams_discarded.inc();
        return;
    }
    debug!(from = %response.from, %st, location = ?response.location(), "SSDP answer received");
    for search in matching {
        search.tx.send(response.clone()).ok();
    }
}
