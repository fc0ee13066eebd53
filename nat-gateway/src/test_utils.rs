//! Local stand-ins for the gateways the clients talk to.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use n0_snafu::{Result, ResultExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, info_span};
use url::Url;

use crate::{nat_pmp::protocol::Request, upnp::xml::Element};

/// A NAT-PMP gateway answering each request with the datagrams produced by a handler.
#[derive(Debug)]
pub(crate) struct FakeNatPmpGateway {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<(Request, Instant)>>>,
    _task: AbortOnDropHandle<()>,
}

impl FakeNatPmpGateway {
    pub(crate) async fn spawn(
        handler: impl Fn(Request) -> Vec<Vec<u8>> + Send + 'static,
    ) -> Result<Self> {
        Self::spawn_delayed(Duration::ZERO, handler).await
    }

    /// Like [`Self::spawn`], waiting `delay` before answering.
    pub(crate) async fn spawn_delayed(
        delay: Duration,
        handler: impl Fn(Request) -> Vec<Vec<u8>> + Send + 'static,
    ) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.e()?;
        let addr = socket.local_addr().e()?;
        let received = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let received = received.clone();
            async move {
                let mut buf = [0u8; 64];
                loop {
                    let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                        break;
                    };
                    let Some(request) = Request::decode(&buf[..len]) else {
                        debug!(len, "fake gateway got garbage");
                        continue;
                    };
                    received
                        .lock()
                        .expect("poisoned")
                        .push((request.clone(), Instant::now()));
                    let answers = handler(request);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    for answer in answers {
                        socket.send_to(&answer, from).await.ok();
                    }
                }
            }
            .instrument(info_span!("fake-nat-pmp"))
        });

        Ok(Self {
            addr,
            received,
            _task: AbortOnDropHandle::new(task),
        })
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Requests received so far, with the time they arrived.
    pub(crate) fn received(&self) -> Vec<(Request, Instant)> {
        self.received.lock().expect("poisoned").clone()
    }
}

/// An SSDP answer from a device of type `st` described at `location`.
pub(crate) fn ssdp_answer(st: &str, location: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         CACHE-CONTROL: max-age=120\r\n\
         ST: {st}\r\n\
         USN: uuid:00000000-0000-0000-0000-000000000000::{st}\r\n\
         EXT:\r\n\
         SERVER: FakeOS/1.0 UPnP/1.1 FakeGateway/1.0\r\n\
         LOCATION: {location}\r\n\
         \r\n"
    )
}

/// A unicast SSDP responder answering each query with the messages produced by a handler.
#[derive(Debug)]
pub(crate) struct FakeSsdpResponder {
    addr: SocketAddr,
    queries: Arc<Mutex<Vec<String>>>,
    _task: AbortOnDropHandle<()>,
}

impl FakeSsdpResponder {
    pub(crate) async fn spawn(
        handler: impl Fn(&str) -> Vec<String> + Send + 'static,
    ) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.e()?;
        let addr = socket.local_addr().e()?;
        let queries = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let queries = queries.clone();
            async move {
                let mut buf = vec![0u8; 2048];
                loop {
                    let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                        break;
                    };
                    let query = String::from_utf8_lossy(&buf[..len]).into_owned();
                    let answers = handler(&query);
                    queries.lock().expect("poisoned").push(query);
                    for answer in answers {
                        socket.send_to(answer.as_bytes(), from).await.ok();
                    }
                }
            }
            .instrument(info_span!("fake-ssdp"))
        });

        Ok(Self {
            addr,
            queries,
            _task: AbortOnDropHandle::new(task),
        })
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queries received so far.
    pub(crate) fn queries(&self) -> Vec<String> {
        self.queries.lock().expect("poisoned").clone()
    }
}

/// A lease entry held by the [`FakeIgd`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeEntry {
    pub(crate) remote_host: String,
    pub(crate) external_port: u16,
    pub(crate) protocol: String,
    pub(crate) internal_port: u16,
    pub(crate) internal_client: String,
    pub(crate) enabled: bool,
    pub(crate) description: String,
    pub(crate) lease: u32,
}

impl FakeEntry {
    /// A permanent TCP mapping of `port` to the same port on `192.168.1.50`.
    pub(crate) fn new(port: u16, description: &str) -> Self {
        Self {
            remote_host: String::new(),
            external_port: port,
            protocol: "TCP".to_string(),
            internal_port: port,
            internal_client: "192.168.1.50".to_string(),
            enabled: true,
            description: description.to_string(),
            lease: 0,
        }
    }
}

/// How the [`FakeIgd`] behaves.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeIgdConfig {
    /// Value of the `URLBase` element, left out when `None`.
    pub(crate) url_base: Option<String>,
    /// Advertise absolute service URLs.
    pub(crate) absolute_urls: bool,
    /// Serve this instead of the generated description.
    pub(crate) description: Option<String>,
    /// Lease table. `None` entries answer with a fault.
    pub(crate) entries: Vec<Option<FakeEntry>>,
    /// Answer of `GetExternalIPAddress`.
    pub(crate) external_ip: String,
    /// Answer every control request with this status and a non SOAP body.
    pub(crate) control_status: Option<u16>,
}

/// A SOAP request received by the [`FakeIgd`].
#[derive(Debug, Clone)]
pub(crate) struct SoapCall {
    /// Local name of the action element.
    pub(crate) action: String,
    /// Arguments in document order.
    pub(crate) args: Vec<(String, String)>,
    pub(crate) soap_action: String,
    pub(crate) content_type: String,
    pub(crate) content_length: String,
    pub(crate) connection: String,
    pub(crate) body: String,
}

impl SoapCall {
    pub(crate) fn arg(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug)]
struct IgdState {
    description: String,
    description_fetches: AtomicUsize,
    entries: Mutex<Vec<Option<FakeEntry>>>,
    external_ip: String,
    control_status: Option<StatusCode>,
    calls: Mutex<Vec<SoapCall>>,
}

const FAKE_SERVICE: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

/// An Internet Gateway Device served over HTTP by axum.
#[derive(Debug)]
pub(crate) struct FakeIgd {
    addr: SocketAddr,
    state: Arc<IgdState>,
    _task: AbortOnDropHandle<()>,
}

impl FakeIgd {
    pub(crate) async fn spawn(config: FakeIgdConfig) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.e()?;
        let addr = listener.local_addr().e()?;

        let prefix = if config.absolute_urls {
            format!("http://{addr}")
        } else {
            String::new()
        };
        let description = config
            .description
            .unwrap_or_else(|| description(config.url_base.as_deref(), &prefix));
        let state = Arc::new(IgdState {
            description,
            description_fetches: AtomicUsize::new(0),
            entries: Mutex::new(config.entries),
            external_ip: config.external_ip,
            control_status: config
                .control_status
                .map(|code| StatusCode::from_u16(code).e())
                .transpose()?,
            calls: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/rootDesc.xml", get(describe))
            .route("/ctl/IPConn", post(control))
            .with_state(state.clone());
        let task = tokio::spawn(
            async move {
                if let Err(err) = axum::serve(listener, app).await {
                    debug!("fake IGD stopped: {err:#}");
                }
            }
            .instrument(info_span!("fake-igd")),
        );

        Ok(Self {
            addr,
            state,
            _task: AbortOnDropHandle::new(task),
        })
    }

    /// An absolute URL on this server.
    pub(crate) fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}{path}", self.addr)).expect("valid url")
    }

    pub(crate) fn description_url(&self) -> Url {
        self.url("/rootDesc.xml")
    }

    pub(crate) fn description_fetches(&self) -> usize {
        self.state.description_fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> Vec<SoapCall> {
        self.state.calls.lock().expect("poisoned").clone()
    }
}

fn description(url_base: Option<&str>, prefix: &str) -> String {
    let url_base = url_base
        .map(|base| format!("<URLBase>{base}</URLBase>"))
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  {url_base}
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <friendlyName>Fake Gateway</friendlyName>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:L3Forwarding1</serviceId>
        <controlURL>{prefix}/ctl/L3F</controlURL>
        <SCPDURL>{prefix}/L3F.xml</SCPDURL>
      </service>
    </serviceList>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:WANDevice:1</deviceType>
        <deviceList>
          <device>
            <deviceType>urn:schemas-upnp-org:device:WANConnectionDevice:1</deviceType>
            <serviceList>
              <service>
                <serviceType>{FAKE_SERVICE}</serviceType>
                <serviceId>urn:upnp-org:serviceId:WANIPConn1</serviceId>
                <controlURL>{prefix}/ctl/IPConn</controlURL>
                <SCPDURL>{prefix}/WANIPCnSCPD.xml</SCPDURL>
              </service>
            </serviceList>
          </device>
        </deviceList>
      </device>
    </deviceList>
  </device>
</root>"#
    )
}

async fn describe(State(state): State<Arc<IgdState>>) -> impl IntoResponse {
    state.description_fetches.fetch_add(1, Ordering::SeqCst);
    (
        [(header::CONTENT_TYPE, "text/xml")],
        state.description.clone(),
    )
}

fn header_value(headers: &HeaderMap, name: impl header::AsHeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn control(
    State(state): State<Arc<IgdState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let (action, args) = match Element::parse(&body) {
        Ok(envelope) => envelope
            .child("Body")
            .and_then(|body| body.children.first())
            .map(|action| {
                let args = action
                    .children
                    .iter()
                    .map(|arg| (arg.name.clone(), arg.text.clone()))
                    .collect();
                (action.local_name().to_string(), args)
            })
            .unwrap_or_default(),
        Err(_) => Default::default(),
    };
    let call = SoapCall {
        action,
        args,
        soap_action: header_value(&headers, "soapaction"),
        content_type: header_value(&headers, header::CONTENT_TYPE),
        content_length: header_value(&headers, header::CONTENT_LENGTH),
        connection: header_value(&headers, header::CONNECTION),
        body,
    };
    state.calls.lock().expect("poisoned").push(call.clone());

    if let Some(status) = state.control_status {
        return (status, "unavailable").into_response();
    }

    match call.action.as_str() {
        "AddPortMapping" => {
            let arg = |name| call.arg(name).unwrap_or_default().to_string();
            let entry = FakeEntry {
                remote_host: arg("NewRemoteHost"),
                external_port: arg("NewExternalPort").parse().unwrap_or_default(),
                protocol: arg("NewProtocol"),
                internal_port: arg("NewInternalPort").parse().unwrap_or_default(),
                internal_client: arg("NewInternalClient"),
                enabled: arg("NewEnabled") == "1",
                description: arg("NewPortMappingDescription"),
                lease: arg("NewLeaseDuration").parse().unwrap_or_default(),
            };
            state.entries.lock().expect("poisoned").push(Some(entry));
            soap_ok("AddPortMapping", "")
        }
        "DeletePortMapping" => {
            let port = call.arg("NewExternalPort").unwrap_or_default();
            let protocol = call.arg("NewProtocol").unwrap_or_default();
            let mut entries = state.entries.lock().expect("poisoned");
            let found = entries.iter().position(|entry| {
                entry.as_ref().is_some_and(|entry| {
                    entry.external_port.to_string() == port && entry.protocol == protocol
                })
            });
            match found {
                Some(index) => {
                    entries.remove(index);
                    soap_ok("DeletePortMapping", "")
                }
                None => soap_fault(714, "NoSuchEntryInArray"),
            }
        }
        "GetGenericPortMappingEntry" => {
            let index: Option<usize> = call
                .arg("NewPortMappingIndex")
                .and_then(|index| index.parse().ok());
            let entries = state.entries.lock().expect("poisoned");
            match index.and_then(|index| entries.get(index)) {
                Some(Some(entry)) => soap_ok(
                    "GetGenericPortMappingEntry",
                    &format!(
                        "<NewRemoteHost>{}</NewRemoteHost>\
                         <NewExternalPort>{}</NewExternalPort>\
                         <NewProtocol>{}</NewProtocol>\
                         <NewInternalPort>{}</NewInternalPort>\
                         <NewInternalClient>{}</NewInternalClient>\
                         <NewEnabled>{}</NewEnabled>\
                         <NewPortMappingDescription>{}</NewPortMappingDescription>\
                         <NewLeaseDuration>{}</NewLeaseDuration>",
                        entry.remote_host,
                        entry.external_port,
                        entry.protocol,
                        entry.internal_port,
                        entry.internal_client,
                        u8::from(entry.enabled),
                        entry.description,
                        entry.lease,
                    ),
                ),
                Some(None) => soap_fault(501, "ActionFailed"),
                None => soap_fault(713, "SpecifiedArrayIndexInvalid"),
            }
        }
        "GetExternalIPAddress" => soap_ok(
            "GetExternalIPAddress",
            &format!(
                "<NewExternalIPAddress>{}</NewExternalIPAddress>",
                state.external_ip
            ),
        ),
        _ => soap_fault(401, "Invalid Action"),
    }
}

fn soap_envelope(body: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body>{body}</s:Body></s:Envelope>"
    )
}

fn soap_ok(action: &str, content: &str) -> Response {
    let body = soap_envelope(&format!(
        "<u:{action}Response xmlns:u=\"{FAKE_SERVICE}\">{content}</u:{action}Response>"
    ));
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/xml")], body).into_response()
}

fn soap_fault(code: u32, description: &str) -> Response {
    let body = soap_envelope(&format!(
        "<s:Fault>\
         <faultcode>s:Client</faultcode>\
         <faultstring>UPnPError</faultstring>\
         <detail>\
         <UPnPError xmlns=\"urn:schemas-upnp-org:control-1-0\">\
         <errorCode>{code}</errorCode>\
         <errorDescription>{description}</errorDescription>\
         </UPnPError>\
         </detail>\
         </s:Fault>"
    ));
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/xml")],
        body,
    )
        .into_response()
}
