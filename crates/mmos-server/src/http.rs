//! Virtual web servers.
//!
//! An [`HttpServer`] owns one `System` address and answers the
//! [`mmos_proto::http`] envelope arriving there on [`http::TAG`]. Servers are
//! collected in a [`SystemServerRegistry`] keyed by server id; the switch
//! looks them up by address.
//!
//! Server ids are normalized to a `sys-` prefix, so `test` and `sys-test`
//! name the same server.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use mmos_proto::{
    AddressKind, HttpRequest, HttpResponse, VirtualAddress, VirtualPacket, http, well_known,
};
use thiserror::Error;

/// Prefix every system server id carries.
pub const SYSTEM_PREFIX: &str = "sys-";

/// Errors while building a [`SystemServerRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    /// Server id is empty
    #[error("server id cannot be empty")]
    EmptyId,

    /// Another server already uses the id
    #[error("server id {0} already registered")]
    DuplicateId(String),

    /// Another server already answers on the address
    #[error("address {0} already has a server")]
    DuplicateAddress(VirtualAddress),

    /// Servers live at `System` addresses only
    #[error("{0} is not a system address")]
    NotSystem(VirtualAddress),
}

/// Who sent a request, as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestInfo {
    /// Sender of the request packet
    pub source: VirtualAddress,
    /// Address the request was sent to
    pub destination: VirtualAddress,
    /// Time the switch handed over the request
    pub received: Instant,
}

/// Web server hosted at a `System` address.
pub trait HttpServer: Send + Sync {
    /// Server id, with or without the `sys-` prefix.
    fn server_id(&self) -> &str;

    /// Address the server answers on.
    fn address(&self) -> VirtualAddress;

    /// One-line description, for logs.
    fn description(&self) -> String {
        format!("virtual http server {}", self.server_id())
    }

    /// Answer one request. The response id is filled in by the caller.
    fn handle(&self, request: &HttpRequest, info: &RequestInfo) -> HttpResponse;
}

/// Web servers keyed by normalized server id.
#[derive(Default)]
pub struct SystemServerRegistry {
    servers: BTreeMap<String, Arc<dyn HttpServer>>,
    by_address: HashMap<VirtualAddress, String>,
}

impl SystemServerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in [`TestSystemServer`].
    pub fn builtin(started: Instant) -> Self {
        let mut registry = Self::new();
        // A fresh registry has no ids or addresses to collide with.
        if let Err(error) = registry.register(TestSystemServer::new(started)) {
            tracing::error!(%error, "built-in web server rejected");
        }
        registry
    }

    /// Add `server` under its normalized id.
    ///
    /// # Errors
    /// Rejects an empty id, a non-`System` address, or an id or address
    /// that is already taken.
    pub fn register(&mut self, server: impl HttpServer + 'static) -> Result<(), HttpError> {
        if server.server_id().trim_start_matches(SYSTEM_PREFIX).is_empty() {
            return Err(HttpError::EmptyId);
        }
        let address = server.address();
        if address.kind() != AddressKind::System {
            return Err(HttpError::NotSystem(address));
        }

        let id = normalize(server.server_id());
        if self.servers.contains_key(&id) {
            return Err(HttpError::DuplicateId(id));
        }
        if self.by_address.contains_key(&address) {
            return Err(HttpError::DuplicateAddress(address));
        }

        tracing::info!(%id, %address, description = %server.description(), "web server registered");
        self.by_address.insert(address, id.clone());
        self.servers.insert(id, Arc::new(server));
        Ok(())
    }

    /// Remove the server registered under `id`.
    pub fn unregister(&mut self, id: &str) -> bool {
        let id = normalize(id);
        let Some(server) = self.servers.remove(&id) else {
            return false;
        };
        self.by_address.remove(&server.address());
        tracing::info!(%id, "web server unregistered");
        true
    }

    /// Server registered under `id`.
    pub fn get(&self, id: &str) -> Option<Arc<dyn HttpServer>> {
        self.servers.get(&normalize(id)).cloned()
    }

    /// Server answering on `address`.
    pub fn at(&self, address: VirtualAddress) -> Option<Arc<dyn HttpServer>> {
        let id = self.by_address.get(&address)?;
        self.servers.get(id).cloned()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }

    /// Addresses with a server.
    pub fn addresses(&self) -> Vec<VirtualAddress> {
        self.by_address.keys().copied().collect()
    }

    /// Number of servers.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether no server is registered.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Answer a request packet switched to one of the servers.
    ///
    /// Returns the encoded response, or `None` when nothing should go
    /// back: no server at the destination, or the packet is on another
    /// tag. An unreadable envelope is answered with `400`.
    pub fn dispatch(&self, packet: &VirtualPacket, now: Instant) -> Option<Bytes> {
        if packet.tag().0 != http::TAG {
            return None;
        }
        let server = self.at(packet.dst())?;

        let response = match HttpRequest::decode(packet.payload()) {
            Ok(request) => {
                let info =
                    RequestInfo { source: packet.src(), destination: packet.dst(), received: now };
                tracing::debug!(
                    server = server.server_id(),
                    method = %request.method,
                    path = %request.path,
                    src = %packet.src(),
                    "http request"
                );
                server.handle(&request, &info).with_id(request.id)
            },
            Err(error) => {
                tracing::debug!(src = %packet.src(), %error, "unreadable http request");
                HttpResponse::bad_request("not an http request")
            },
        };

        match response.encode() {
            Ok(body) => Some(Bytes::from(body)),
            Err(error) => {
                tracing::warn!(server = server.server_id(), %error, "http response not encodable");
                None
            },
        }
    }
}

fn normalize(id: &str) -> String {
    if id.starts_with(SYSTEM_PREFIX) { id.to_string() } else { format!("{SYSTEM_PREFIX}{id}") }
}

/// Diagnostic web server.
///
/// ```text
/// GET /, /index.html  -> HTML page describing the request
/// *   /api/echo       -> JSON with the method, path and body
/// *   /api/info       -> JSON describing the server
/// anything else       -> 404
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TestSystemServer {
    started: Instant,
}

impl TestSystemServer {
    /// Server id.
    pub const ID: &'static str = "sys-test";

    /// Paths the server answers.
    pub const ROUTES: [&'static str; 3] = ["/", "/api/echo", "/api/info"];

    /// Server counting uptime from `started`.
    pub fn new(started: Instant) -> Self {
        Self { started }
    }

    fn index(request: &HttpRequest, info: &RequestInfo) -> HttpResponse {
        let rows = [
            ("source", info.source.to_string()),
            ("destination", info.destination.to_string()),
            ("method", request.method.clone()),
            ("path", request.path.clone()),
        ]
        .iter()
        .map(|(label, value)| format!("<tr><th>{label}</th><td>{value}</td></tr>"))
        .collect::<String>();

        HttpResponse::html(format!(
            "<!DOCTYPE html><html><head><meta charset=\"UTF-8\">\
             <title>MMOS Test Server</title></head><body>\
             <h1>MMOS Test Server</h1><p>Connected over the virtual network.</p>\
             <table>{rows}</table><p>Server address: {}</p></body></html>",
            well_known::TEST_SERVER
        ))
    }

    fn echo(&self, request: &HttpRequest, info: &RequestInfo) -> HttpResponse {
        let uptime = info.received.saturating_duration_since(self.started);
        let body = serde_json::json!({
            "echo": true,
            "method": request.method,
            "path": request.path,
            "body": request.body,
            "uptime_ms": u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
        });
        HttpResponse::json(body.to_string())
    }

    fn info() -> HttpResponse {
        let body = serde_json::json!({
            "server": Self::ID,
            "version": env!("CARGO_PKG_VERSION"),
            "address": well_known::TEST_SERVER.to_string(),
            "endpoints": Self::ROUTES,
        });
        HttpResponse::json(body.to_string())
    }
}

impl HttpServer for TestSystemServer {
    fn server_id(&self) -> &str {
        Self::ID
    }

    fn address(&self) -> VirtualAddress {
        well_known::TEST_SERVER
    }

    fn description(&self) -> String {
        format!("test server ({})", well_known::TEST_SERVER)
    }

    fn handle(&self, request: &HttpRequest, info: &RequestInfo) -> HttpResponse {
        match request.path.as_str() {
            "/" | "/index.html" => Self::index(request, info),
            "/api/echo" => self.echo(request, info),
            "/api/info" => Self::info(),
            _ => HttpResponse::not_found(),
        }
    }
}
