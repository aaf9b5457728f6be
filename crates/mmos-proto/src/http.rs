//! Virtual HTTP envelope.
//!
//! Web pages hosted at `System` addresses are fetched with one request
//! packet and one response packet on [`TAG`]. Both carry a CBOR envelope;
//! the response echoes the request `id` so a client with several fetches in
//! flight can pair them up.
//!
//! ```text
//! device                                  System(n)
//!   │ ── HttpRequest{id, GET, /api/info} ──> │
//!   │ <── HttpResponse{id, 200, json} ────── │
//! ```
//!
//! Browsers name such pages `httpm://<address><path>`, see [`parse_url`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    AddressKind, ProtocolError, Result, VirtualAddress,
    payloads::{from_cbor, to_cbor},
};

/// Protocol tag of the HTTP envelope, both directions.
pub const TAG: u16 = 8080;

/// URL scheme for pages on the virtual network.
pub const SCHEME: &str = "httpm://";

/// Request sent to a virtual web server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Client-chosen id, echoed in the response
    pub id: u64,
    /// Method, upper case
    pub method: String,
    /// Absolute path, starting with `/`
    pub path: String,
    /// Request headers
    pub headers: BTreeMap<String, String>,
    /// Request body
    pub body: String,
}

impl HttpRequest {
    /// `GET path` with no headers and an empty body.
    pub fn get(id: u64, path: impl Into<String>) -> Self {
        Self {
            id,
            method: "GET".to_string(),
            path: path.into(),
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }

    /// Same request with `method` and `body`.
    #[must_use]
    pub fn with_body(mut self, method: impl Into<String>, body: impl Into<String>) -> Self {
        self.method = method.into();
        self.body = body.into();
        self
    }

    /// Same request with one more header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Header value, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// CBOR bytes for a packet payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_cbor(self)
    }

    /// Parse a packet payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_cbor(bytes)
    }
}

/// Response from a virtual web server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// Id of the request being answered
    pub id: u64,
    /// Status code
    pub status: u16,
    /// MIME type of `body`
    pub content_type: String,
    /// Response headers
    pub headers: BTreeMap<String, String>,
    /// Response body
    pub body: String,
}

impl HttpResponse {
    /// Response with `status`, `content_type` and `body`.
    pub fn new(status: u16, content_type: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: 0,
            status,
            content_type: content_type.into(),
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// `200` with an HTML body.
    pub fn html(body: impl Into<String>) -> Self {
        Self::new(200, "text/html", body)
    }

    /// `200` with a JSON body.
    pub fn json(body: impl Into<String>) -> Self {
        Self::new(200, "application/json", body)
    }

    /// `404` page.
    pub fn not_found() -> Self {
        Self::error_page(404, "")
    }

    /// `400` page explaining what was wrong with the request.
    pub fn bad_request(message: &str) -> Self {
        Self::error_page(400, message)
    }

    /// `500` page carrying `message`.
    pub fn server_error(message: &str) -> Self {
        Self::error_page(500, message)
    }

    fn error_page(status: u16, message: &str) -> Self {
        let title = format!("{status} {}", status_text(status));
        let body = format!(
            "<!DOCTYPE html><html><head><title>{title}</title></head>\
             <body><h1>{title}</h1><p>{message}</p></body></html>"
        );
        Self::new(status, "text/html", body)
    }

    /// Same response answering request `id`.
    #[must_use]
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Same response with one more header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Status in `200..300`.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Reason phrase for the status.
    pub fn status_text(&self) -> &'static str {
        status_text(self.status)
    }

    /// CBOR bytes for a packet payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_cbor(self)
    }

    /// Parse a packet payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_cbor(bytes)
    }
}

/// Reason phrase for the statuses virtual servers use.
pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Split `httpm://<address>[/path]` into the server address and the path.
///
/// A missing path means `/`.
pub fn parse_url(url: &str) -> Result<(VirtualAddress, String)> {
    let rest = url
        .strip_prefix(SCHEME)
        .ok_or_else(|| ProtocolError::InvalidAddress(url.to_string()))?;
    let (host, path) = match rest.find('/') {
        Some(at) => rest.split_at(at),
        None => (rest, "/"),
    };
    Ok((host.parse()?, path.to_string()))
}

/// Whether `url` names a page on a `System` address.
pub fn is_system_url(url: &str) -> bool {
    matches!(parse_url(url), Ok((address, _)) if address.kind() == AddressKind::System)
}
