//! Browser front end.
//!
//! Pages at `System` addresses (`httpm://3-xxxxxxxx/path`) are fetched over
//! the virtual network with the [`mmos_proto::http`] envelope and answered
//! once the server responds, as `"<status> <content type>\n<body>"`. A fetch
//! with no response after [`FETCH_TIMEOUT`] is answered with `504`.
//!
//! Every other URL goes to the page engine, which belongs to the host and is
//! reached through the [`BrowserProvider`](mmos_core::BrowserProvider)
//! capability at call time. Without an engine the app still launches and
//! answers those requests with `browser unavailable`.

use std::{collections::BTreeMap, time::Duration};

use mmos_core::{App, AppContext, AppManifest, Endpoint, NetworkStatus};
use mmos_proto::{HttpRequest, HttpResponse, VirtualPacket, http};
use serde::{Deserialize, Serialize};

use crate::tags;

const HISTORY_LIMIT: usize = 10;

/// How long a page fetch may wait for its server.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn manifest() -> AppManifest {
    AppManifest::new(crate::BROWSER, "Browser")
        .with_description("Web browser backed by the host engine")
        .requiring_browser()
        .requiring_network()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Saved {
    history: Vec<String>,
}

/// A page request waiting for its server.
#[derive(Debug)]
struct Fetch {
    request: VirtualPacket,
    url: String,
    age: Duration,
}

/// Browser app.
#[derive(Debug, Default)]
pub struct BrowserApp {
    endpoint: Option<Endpoint>,
    web: Option<Endpoint>,
    history: Vec<String>,
    pending: BTreeMap<u64, Fetch>,
    next_id: u64,
}

fn render(response: &HttpResponse) -> String {
    format!("{} {}\n{}", response.status, response.content_type, response.body)
}

impl BrowserApp {
    fn remember(&mut self, url: &str) {
        self.history.push(url.to_string());
        if self.history.len() > HISTORY_LIMIT {
            self.history.remove(0);
        }
    }

    /// Handle one navigation. `None` means the answer comes later.
    fn visit(
        &mut self,
        ctx: &mut AppContext<'_>,
        request: &VirtualPacket,
        url: &str,
    ) -> Option<String> {
        if url.is_empty() {
            return Some("empty url".to_string());
        }
        if http::is_system_url(url) {
            return self.fetch(ctx, request, url);
        }
        let Some(engine) = ctx.browser() else {
            return Some("browser unavailable".to_string());
        };

        match engine.open(url) {
            Ok(page) => {
                self.remember(url);
                Some(format!("page {page}"))
            },
            Err(error) => {
                tracing::debug!(engine = engine.name(), %url, %error, "page failed to open");
                Some(format!("error: {error}"))
            },
        }
    }

    fn fetch(
        &mut self,
        ctx: &mut AppContext<'_>,
        request: &VirtualPacket,
        url: &str,
    ) -> Option<String> {
        let unavailable =
            |reason: &str| Some(render(&HttpResponse::new(503, "text/plain", reason)));
        let (server, path) = match http::parse_url(url) {
            Ok(parts) => parts,
            Err(error) => return Some(format!("error: {error}")),
        };
        let Some(web) = self.web else {
            return unavailable("web endpoint unavailable");
        };
        if ctx.network_status() != NetworkStatus::Connected {
            return unavailable("network unavailable");
        }

        self.next_id += 1;
        let id = self.next_id;
        let sent = HttpRequest::get(id, path)
            .encode()
            .map_err(|e| e.to_string())
            .and_then(|body| ctx.send(&web, server, body).map_err(|e| e.to_string()));
        if let Err(error) = sent {
            return Some(format!("error: {error}"));
        }

        tracing::debug!(id, %url, "page fetch sent");
        let fetch = Fetch { request: request.clone(), url: url.to_string(), age: Duration::ZERO };
        self.pending.insert(id, fetch);
        None
    }

    fn complete(&mut self, ctx: &mut AppContext<'_>, packet: &VirtualPacket) {
        let response = match HttpResponse::decode(packet.payload()) {
            Ok(response) => response,
            Err(error) => {
                tracing::debug!(src = %packet.src(), %error, "unreadable page response");
                return;
            },
        };
        let Some(fetch) = self.pending.remove(&response.id) else {
            tracing::debug!(id = response.id, "page response for no pending fetch");
            return;
        };

        if response.is_success() {
            self.remember(&fetch.url);
        }
        if let Some(endpoint) = self.endpoint {
            crate::answer(ctx, &endpoint, &fetch.request, render(&response));
        }
    }

    fn expire(&mut self, ctx: &mut AppContext<'_>, elapsed: Duration) {
        for fetch in self.pending.values_mut() {
            fetch.age += elapsed;
        }
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, fetch)| fetch.age >= FETCH_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            let Some(fetch) = self.pending.remove(&id) else { continue };
            tracing::debug!(id, url = %fetch.url, "page fetch timed out");
            let body = format!("no response for {}", fetch.url);
            let timeout = HttpResponse::new(504, "text/plain", body);
            if let Some(endpoint) = self.endpoint {
                crate::answer(ctx, &endpoint, &fetch.request, render(&timeout));
            }
        }
    }
}

impl App for BrowserApp {
    fn on_start(&mut self, ctx: &mut AppContext<'_>) {
        if ctx.browser().is_none() {
            tracing::info!(instance = %ctx.instance(), "browser started without an engine");
        }
        self.endpoint = crate::open(ctx, tags::BROWSER);
        self.web = crate::open(ctx, http::TAG);
    }

    fn on_tick(&mut self, ctx: &mut AppContext<'_>, elapsed: Duration) {
        if let Some(web) = self.web {
            for packet in crate::drain(ctx, &web) {
                self.complete(ctx, &packet);
            }
        }
        self.expire(ctx, elapsed);

        let Some(endpoint) = self.endpoint else { return };
        for request in crate::drain(ctx, &endpoint) {
            let url = String::from_utf8_lossy(request.payload()).trim().to_string();
            if let Some(reply) = self.visit(ctx, &request, &url) {
                crate::answer(ctx, &endpoint, &request, reply);
            }
        }
    }

    fn save_state(&self) -> Option<serde_json::Value> {
        serde_json::to_value(Saved { history: self.history.clone() }).ok()
    }

    fn restore_state(&mut self, state: &serde_json::Value) {
        match Saved::deserialize(state) {
            Ok(saved) => self.history = saved.history,
            Err(error) => tracing::warn!(%error, "ignoring unreadable browser state"),
        }
    }
}
