//! Echo app: answers every packet on [`tags::ECHO`] with its own payload.
//!
//! Replies go to the sender only, so two echo apps pointed at each other
//! still exchange exactly one packet per request.

use std::time::Duration;

use mmos_core::{App, AppContext, AppManifest, Endpoint};

use crate::tags;

pub(crate) fn manifest() -> AppManifest {
    AppManifest::new(crate::ECHO, "Echo")
        .with_description("Answers every packet with its own payload")
        .requiring_network()
}

/// Echo app.
#[derive(Debug, Default)]
pub struct EchoApp {
    endpoint: Option<Endpoint>,
    answered: u64,
}

impl App for EchoApp {
    fn on_start(&mut self, ctx: &mut AppContext<'_>) {
        self.endpoint = crate::open(ctx, tags::ECHO);
    }

    fn on_tick(&mut self, ctx: &mut AppContext<'_>, _elapsed: Duration) {
        let Some(endpoint) = self.endpoint else { return };
        for request in crate::drain(ctx, &endpoint) {
            let body = request.payload().clone();
            crate::answer(ctx, &endpoint, &request, body);
            self.answered += 1;
        }
    }

    fn on_stop(&mut self, ctx: &mut AppContext<'_>) {
        tracing::debug!(instance = %ctx.instance(), answered = self.answered, "echo stopped");
    }
}
