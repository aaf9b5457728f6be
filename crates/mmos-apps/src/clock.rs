//! Clock app.
//!
//! Keeps the time it has spent in the foreground, across restarts. A query
//! on [`tags::CLOCK`] is answered with `HH:MM:SS`, or with whole
//! milliseconds when the query is `ms`.

use std::time::Duration;

use mmos_core::{App, AppContext, AppManifest, Endpoint};
use serde::{Deserialize, Serialize};

use crate::tags;

pub(crate) fn manifest() -> AppManifest {
    AppManifest::new(crate::CLOCK, "Clock").with_description("Foreground time keeper")
}

#[derive(Debug, Serialize, Deserialize)]
struct Saved {
    uptime_ms: u64,
}

/// Clock app.
#[derive(Debug, Default)]
pub struct ClockApp {
    endpoint: Option<Endpoint>,
    uptime: Duration,
}

/// `HH:MM:SS`; hours keep counting past a day.
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

impl App for ClockApp {
    fn on_start(&mut self, ctx: &mut AppContext<'_>) {
        self.endpoint = crate::open(ctx, tags::CLOCK);
    }

    fn on_tick(&mut self, ctx: &mut AppContext<'_>, elapsed: Duration) {
        self.uptime += elapsed;

        let Some(endpoint) = self.endpoint else { return };
        for request in crate::drain(ctx, &endpoint) {
            let reply = if request.payload().trim_ascii() == b"ms" {
                self.uptime.as_millis().to_string()
            } else {
                format_uptime(self.uptime)
            };
            crate::answer(ctx, &endpoint, &request, reply);
        }
    }

    fn save_state(&self) -> Option<serde_json::Value> {
        let uptime_ms = u64::try_from(self.uptime.as_millis()).unwrap_or(u64::MAX);
        serde_json::to_value(Saved { uptime_ms }).ok()
    }

    fn restore_state(&mut self, state: &serde_json::Value) {
        match Saved::deserialize(state) {
            Ok(saved) => self.uptime = Duration::from_millis(saved.uptime_ms),
            Err(error) => tracing::warn!(%error, "ignoring unreadable clock state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Device;

    #[test]
    fn formats_hours_minutes_seconds() {
        assert_eq!(format_uptime(Duration::ZERO), "00:00:00");
        assert_eq!(format_uptime(Duration::from_millis(3_723_999)), "01:02:03");
        assert_eq!(format_uptime(Duration::from_secs(100 * 3600)), "100:00:00");
    }

    #[test]
    fn counts_only_foreground_time() {
        let mut device = Device::boot(None);
        device.kernel.launch(crate::CLOCK).unwrap();
        device.tick(Duration::from_secs(2));

        device.kernel.launch(crate::CALCULATOR).unwrap();
        device.tick(Duration::from_secs(60));
        device.kernel.go_back().unwrap();

        // The request tick itself adds 16 ms.
        assert_eq!(device.request(tags::CLOCK, "ms"), ["2016"]);
        assert_eq!(device.request(tags::CLOCK, "now"), ["00:00:02"]);
    }

    #[test]
    fn uptime_survives_restart() {
        let mut device = Device::boot(None);
        device.kernel.launch(crate::CLOCK).unwrap();
        device.tick(Duration::from_secs(5));
        device.kernel.go_back().unwrap();

        device.kernel.launch(crate::CLOCK).unwrap();
        assert_eq!(device.request(tags::CLOCK, "ms"), ["5016"]);
    }
}
