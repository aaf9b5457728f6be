//! Home screen.
//!
//! Control commands arrive on [`tags::CONTROL`] and are answered on the same
//! tag. Commands queue up while another app has focus and are handled when
//! the launcher is back on top.
//!
//! ```text
//! list          -> one visible app id per line, launcher order
//! open <id>     -> "ok" and <id> is launched at the end of the tick
//! recent        -> recently opened ids, newest first
//! ```

use std::time::Duration;

use mmos_core::{App, AppContext, AppManifest, Endpoint};
use serde::{Deserialize, Serialize};

use crate::tags;

const RECENT_LIMIT: usize = 5;

pub(crate) fn manifest() -> AppManifest {
    AppManifest::new(crate::LAUNCHER, "Launcher").with_description("Home screen and app library")
}

/// Parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List launchable apps
    List,
    /// Launch an app
    Open(String),
    /// Recently opened apps
    Recent,
}

impl Command {
    /// Parse one command line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let command = match (words.next()?, words.next()) {
            ("list", None) => Self::List,
            ("recent", None) => Self::Recent,
            ("open", Some(id)) => Self::Open(id.to_string()),
            _ => return None,
        };
        if words.next().is_some() {
            return None;
        }
        Some(command)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Saved {
    recent: Vec<String>,
}

/// The home app.
#[derive(Debug, Default)]
pub struct LauncherApp {
    endpoint: Option<Endpoint>,
    recent: Vec<String>,
}

impl LauncherApp {
    fn handle(&mut self, ctx: &mut AppContext<'_>, line: &str) -> String {
        let Some(command) = Command::parse(line) else {
            return format!("unknown command: {}", line.trim());
        };

        match command {
            Command::List => ctx
                .installed_apps()
                .iter()
                .map(|m| m.id.as_str())
                .filter(|id| *id != crate::LAUNCHER)
                .collect::<Vec<_>>()
                .join("\n"),
            Command::Recent => self.recent.join("\n"),
            Command::Open(id) => {
                let visible = ctx.installed_apps().iter().any(|m| m.id == id);
                if !visible || id == crate::LAUNCHER {
                    return format!("cannot open {id}");
                }
                tracing::debug!(app = %id, "launcher opening app");
                self.recent.retain(|r| *r != id);
                self.recent.insert(0, id.clone());
                self.recent.truncate(RECENT_LIMIT);
                ctx.launch(id);
                "ok".to_string()
            },
        }
    }
}

impl App for LauncherApp {
    fn on_start(&mut self, ctx: &mut AppContext<'_>) {
        self.endpoint = crate::open(ctx, tags::CONTROL);
    }

    fn on_tick(&mut self, ctx: &mut AppContext<'_>, _elapsed: Duration) {
        let Some(endpoint) = self.endpoint else { return };
        for request in crate::drain(ctx, &endpoint) {
            let line = String::from_utf8_lossy(request.payload()).into_owned();
            let reply = self.handle(ctx, &line);
            crate::answer(ctx, &endpoint, &request, reply);
        }
    }

    fn save_state(&self) -> Option<serde_json::Value> {
        serde_json::to_value(Saved { recent: self.recent.clone() }).ok()
    }

    fn restore_state(&mut self, state: &serde_json::Value) {
        match Saved::deserialize(state) {
            Ok(saved) => self.recent = saved.recent,
            Err(error) => tracing::warn!(%error, "ignoring unreadable launcher state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Device;

    #[test]
    fn parse_commands() {
        assert_eq!(Command::parse("list"), Some(Command::List));
        assert_eq!(Command::parse("  open   clock "), Some(Command::Open("clock".into())));
        assert_eq!(Command::parse("open"), None);
        assert_eq!(Command::parse("open a b"), None);
        assert_eq!(Command::parse("dance"), None);
    }

    #[test]
    fn list_hides_the_browser_without_an_engine() {
        let mut device = Device::boot(None);
        assert_eq!(device.request(tags::CONTROL, "list"), ["calculator\nclock\necho"]);
    }

    #[test]
    fn open_launches_at_the_end_of_the_tick() {
        let mut device = Device::boot(None);

        assert_eq!(device.request(tags::CONTROL, "open calculator"), ["ok"]);
        assert_eq!(device.top(), "calculator");
    }

    #[test]
    fn open_rejects_unknown_and_hidden_apps() {
        let mut device = Device::boot(None);

        assert_eq!(device.request(tags::CONTROL, "open ghost"), ["cannot open ghost"]);
        assert_eq!(device.request(tags::CONTROL, "open browser"), ["cannot open browser"]);
        assert_eq!(device.request(tags::CONTROL, "open launcher"), ["cannot open launcher"]);
        assert_eq!(device.top(), "launcher");
    }

    #[test]
    fn recent_survives_restart() {
        let mut device = Device::boot(None);
        device.request(tags::CONTROL, "open clock");
        device.kernel.go_back().unwrap();
        device.request(tags::CONTROL, "open echo");
        device.kernel.go_back().unwrap();
        assert_eq!(device.request(tags::CONTROL, "recent"), ["echo\nclock"]);

        let layout = device.kernel.shutdown().unwrap();
        assert_eq!(
            layout.app_state[crate::LAUNCHER],
            serde_json::json!({ "recent": ["echo", "clock"] })
        );

        let saved = layout.encode().unwrap();
        let mut restarted = Device::restore(None, Some(&saved));
        assert_eq!(restarted.top(), crate::LAUNCHER);
        assert_eq!(restarted.request(tags::CONTROL, "recent"), ["echo\nclock"]);
    }
}
