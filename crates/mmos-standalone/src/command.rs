//! Console command language.
//!
//! One command per line; blank lines and lines starting with `#` are
//! skipped.
//!
//! ```text
//! tick [n]           run n kernel ticks (default 1)
//! send <tag> <text>  packet from the operator to the device on <tag>
//! open <app>         ask the launcher to open <app>
//! list               ask the launcher for the app list
//! back               navigate back
//! overlay            show the system overlay
//! dismiss            dismiss the system overlay
//! stack              print the navigation stack
//! stats              print network counters
//! save               write the layout now
//! ```

use crate::error::StandaloneError;

/// One console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run ticks
    Tick(u32),
    /// Operator packet
    Send {
        /// Protocol tag
        tag: u16,
        /// Payload text
        body: String,
    },
    /// Launcher `open`
    Open(String),
    /// Launcher `list`
    List,
    /// Navigate back
    Back,
    /// Show the overlay
    Overlay,
    /// Dismiss the overlay
    Dismiss,
    /// Print the stack
    Stack,
    /// Print counters
    Stats,
    /// Persist the layout
    Save,
}

impl Command {
    /// Parse one line. `Ok(None)` for blank lines and comments.
    ///
    /// # Errors
    /// Returns `Parse` for unknown commands and bad arguments.
    pub fn parse(line: &str) -> Result<Option<Self>, StandaloneError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let bad = || StandaloneError::Parse(line.to_string());

        let command = match (word, rest.is_empty()) {
            ("tick", true) => Self::Tick(1),
            ("tick", false) => Self::Tick(rest.parse().map_err(|_| bad())?),
            ("send", false) => {
                let (tag, body) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                Self::Send { tag: tag.parse().map_err(|_| bad())?, body: body.trim().to_string() }
            },
            ("open", false) => Self::Open(rest.to_string()),
            ("list", true) => Self::List,
            ("back", true) => Self::Back,
            ("overlay", true) => Self::Overlay,
            ("dismiss", true) => Self::Dismiss,
            ("stack", true) => Self::Stack,
            ("stats", true) => Self::Stats,
            ("save", true) => Self::Save,
            _ => return Err(bad()),
        };
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("tick").unwrap(), Some(Command::Tick(1)));
        assert_eq!(Command::parse("tick 30").unwrap(), Some(Command::Tick(30)));
        assert_eq!(
            Command::parse("send 20  12+30=").unwrap(),
            Some(Command::Send { tag: 20, body: "12+30=".into() })
        );
        assert_eq!(
            Command::parse("send 13").unwrap(),
            Some(Command::Send { tag: 13, body: String::new() })
        );
        assert_eq!(
            Command::parse("open calculator").unwrap(),
            Some(Command::Open("calculator".into()))
        );
        assert_eq!(Command::parse("  # comment").unwrap(), None);
        assert_eq!(Command::parse("").unwrap(), None);
    }

    #[test]
    fn rejects_bad_lines() {
        assert!(Command::parse("tick many").is_err());
        assert!(Command::parse("send x hi").is_err());
        assert!(Command::parse("open").is_err());
        assert!(Command::parse("list all").is_err());
        assert!(Command::parse("reboot").is_err());
    }
}
