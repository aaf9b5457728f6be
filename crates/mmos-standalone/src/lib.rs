//! Standalone MMOS device
//!
//! Runs one kernel with the built-in apps and no server. The operator at
//! the console is the device's paired player address: console commands
//! become packets from that address, and packets the device sends back to
//! it are printed. Every other off-device packet is dropped, as there is no
//! network to carry it.
//!
//! The layout is loaded from a [`LayoutStore`] at boot and written back on
//! `save` and on shutdown.

#![forbid(unsafe_code)]

pub mod command;
pub mod error;

use std::{
    io::{BufRead, Write},
    time::Duration,
};

use mmos_apps::tags;
use mmos_core::{Kernel, KernelConfig, PersistedLayout, RelayLink, layout::LayoutStore};
use mmos_proto::{VirtualAddress, VirtualPacket};

pub use crate::{command::Command, error::StandaloneError};

/// Address of the standalone device.
pub const DEVICE: VirtualAddress = VirtualAddress::device(1);

/// Kernel plus the operator's end of its relay.
pub struct Console {
    kernel: Kernel,
    link: RelayLink,
    store: Box<dyn LayoutStore>,
    operator: VirtualAddress,
    tick: Duration,
}

impl Console {
    /// Boot a device from the layout in `store`, advancing `tick` per tick.
    ///
    /// An unreadable store boots the default layout.
    ///
    /// # Errors
    /// Returns `Kernel` if the kernel refuses to boot.
    pub fn boot(
        store: Box<dyn LayoutStore>,
        config: KernelConfig,
        tick: Duration,
    ) -> Result<Self, StandaloneError> {
        let persisted = store.load().unwrap_or_else(|error| {
            tracing::warn!(%error, "cannot read layout, booting defaults");
            None
        });

        let mut kernel = Kernel::new(DEVICE, mmos_apps::builtin_registry(), config);
        let link = kernel.attach_relay();
        kernel.boot(persisted.as_deref())?;
        tracing::info!(address = %DEVICE, "standalone device booted");

        Ok(Self { kernel, link, store, operator: DEVICE.paired_player(), tick })
    }

    /// The device kernel.
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Run one command and return what it printed.
    ///
    /// # Errors
    /// - `Kernel` if a navigation command is refused
    /// - `Busy` if the device's inbound queue is full
    /// - `Layout` if `save` fails
    pub fn execute(&mut self, command: &Command) -> Result<Vec<String>, StandaloneError> {
        match command {
            Command::Tick(n) => {
                let mut out = Vec::new();
                for _ in 0..*n {
                    out.extend(self.tick()?);
                }
                Ok(out)
            },
            Command::Send { tag, body } => self.send(*tag, body),
            Command::Open(app) => self.send(tags::CONTROL, &format!("open {app}")),
            Command::List => self.send(tags::CONTROL, "list"),
            Command::Back => {
                self.kernel.go_back()?;
                Ok(Vec::new())
            },
            Command::Overlay => {
                self.kernel.show_overlay()?;
                Ok(Vec::new())
            },
            Command::Dismiss => {
                self.kernel.dismiss_overlay()?;
                Ok(Vec::new())
            },
            Command::Stack => Ok(self
                .kernel
                .screens()
                .snapshot()
                .into_iter()
                .map(|(app, state)| format!("{app} ({state:?})"))
                .collect()),
            Command::Stats => {
                let stats = self.kernel.network().stats();
                Ok(vec![format!(
                    "sent {} delivered {} relayed {} dropped {}",
                    stats.sent,
                    stats.delivered,
                    stats.relayed,
                    stats.dropped()
                )])
            },
            Command::Save => {
                self.save()?;
                Ok(vec!["saved".to_string()])
            },
        }
    }

    /// Run every command in `input`, writing output and errors to `out`.
    ///
    /// Bad commands are reported and skipped.
    ///
    /// # Errors
    /// Returns `Io` if reading `input` or writing `out` fails.
    pub fn run_script(
        &mut self,
        input: impl BufRead,
        out: &mut impl Write,
    ) -> Result<(), StandaloneError> {
        for line in input.lines() {
            let line = line?;
            let result = Command::parse(&line).and_then(|command| match command {
                Some(command) => self.execute(&command),
                None => Ok(Vec::new()),
            });

            match result {
                Ok(lines) => {
                    for printed in lines {
                        writeln!(out, "{printed}")?;
                    }
                },
                Err(error) => writeln!(out, "error: {error}")?,
            }
        }
        Ok(())
    }

    /// Advance the kernel one tick and collect replies for the operator.
    ///
    /// # Errors
    /// Returns `Kernel` if the kernel is not running.
    pub fn tick(&mut self) -> Result<Vec<String>, StandaloneError> {
        let report = self.kernel.tick(self.tick)?;
        for (request, error) in &report.rejected {
            tracing::debug!(?request, %error, "navigation rejected");
        }

        let mut out = Vec::new();
        while let Ok(packet) = self.link.outbound.try_recv() {
            if packet.dst() == self.operator {
                let body = String::from_utf8_lossy(packet.payload());
                out.push(format!("[{}] {body}", packet.tag()));
            } else {
                tracing::debug!(dst = %packet.dst(), "no network, dropping packet");
            }
        }
        Ok(out)
    }

    /// Write the current layout to the store.
    ///
    /// # Errors
    /// Returns `Layout` if encoding or writing fails.
    pub fn save(&self) -> Result<(), StandaloneError> {
        let layout = self.kernel.save_state();
        self.store.save(&layout.encode()?)?;
        Ok(())
    }

    /// Shut the kernel down and persist its final layout.
    ///
    /// # Errors
    /// - `Kernel` if the kernel is not running
    /// - `Layout` if the layout cannot be written
    pub fn shutdown(mut self) -> Result<PersistedLayout, StandaloneError> {
        let layout = self.kernel.shutdown()?;
        self.store.save(&layout.encode()?)?;
        tracing::info!(apps = layout.app_state.len(), "layout saved");
        Ok(layout)
    }

    fn send(&mut self, tag: u16, body: &str) -> Result<Vec<String>, StandaloneError> {
        let packet = VirtualPacket::new(
            self.operator,
            DEVICE,
            tag,
            body.to_string(),
            self.kernel.network().default_ttl(),
        );
        self.link.inbound.try_send(packet).map_err(|_| StandaloneError::Busy)?;
        self.tick()
    }
}
