//! Accept loop.
//!
//! The bridge owns the transport, the shared registry and the switch. Each
//! accepted connection becomes a [`DeviceSession`] on its own task; a failed
//! session is logged and forgotten without touching the others.

use std::{io, net::SocketAddr, sync::Arc};

use mmos_core::{AddressRegistry, SharedRegistry, env::Environment, transport::Transport};
use tokio::{sync::watch, task::JoinSet};

use crate::{
    config::BridgeConfig,
    error::BridgeError,
    http::SystemServerRegistry,
    session::{DeviceSession, SessionSummary},
    switch::Switch,
    system::{EchoService, TimeService},
};

/// Stops a running bridge.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop accepting and drain every session.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Server bridge.
pub struct ServerBridge<T: Transport, E: Environment> {
    transport: T,
    env: E,
    config: Arc<BridgeConfig>,
    switch: Arc<Switch>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl<T: Transport, E: Environment> ServerBridge<T, E> {
    /// Bridge over `transport` with the built-in system services and web
    /// servers.
    ///
    /// # Errors
    /// Returns `Address` if a system service address cannot be reserved.
    pub fn new(transport: T, env: E, config: BridgeConfig) -> Result<Self, BridgeError> {
        let registry = SharedRegistry::new(AddressRegistry::new(config.registry.clone()));
        let switch = Switch::new(registry, config.kernel.network.default_ttl)
            .with_service(EchoService)?
            .with_service(TimeService::new(env.now()))?
            .with_web_servers(SystemServerRegistry::builtin(env.now()))?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            transport,
            env,
            config: Arc::new(config),
            switch: Arc::new(switch),
            shutdown: Arc::new(shutdown),
        })
    }

    /// Address the transport listens on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Switch shared by the sessions.
    pub fn switch(&self) -> Arc<Switch> {
        Arc::clone(&self.switch)
    }

    /// Address registry shared by the sessions.
    pub fn registry(&self) -> SharedRegistry {
        self.switch.registry().clone()
    }

    /// Handle for stopping [`ServerBridge::run`] from elsewhere.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { tx: Arc::clone(&self.shutdown) }
    }

    /// Accept connections until shut down, then wait for every session to
    /// drain.
    ///
    /// # Errors
    /// Currently infallible; accept errors are logged and retried.
    pub async fn run(self) -> Result<(), BridgeError> {
        let mut stop = self.shutdown.subscribe();
        let mut sessions = JoinSet::new();

        if let Ok(addr) = self.transport.local_addr() {
            tracing::info!(%addr, "bridge listening");
        }

        while !*stop.borrow_and_update() {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                },
                accepted = self.transport.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let active = self.switch.session_count();
                        tracing::debug!(%peer, active, "connection accepted");
                        let session = DeviceSession::new(
                            self.env.clone(),
                            Arc::clone(&self.config),
                            Arc::clone(&self.switch),
                            self.shutdown.subscribe(),
                        );
                        sessions.spawn(async move { session.run(stream, peer).await });
                    },
                    Err(error) => tracing::warn!(%error, "accept failed"),
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => log_session(joined),
            }
        }

        tracing::info!(sessions = sessions.len(), "bridge shutting down");
        while let Some(joined) = sessions.join_next().await {
            log_session(joined);
        }
        Ok(())
    }
}

fn log_session(joined: Result<Result<SessionSummary, BridgeError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(summary)) if summary.abandoned > 0 => {
            tracing::warn!(
                address = %summary.address,
                abandoned = summary.abandoned,
                "session force-released its address"
            );
        },
        Ok(Ok(_)) => {},
        Ok(Err(error)) => tracing::info!(%error, "session failed"),
        Err(error) => tracing::error!(%error, "session task panicked"),
    }
}
