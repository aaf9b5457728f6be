//! One device session.
//!
//! A session owns one real connection, one virtual address and one kernel.
//! Its life has three phases:
//!
//! 1. **Handshake**: read `Hello` within the handshake timeout, allocate an
//!    address, answer `HelloReply` (or `Error` when the pool is exhausted).
//! 2. **Established**: the session loop ticks the kernel on a fixed interval
//!    and feeds it frames from the reader task. The relay task switches the
//!    kernel's outbound packets; the writer task owns the socket's write half.
//! 3. **Drain**: after `Goodbye`, EOF, an I/O error, an idle timeout or
//!    bridge shutdown, the session leaves the switch, stops reading and keeps
//!    ticking until no packet references its address or the drain timeout
//!    expires. Then the kernel shuts down and the address is released
//!    (forcibly if packets were still in flight).

use std::{net::SocketAddr, sync::Arc, time::Instant};

use mmos_core::{
    AddressError, Kernel, RelayLink,
    connection::{Connection, ConnectionAction},
    env::Environment,
    error::TransportError,
    transport::{read_frame, write_frame},
};
use mmos_proto::{
    Frame, Payload, VirtualAddress, VirtualPacket,
    payloads::{ErrorCode, ErrorPayload, Hello, HelloReply},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
};

use crate::{
    config::BridgeConfig,
    error::BridgeError,
    switch::{SessionPorts, Switch},
};

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Address the device used
    pub address: VirtualAddress,
    /// Session identifier sent in `HelloReply`
    pub session_id: u64,
    /// Name the client announced
    pub client_name: String,
    /// Why the session closed
    pub reason: String,
    /// Kernel ticks run, drain included
    pub ticks: u64,
    /// In-flight references abandoned by a forced release
    pub abandoned: u32,
}

enum Step {
    Frame(Frame),
    Disconnected,
    Tick,
    Shutdown,
    ShutdownGone,
}

/// Tasks serving an established session.
struct Tasks {
    stop: watch::Sender<bool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<Result<(), TransportError>>,
    relay: JoinHandle<()>,
}

/// Driver for one connection.
pub struct DeviceSession<E: Environment> {
    env: E,
    config: Arc<BridgeConfig>,
    switch: Arc<Switch>,
    shutdown: watch::Receiver<bool>,
}

impl<E: Environment> DeviceSession<E> {
    /// Session routing through `switch`. Flipping `shutdown` to `true`
    /// drains it.
    pub fn new(
        env: E,
        config: Arc<BridgeConfig>,
        switch: Arc<Switch>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { env, config, switch, shutdown }
    }

    /// Serve `stream` until it closes, then release the address.
    ///
    /// # Errors
    /// - `HandshakeTimeout` / `ClosedDuringHandshake` / `Connection` if the
    ///   handshake fails
    /// - `Address` if no address is left
    /// - `Transport` if `HelloReply` cannot be written
    pub async fn run<S>(
        mut self,
        stream: S,
        peer: SocketAddr,
    ) -> Result<SessionSummary, BridgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut connection = Connection::new(self.env.now(), self.config.connection.clone());

        let hello = match self.handshake(&mut reader, &mut connection).await {
            Ok(hello) => hello,
            Err(error) => {
                tracing::debug!(%peer, %error, "handshake failed");
                let code = match &error {
                    BridgeError::HandshakeTimeout(_) => ErrorCode::HandshakeTimeout,
                    _ => ErrorCode::ProtocolViolation,
                };
                reject(&mut writer, code, &error).await;
                return Err(error);
            },
        };

        let address = match self.switch.registry().allocate() {
            Ok(address) => address,
            Err(error) => {
                tracing::warn!(%peer, %error, "rejecting session");
                reject(&mut writer, ErrorCode::AddressExhausted, &error).await;
                return Err(error.into());
            },
        };
        let session_id = self.env.random_u64();

        let reply = HelloReply {
            session_id,
            address,
            player: address.paired_player(),
            default_ttl: self.config.kernel.network.default_ttl,
            heartbeat_interval_ms: self.config.connection.heartbeat_interval.as_millis() as u64,
        };
        let accepted = match connection.accept(reply, self.env.now()) {
            Ok(actions) => send_direct(&mut writer, actions).await,
            Err(error) => Err(error.into()),
        };
        if let Err(error) = accepted {
            self.release(address);
            return Err(error);
        }
        tracing::info!(
            %peer,
            %address,
            session_id,
            client = %hello.client_name,
            "session established"
        );

        let (reason, ticks) = self.serve(address, connection, reader, writer).await;
        let abandoned = self.release(address);
        tracing::info!(%address, session_id, %reason, ticks, "session closed");

        Ok(SessionSummary {
            address,
            session_id,
            client_name: hello.client_name,
            reason,
            ticks,
            abandoned,
        })
    }

    async fn handshake<R>(
        &self,
        reader: &mut R,
        connection: &mut Connection,
    ) -> Result<Hello, BridgeError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let timeout = self.config.connection.handshake_timeout;
        let frame = tokio::select! {
            frame = read_frame(reader) => frame?,
            () = self.env.sleep(timeout) => return Err(BridgeError::HandshakeTimeout(timeout)),
        };
        let frame = frame.ok_or(BridgeError::ClosedDuringHandshake)?;
        Ok(connection.receive_hello(&frame, self.env.now())?)
    }

    /// Established and drain phases. Returns the close reason and the tick
    /// count.
    async fn serve<S>(
        &mut self,
        address: VirtualAddress,
        mut connection: Connection,
        reader: ReadHalf<S>,
        writer: WriteHalf<S>,
    ) -> (String, u64)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut kernel =
            Kernel::new(address, mmos_apps::builtin_registry(), self.config.kernel.clone())
                .with_registry(self.switch.registry().clone());
        let RelayLink { outbound, inbound } = kernel.attach_relay();
        if let Err(error) = kernel.boot(None) {
            return (format!("kernel failed to boot: {error}"), 0);
        }

        let (external_tx, external_rx) = mpsc::channel(self.config.writer_capacity);
        let (frames_tx, mut frames_rx) = mpsc::channel(self.config.writer_capacity);
        self.switch.register(address, SessionPorts { inbound, external: external_tx.clone() });
        let tasks = self.spawn_tasks(reader, writer, frames_tx, external_rx, outbound);

        let tick = self.config.tick_interval;
        let mut last_tick = self.env.now();
        let mut watch_shutdown = true;
        let reason = loop {
            let wait = (last_tick + tick).saturating_duration_since(self.env.now());
            let step = tokio::select! {
                frame = frames_rx.recv() => frame.map_or(Step::Disconnected, Step::Frame),
                () = self.env.sleep(wait) => Step::Tick,
                stopping = self.shutdown.wait_for(|stop| *stop), if watch_shutdown => {
                    if stopping.is_ok() { Step::Shutdown } else { Step::ShutdownGone }
                },
            };

            let now = self.env.now();
            let actions = match step {
                Step::Frame(frame) => match connection.handle_frame(&frame, now) {
                    Ok(actions) => actions,
                    Err(error) => {
                        let report = error_frame(ErrorCode::ProtocolViolation, &error);
                        if let Some(frame) = report {
                            let _ = external_tx.try_send(frame);
                        }
                        break format!("protocol violation: {error}");
                    },
                },
                Step::Disconnected => break "connection closed".to_string(),
                Step::Tick => {
                    if let Err(error) = kernel.tick(now.duration_since(last_tick)) {
                        break format!("kernel failed: {error}");
                    }
                    last_tick = now;
                    connection.tick(now)
                },
                Step::Shutdown => {
                    if let Ok(actions) = connection.begin_drain("server shutting down") {
                        self.apply(address, actions, &external_tx, now);
                    }
                    break "server shutting down".to_string();
                },
                Step::ShutdownGone => {
                    watch_shutdown = false;
                    Vec::new()
                },
            };

            if let Some(reason) = self.apply(address, actions, &external_tx, now) {
                break reason;
            }
        };

        self.switch.unregister(address);
        drop(frames_rx);
        let _ = tasks.stop.send(true);

        self.drain(&mut kernel, last_tick).await;
        match kernel.shutdown() {
            Ok(layout) => {
                tracing::debug!(%address, apps = layout.app_state.len(), "kernel shut down");
            },
            Err(error) => tracing::warn!(%address, %error, "kernel shutdown failed"),
        }
        let ticks = kernel.ticks();
        drop(kernel);
        drop(external_tx);
        self.join(tasks).await;

        (reason, ticks)
    }

    fn spawn_tasks<S>(
        &self,
        reader: ReadHalf<S>,
        writer: WriteHalf<S>,
        frames: mpsc::Sender<Frame>,
        external: mpsc::Receiver<Frame>,
        outbound: mpsc::Receiver<VirtualPacket>,
    ) -> Tasks
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        Tasks {
            stop,
            reader: tokio::spawn(read_loop(reader, frames, stop_rx)),
            writer: tokio::spawn(write_loop(writer, external)),
            relay: tokio::spawn(relay_loop(Arc::clone(&self.switch), self.env.clone(), outbound)),
        }
    }

    /// Tick until nothing references the address or the drain timeout hits.
    async fn drain(&self, kernel: &mut Kernel, mut last_tick: Instant) {
        let address = kernel.address();
        let registry = self.switch.registry();
        let deadline = self.env.now() + self.config.drain_timeout;

        loop {
            let now = self.env.now();
            if let Err(error) = kernel.tick(now.duration_since(last_tick)) {
                tracing::warn!(%address, %error, "drain tick failed");
                return;
            }
            last_tick = now;

            let pending = registry.in_flight(address);
            if pending == 0 {
                return;
            }
            if now >= deadline {
                tracing::warn!(%address, pending, "drain timed out");
                return;
            }
            self.env.sleep(self.config.tick_interval).await;
        }
    }

    async fn join(&self, tasks: Tasks) {
        if let Err(error) = tasks.relay.await {
            tracing::error!(%error, "relay task failed");
        }

        let mut writer = tasks.writer;
        tokio::select! {
            joined = &mut writer => match joined {
                Ok(Ok(())) => {},
                Ok(Err(error)) => tracing::debug!(%error, "writer stopped"),
                Err(error) => tracing::error!(%error, "writer task failed"),
            },
            () = self.env.sleep(self.config.drain_timeout) => {
                tracing::debug!("writer did not flush in time");
                writer.abort();
            },
        }

        if let Err(error) = tasks.reader.await {
            tracing::error!(%error, "reader task failed");
        }
    }

    /// Carry out connection actions. Returns a reason if the session must
    /// close.
    ///
    /// Frames are queued without waiting; a full writer queue closes the
    /// session.
    fn apply(
        &self,
        address: VirtualAddress,
        actions: Vec<ConnectionAction>,
        external: &mpsc::Sender<Frame>,
        now: Instant,
    ) -> Option<String> {
        for action in actions {
            match action {
                ConnectionAction::SendFrame(frame) => {
                    match external.try_send(frame) {
                        Ok(()) => {},
                        Err(TrySendError::Full(_)) => {
                            return Some("writer backlogged".to_string());
                        },
                        Err(TrySendError::Closed(_)) => return Some("writer closed".to_string()),
                    }
                },
                ConnectionAction::Deliver(packet) => {
                    self.switch.inject_from_client(address, &packet, now);
                },
                ConnectionAction::Close { reason } => return Some(reason),
            }
        }
        None
    }

    fn release(&self, address: VirtualAddress) -> u32 {
        let registry = self.switch.registry();
        match registry.release(address) {
            Ok(()) => 0,
            Err(AddressError::InFlight { pending, .. }) => {
                registry.force_release(address).unwrap_or(pending)
            },
            Err(error) => {
                tracing::warn!(%address, %error, "address release failed");
                0
            },
        }
    }
}

async fn read_loop<R>(
    mut reader: R,
    frames: mpsc::Sender<Frame>,
    mut stop: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = stop.changed() => return,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Some(frame)) => {
                if frames.send(frame).await.is_err() {
                    return;
                }
            },
            Ok(None) => return,
            Err(error) => {
                tracing::debug!(%error, "read failed");
                return;
            },
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut frames: mpsc::Receiver<Frame>,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        write_frame(&mut writer, &frame).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

async fn relay_loop<E: Environment>(
    switch: Arc<Switch>,
    env: E,
    mut outbound: mpsc::Receiver<VirtualPacket>,
) {
    while let Some(packet) = outbound.recv().await {
        switch.route(packet, env.now());
    }
}

/// Write frames before the writer task exists.
async fn send_direct<W>(
    writer: &mut W,
    actions: Vec<ConnectionAction>,
) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    for action in actions {
        if let ConnectionAction::SendFrame(frame) = action {
            write_frame(writer, &frame).await?;
        }
    }
    Ok(())
}

fn error_frame(code: ErrorCode, error: &impl std::fmt::Display) -> Option<Frame> {
    Payload::Error(ErrorPayload { code, message: error.to_string() }).into_frame().ok()
}

/// Best-effort error report during the handshake.
async fn reject<W>(writer: &mut W, code: ErrorCode, error: &impl std::fmt::Display)
where
    W: AsyncWrite + Unpin,
{
    let Some(frame) = error_frame(code, error) else { return };
    if let Err(error) = write_frame(writer, &frame).await {
        tracing::debug!(%error, "could not report handshake error");
    }
}
