//! Device sessions driven directly over in-memory streams.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use mmos_apps::tags;
use mmos_core::{AddressRegistry, RegistryConfig, SharedRegistry, transport::write_frame};
use mmos_proto::{FrameHeader, Payload, VirtualPacket, payloads::Hello};
use mmos_server::{
    BridgeConfig, BridgeError, DeviceClient, DeviceSession, SessionPorts, SessionSummary, Switch,
    SystemEnv,
};
use tokio::{
    io::DuplexStream,
    sync::{mpsc, watch},
    task::JoinHandle,
};

const WAIT: Duration = Duration::from_secs(5);

fn switch() -> Arc<Switch> {
    let registry = SharedRegistry::new(AddressRegistry::new(RegistryConfig::default()));
    Arc::new(Switch::new(registry, 8))
}

fn spawn_session(
    switch: &Arc<Switch>,
    config: BridgeConfig,
    stream: DuplexStream,
) -> (JoinHandle<Result<SessionSummary, BridgeError>>, watch::Sender<bool>) {
    let (stop, shutdown) = watch::channel(false);
    let config = Arc::new(config);
    let session = DeviceSession::new(SystemEnv::new(), config, Arc::clone(switch), shutdown);
    let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
    (tokio::spawn(session.run(stream, peer)), stop)
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn client_that_never_reads_is_disconnected() {
    let switch = switch();
    let config = BridgeConfig {
        writer_capacity: 2,
        drain_timeout: Duration::from_millis(300),
        ..BridgeConfig::default()
    };
    let (client, server) = tokio::io::duplex(256);
    let (session, _stop) = spawn_session(&switch, config, server);

    // Keep the read half open but never read from it.
    let (_unread, mut writer) = tokio::io::split(client);
    let hello = Hello { version: FrameHeader::VERSION, client_name: "deaf".into() };
    write_frame(&mut writer, &Payload::Hello(hello).into_frame().unwrap()).await.unwrap();

    let flood = tokio::spawn(async move {
        let ping = Payload::Ping.into_frame().unwrap();
        while write_frame(&mut writer, &ping).await.is_ok() {}
    });

    let summary = tokio::time::timeout(WAIT, session).await.unwrap().unwrap().unwrap();
    flood.abort();

    assert_eq!(summary.reason, "writer backlogged");
    assert!(!switch.registry().is_allocated(summary.address));
}

#[tokio::test]
async fn drain_timeout_force_releases_pinned_packets() {
    let switch = switch();
    let config =
        BridgeConfig { drain_timeout: Duration::from_millis(200), ..BridgeConfig::default() };
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (session, _stop) = spawn_session(&switch, config, server);
    let alice = DeviceClient::handshake(client, SystemEnv::new(), "alice").await.unwrap();
    let device = alice.address();

    // A peer device whose inbound queue nobody drains.
    let peer = switch.registry().allocate().unwrap();
    let (inbound, _undrained) = mpsc::channel(8);
    let (external, _unused) = mpsc::channel(8);
    switch.register(peer, SessionPorts { inbound, external });

    // Alice's launcher answers the peer; the answer stays queued at the peer
    // and keeps a reference on alice's address.
    let request = VirtualPacket::new(peer, device, tags::CONTROL, "list", 8);
    switch.registry().begin_packet(&request);
    switch.route(request, Instant::now());
    wait_for(|| switch.stats().to_device == 2).await;
    assert_eq!(switch.registry().in_flight(device), 1);

    alice.goodbye("done").await.unwrap();
    let summary = tokio::time::timeout(WAIT, session).await.unwrap().unwrap().unwrap();

    assert_eq!(summary.address, device);
    assert_eq!(summary.abandoned, 1);
    assert!(!switch.registry().is_allocated(device));
}
