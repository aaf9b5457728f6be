//! Front-end side of the session protocol.
//!
//! A thin driver around the client half of [`Connection`]: it performs the
//! handshake, stamps outgoing packets with the player address and answers
//! heartbeats while waiting for packets.

use bytes::Bytes;
use mmos_core::{
    connection::{Connection, ConnectionAction, ConnectionConfig},
    env::Environment,
    error::ConnectionError,
    transport::{read_frame, write_frame},
};
use mmos_proto::{
    Payload, ProtocolTag, VirtualAddress, VirtualPacket,
    payloads::{Goodbye, HelloReply},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{TcpStream, ToSocketAddrs},
};

use crate::{env::SystemEnv, error::BridgeError};

/// Established session seen from the front-end.
pub struct DeviceClient<S, E> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    env: E,
    connection: Connection,
    welcome: HelloReply,
}

impl DeviceClient<TcpStream, SystemEnv> {
    /// Connect to a bridge over TCP and complete the handshake.
    ///
    /// # Errors
    /// See [`DeviceClient::handshake`].
    pub async fn connect(addr: impl ToSocketAddrs, name: &str) -> Result<Self, BridgeError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::handshake(stream, SystemEnv, name).await
    }
}

impl<S, E> DeviceClient<S, E>
where
    S: AsyncRead + AsyncWrite + Unpin,
    E: Environment,
{
    /// Say `Hello` on `stream` and wait for the bridge's answer.
    ///
    /// # Errors
    /// - `Rejected` if the bridge answered with an error
    /// - `ClosedDuringHandshake` if the stream ended first
    /// - `Transport` / `Connection` on I/O or protocol failures
    pub async fn handshake(stream: S, env: E, name: &str) -> Result<Self, BridgeError> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut connection = Connection::new(env.now(), ConnectionConfig::default());

        for action in connection.send_hello(name, env.now())? {
            if let ConnectionAction::SendFrame(frame) = action {
                write_frame(&mut writer, &frame).await?;
            }
        }

        let frame = read_frame(&mut reader).await?.ok_or(BridgeError::ClosedDuringHandshake)?;
        let welcome = match Payload::from_frame(&frame)? {
            Payload::HelloReply(reply) => reply,
            Payload::Error(error) => {
                return Err(BridgeError::Rejected(format!("{:?}: {}", error.code, error.message)));
            },
            other => {
                return Err(ConnectionError::UnexpectedFrame {
                    state: connection.state(),
                    opcode: other.opcode().to_u16(),
                }
                .into());
            },
        };
        connection.handle_frame(&frame, env.now())?;

        Ok(Self { reader, writer, env, connection, welcome })
    }

    /// Address of the device kernel serving this session.
    pub fn address(&self) -> VirtualAddress {
        self.welcome.address
    }

    /// Address packets from this client carry.
    pub fn player(&self) -> VirtualAddress {
        self.welcome.player
    }

    /// Session identifier.
    pub fn session_id(&self) -> u64 {
        self.welcome.session_id
    }

    /// Send `payload` to `dst` on `tag`.
    ///
    /// # Errors
    /// `Protocol` if the payload is too large, `Transport` if the write fails.
    pub async fn send(
        &mut self,
        dst: VirtualAddress,
        tag: impl Into<ProtocolTag>,
        payload: impl Into<Bytes>,
    ) -> Result<(), BridgeError> {
        let packet =
            VirtualPacket::new(self.player(), dst, tag, payload, self.welcome.default_ttl);
        self.send_packet(packet).await
    }

    /// Send a prepared packet. The bridge overwrites its source.
    ///
    /// # Errors
    /// `Protocol` if the payload is too large, `Transport` if the write fails.
    pub async fn send_packet(&mut self, packet: VirtualPacket) -> Result<(), BridgeError> {
        let frame = Payload::Packet(packet).into_frame()?;
        write_frame(&mut self.writer, &frame).await?;
        Ok(())
    }

    /// Next packet for this client, answering heartbeats on the way.
    ///
    /// Returns `None` once the bridge ends the session.
    ///
    /// # Errors
    /// `Transport` / `Connection` on I/O or protocol failures.
    pub async fn recv(&mut self) -> Result<Option<VirtualPacket>, BridgeError> {
        loop {
            let Some(frame) = read_frame(&mut self.reader).await? else {
                self.connection.close();
                return Ok(None);
            };

            for action in self.connection.handle_frame(&frame, self.env.now())? {
                match action {
                    ConnectionAction::SendFrame(frame) => {
                        write_frame(&mut self.writer, &frame).await?;
                    },
                    ConnectionAction::Deliver(packet) => return Ok(Some(packet)),
                    ConnectionAction::Close { reason } => {
                        tracing::debug!(%reason, "bridge closed the session");
                        return Ok(None);
                    },
                }
            }
        }
    }

    /// Say goodbye and close the write half.
    ///
    /// # Errors
    /// `Transport` if the write fails.
    pub async fn goodbye(mut self, reason: &str) -> Result<(), BridgeError> {
        let frame = Payload::Goodbye(Goodbye { reason: reason.to_string() }).into_frame()?;
        write_frame(&mut self.writer, &frame).await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}
