//! Session link state machine.
//!
//! Manages the lifecycle of one client link to the bridge: handshake,
//! heartbeats, idle timeouts and graceful shutdown. The same machine runs on
//! both ends; the server drives `receive_hello`/`accept`, the client drives
//! `send_hello` and feeds the reply through `handle_frame`.
//!
//! # Architecture: Action-Based State Machine
//!
//! - Methods accept time as parameter (no stored Environment)
//! - Methods return `Result<Vec<ConnectionAction>, ConnectionError>`
//! - Driver code executes actions (send frames, hand packets to the kernel,
//!   close the socket)
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  Hello   ┌─────────┐  HelloReply  ┌─────────────┐  begin_drain  ┌──────────┐
//! │ Init │─────────>│ Pending │─────────────>│ Established │──────────────>│ Draining │
//! └──────┘          └─────────┘              └─────────────┘               └──────────┘
//!                        │                         │                            │
//!                        │ Timeout/Error           │ Goodbye/Timeout            │ close
//!                        ↓                         ↓                            ↓
//!                   ┌────────────────────────── Closed ───────────────────────────┐
//!                   └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Timeouts
//!
//! - **Handshake timeout**: 10 seconds to complete Hello/HelloReply
//! - **Idle timeout**: 60 seconds without any activity
//! - **Heartbeat interval**: 20 seconds (sends Ping to keep alive)

use std::time::{Duration, Instant};

use bytes::Bytes;
use mmos_proto::{
    Frame, FrameHeader, Opcode, Payload, VirtualPacket,
    payloads::{Goodbye, Hello, HelloReply},
};

use crate::error::ConnectionError;

/// Actions returned by the link state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Send this frame to the peer
    SendFrame(Frame),

    /// Hand this packet to the kernel side of the session
    Deliver(VirtualPacket),

    /// Close the link with this reason
    Close {
        /// Reason for closing the link
        reason: String,
    },
}

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing exchanged yet
    Init,
    /// Hello sent (client) or received (server), reply outstanding
    Pending,
    /// Handshake complete, packets flow
    Established,
    /// Shutting down; no new packets are accepted from the peer
    Draining,
    /// Link closed (graceful or error)
    Closed,
}

/// Link configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for completing handshake
    pub handshake_timeout: Duration,
    /// Idle timeout before disconnecting
    pub idle_timeout: Duration,
    /// Heartbeat interval (should be < idle_timeout / 2)
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

/// Link state machine
///
/// This is a pure state machine - no I/O, no Environment storage.
#[derive(Debug, Clone)]
pub struct Connection {
    state: ConnectionState,
    config: ConnectionConfig,
    last_activity: Instant,
    last_heartbeat: Option<Instant>,
    session_id: Option<u64>,
    peer_name: Option<String>,
}

impl Connection {
    /// Create a new link in Init state
    ///
    /// # Arguments
    /// * `now` - Current time (from Environment)
    /// * `config` - Link configuration
    pub fn new(now: Instant, config: ConnectionConfig) -> Self {
        Self {
            state: ConnectionState::Init,
            config,
            last_activity: now,
            last_heartbeat: None,
            session_id: None,
            peer_name: None,
        }
    }

    /// Get current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get session ID (once established)
    #[must_use]
    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Client name announced in Hello (server side)
    #[must_use]
    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    /// Client side: start the handshake.
    ///
    /// # Errors
    /// Returns `InvalidState` if not in Init state
    pub fn send_hello(
        &mut self,
        client_name: impl Into<String>,
        now: Instant,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        self.ensure_state(ConnectionState::Init, "send_hello")?;

        let hello = Hello { version: FrameHeader::VERSION, client_name: client_name.into() };
        let frame = Payload::Hello(hello).into_frame()?;

        self.state = ConnectionState::Pending;
        self.last_activity = now;
        Ok(vec![ConnectionAction::SendFrame(frame)])
    }

    /// Server side: first frame from the client.
    ///
    /// Checks the protocol version and moves to Pending. The driver then
    /// allocates the device and calls [`Connection::accept`].
    ///
    /// # Errors
    /// - `InvalidState` if not in Init state
    /// - `UnexpectedFrame` if the frame is not a Hello
    /// - `VersionMismatch` if the client speaks another version
    pub fn receive_hello(&mut self, frame: &Frame, now: Instant) -> Result<Hello, ConnectionError> {
        self.ensure_state(ConnectionState::Init, "receive_hello")?;

        let Payload::Hello(hello) = Payload::from_frame(frame)? else {
            return Err(ConnectionError::UnexpectedFrame {
                state: self.state,
                opcode: frame.header.opcode(),
            });
        };
        if hello.version != FrameHeader::VERSION {
            return Err(ConnectionError::VersionMismatch {
                expected: FrameHeader::VERSION,
                actual: hello.version,
            });
        }

        self.state = ConnectionState::Pending;
        self.last_activity = now;
        self.peer_name = Some(hello.client_name.clone());
        Ok(hello)
    }

    /// Server side: complete the handshake with `reply`.
    ///
    /// # Errors
    /// Returns `InvalidState` if not in Pending state
    pub fn accept(
        &mut self,
        reply: HelloReply,
        now: Instant,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        self.ensure_state(ConnectionState::Pending, "accept")?;

        self.session_id = Some(reply.session_id);
        let frame = Payload::HelloReply(reply).into_frame()?;

        self.state = ConnectionState::Established;
        self.last_activity = now;
        Ok(vec![ConnectionAction::SendFrame(frame)])
    }

    /// Stop accepting packets from the peer and say goodbye.
    ///
    /// # Errors
    /// Returns `InvalidState` if not Established
    pub fn begin_drain(
        &mut self,
        reason: impl Into<String>,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        self.ensure_state(ConnectionState::Established, "begin_drain")?;

        let frame = Payload::Goodbye(Goodbye { reason: reason.into() }).into_frame()?;
        self.state = ConnectionState::Draining;
        Ok(vec![ConnectionAction::SendFrame(frame)])
    }

    /// Transition to Closed state
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Update last activity timestamp
    pub fn update_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Check if the link has timed out
    ///
    /// # Returns
    /// `Some(elapsed)` if timed out, `None` otherwise
    #[must_use]
    pub fn check_timeout(&self, now: Instant) -> Option<Duration> {
        let elapsed = now.duration_since(self.last_activity);

        let timeout = match self.state {
            ConnectionState::Init | ConnectionState::Pending => self.config.handshake_timeout,
            ConnectionState::Established | ConnectionState::Draining => self.config.idle_timeout,
            ConnectionState::Closed => return None,
        };

        if elapsed > timeout { Some(elapsed) } else { None }
    }

    /// Tick the state machine - check for timeouts and heartbeats
    ///
    /// # Returns
    /// Actions to execute (send Ping, close link)
    pub fn tick(&mut self, now: Instant) -> Vec<ConnectionAction> {
        if let Some(elapsed) = self.check_timeout(now) {
            let reason = match self.state {
                ConnectionState::Init | ConnectionState::Pending => {
                    format!("handshake timeout after {elapsed:?}")
                },
                _ => format!("idle timeout after {elapsed:?}"),
            };

            self.close();
            return vec![ConnectionAction::Close { reason }];
        }

        if self.state != ConnectionState::Established {
            return Vec::new();
        }

        let due = self
            .last_heartbeat
            .is_none_or(|last| now.duration_since(last) >= self.config.heartbeat_interval);
        if !due {
            return Vec::new();
        }

        self.last_heartbeat = Some(now);
        vec![ConnectionAction::SendFrame(Frame::new(FrameHeader::new(Opcode::Ping), Bytes::new()))]
    }

    /// Handle an incoming frame
    ///
    /// # Errors
    /// - `Protocol` if the payload does not decode
    /// - `UnexpectedFrame` if the frame is not allowed in the current state
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        now: Instant,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        let payload = Payload::from_frame(frame)?;
        self.last_activity = now;

        match (self.state, payload) {
            (ConnectionState::Pending, Payload::HelloReply(reply)) if self.peer_name.is_none() => {
                self.session_id = Some(reply.session_id);
                if reply.heartbeat_interval_ms > 0 {
                    self.config.heartbeat_interval =
                        Duration::from_millis(reply.heartbeat_interval_ms);
                }
                self.state = ConnectionState::Established;
                Ok(Vec::new())
            },
            (ConnectionState::Established | ConnectionState::Draining, Payload::Ping) => {
                let pong = Frame::new(FrameHeader::new(Opcode::Pong), Bytes::new());
                Ok(vec![ConnectionAction::SendFrame(pong)])
            },
            (ConnectionState::Established | ConnectionState::Draining, Payload::Pong) => {
                Ok(Vec::new())
            },
            (ConnectionState::Established, Payload::Packet(packet)) => {
                Ok(vec![ConnectionAction::Deliver(packet)])
            },
            (ConnectionState::Draining, Payload::Packet(packet)) => {
                tracing::debug!(dst = %packet.dst(), "dropping packet received while draining");
                Ok(Vec::new())
            },
            (ConnectionState::Closed, _) => Err(ConnectionError::UnexpectedFrame {
                state: ConnectionState::Closed,
                opcode: frame.header.opcode(),
            }),
            (_, Payload::Goodbye(goodbye)) => {
                self.close();
                Ok(vec![ConnectionAction::Close { reason: goodbye.reason }])
            },
            (_, Payload::Error(error)) => {
                self.close();
                Ok(vec![ConnectionAction::Close {
                    reason: format!("peer error {:?}: {}", error.code, error.message),
                }])
            },
            (state, other) => {
                Err(ConnectionError::UnexpectedFrame { state, opcode: other.opcode().to_u16() })
            },
        }
    }

    fn ensure_state(
        &self,
        expected: ConnectionState,
        operation: &str,
    ) -> Result<(), ConnectionError> {
        if self.state != expected {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: operation.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mmos_proto::{
        VirtualAddress,
        payloads::{ErrorCode, ErrorPayload},
    };

    use super::*;

    fn reply() -> HelloReply {
        HelloReply {
            session_id: 42,
            address: VirtualAddress::device(7),
            player: VirtualAddress::player(7),
            default_ttl: 8,
            heartbeat_interval_ms: 5_000,
        }
    }

    fn frame(payload: Payload) -> Frame {
        payload.into_frame().unwrap()
    }

    fn hello_frame(version: u8) -> Frame {
        frame(Payload::Hello(Hello { version, client_name: "test".into() }))
    }

    fn established(t0: Instant) -> Connection {
        let mut conn = Connection::new(t0, ConnectionConfig::default());
        conn.receive_hello(&hello_frame(FrameHeader::VERSION), t0).unwrap();
        conn.accept(reply(), t0).unwrap();
        conn
    }

    #[test]
    fn server_handshake() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, ConnectionConfig::default());

        let hello = conn.receive_hello(&hello_frame(FrameHeader::VERSION), t0).unwrap();
        assert_eq!(hello.client_name, "test");
        assert_eq!(conn.state(), ConnectionState::Pending);
        assert_eq!(conn.peer_name(), Some("test"));

        let actions = conn.accept(reply(), t0).unwrap();
        assert_eq!(conn.state(), ConnectionState::Established);
        assert_eq!(conn.session_id(), Some(42));
        assert_eq!(actions, vec![ConnectionAction::SendFrame(frame(Payload::HelloReply(reply())))]);
    }

    #[test]
    fn client_handshake_adopts_heartbeat() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, ConnectionConfig::default());

        let actions = conn.send_hello("client", t0).unwrap();
        assert!(matches!(&actions[..], [ConnectionAction::SendFrame(f)]
            if f.header.opcode_enum() == Some(Opcode::Hello)));

        conn.handle_frame(&frame(Payload::HelloReply(reply())), t0).unwrap();
        assert_eq!(conn.state(), ConnectionState::Established);
        assert_eq!(conn.session_id(), Some(42));

        assert_eq!(conn.tick(t0).len(), 1);
        assert!(conn.tick(t0 + Duration::from_secs(4)).is_empty());
        assert_eq!(conn.tick(t0 + Duration::from_secs(5)).len(), 1);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, ConnectionConfig::default());

        let result = conn.receive_hello(&hello_frame(FrameHeader::VERSION + 1), t0);
        assert!(matches!(result, Err(ConnectionError::VersionMismatch { .. })));
        assert_eq!(conn.state(), ConnectionState::Init);
    }

    #[test]
    fn first_frame_must_be_hello() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, ConnectionConfig::default());

        let result = conn.receive_hello(&frame(Payload::Ping), t0);
        assert_eq!(
            result,
            Err(ConnectionError::UnexpectedFrame {
                state: ConnectionState::Init,
                opcode: Opcode::Ping.to_u16()
            })
        );
    }

    #[test]
    fn ping_is_answered() {
        let t0 = Instant::now();
        let mut conn = established(t0);

        let actions = conn.handle_frame(&frame(Payload::Ping), t0).unwrap();
        assert!(matches!(&actions[..], [ConnectionAction::SendFrame(f)]
            if f.header.opcode_enum() == Some(Opcode::Pong)));
    }

    #[test]
    fn packets_are_delivered_until_draining() {
        let t0 = Instant::now();
        let mut conn = established(t0);
        let packet = VirtualPacket::new(
            VirtualAddress::player(7),
            VirtualAddress::device(7),
            1u16,
            &b"hi"[..],
            8,
        );

        let actions = conn.handle_frame(&frame(Payload::Packet(packet.clone())), t0).unwrap();
        assert_eq!(actions, vec![ConnectionAction::Deliver(packet.clone())]);

        let actions = conn.begin_drain("shutdown").unwrap();
        assert!(matches!(&actions[..], [ConnectionAction::SendFrame(f)]
            if f.header.opcode_enum() == Some(Opcode::Goodbye)));
        assert_eq!(conn.state(), ConnectionState::Draining);

        let actions = conn.handle_frame(&frame(Payload::Packet(packet)), t0).unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn goodbye_closes() {
        let t0 = Instant::now();
        let mut conn = established(t0);

        let goodbye = frame(Payload::Goodbye(Goodbye { reason: "bye".into() }));
        let actions = conn.handle_frame(&goodbye, t0).unwrap();
        assert_eq!(actions, vec![ConnectionAction::Close { reason: "bye".into() }]);
        assert_eq!(conn.state(), ConnectionState::Closed);

        assert!(conn.handle_frame(&frame(Payload::Ping), t0).is_err());
    }

    #[test]
    fn peer_error_closes() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, ConnectionConfig::default());
        conn.send_hello("client", t0).unwrap();

        let error = frame(Payload::Error(ErrorPayload {
            code: ErrorCode::AddressExhausted,
            message: "no addresses".into(),
        }));
        let actions = conn.handle_frame(&error, t0).unwrap();
        assert!(matches!(&actions[..], [ConnectionAction::Close { reason }]
            if reason.contains("no addresses")));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn packet_before_handshake_is_unexpected() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, ConnectionConfig::default());
        conn.send_hello("client", t0).unwrap();

        let packet = VirtualPacket::new(
            VirtualAddress::device(1),
            VirtualAddress::device(2),
            1u16,
            Bytes::new(),
            8,
        );
        let result = conn.handle_frame(&frame(Payload::Packet(packet)), t0);
        assert!(matches!(result, Err(ConnectionError::UnexpectedFrame { .. })));
    }

    #[test]
    fn handshake_timeout() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, ConnectionConfig::default());

        assert!(conn.check_timeout(t0).is_none());
        let t1 = t0 + Duration::from_secs(11);
        let actions = conn.tick(t1);
        assert!(matches!(&actions[..], [ConnectionAction::Close { reason }]
            if reason.starts_with("handshake timeout")));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn idle_timeout_is_reset_by_activity() {
        let t0 = Instant::now();
        let mut conn = established(t0);

        let t1 = t0 + Duration::from_secs(50);
        conn.handle_frame(&frame(Payload::Pong), t1).unwrap();
        assert!(conn.check_timeout(t0 + Duration::from_secs(100)).is_none());

        let actions = conn.tick(t1 + Duration::from_secs(61));
        assert!(matches!(&actions[..], [ConnectionAction::Close { reason }]
            if reason.starts_with("idle timeout")));
    }

    #[test]
    fn invalid_state_transitions() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, ConnectionConfig::default());

        assert!(matches!(conn.accept(reply(), t0), Err(ConnectionError::InvalidState { .. })));
        assert!(matches!(conn.begin_drain("x"), Err(ConnectionError::InvalidState { .. })));

        conn.send_hello("client", t0).unwrap();
        assert!(matches!(conn.send_hello("client", t0), Err(ConnectionError::InvalidState { .. })));
    }
}
