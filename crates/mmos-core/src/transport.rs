//! Transport abstraction and frame I/O.
//!
//! Production accepts TCP connections, simulation accepts turmoil streams.
//! Both hand back one bidirectional byte stream per client; frames are read
//! and written with [`read_frame`] and [`write_frame`].

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use mmos_proto::{Frame, FrameHeader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Listener producing one byte stream per client.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bidirectional stream to one client.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept the next client.
    ///
    /// Blocks until a client connects.
    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// Address the listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Read one frame.
///
/// Returns `Ok(None)` if the peer closed the stream cleanly between frames.
///
/// # Errors
/// - `Io` if the stream fails or ends in the middle of a frame
/// - `Protocol` if the header is invalid
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header_buf = [0u8; FrameHeader::SIZE];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {},
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = FrameHeader::from_bytes(&header_buf)?;

    let mut payload = vec![0u8; header.payload_size() as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame::new(header, payload)))
}

/// Write one frame and flush.
///
/// # Errors
/// - `Io` if the stream fails
/// - `Protocol` if the frame cannot be encoded
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(frame.encoded_len());
    frame.encode(&mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use mmos_proto::{Opcode, Payload, ProtocolError, payloads::Goodbye};

    use super::*;

    #[tokio::test]
    async fn frames_cross_a_stream_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let goodbye = Payload::Goodbye(Goodbye { reason: "done".into() }).into_frame().unwrap();
        let ping = Payload::Ping.into_frame().unwrap();
        write_frame(&mut a, &goodbye).await.unwrap();
        write_frame(&mut a, &ping).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(goodbye));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(ping));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let frame = Payload::Goodbye(Goodbye { reason: "done".into() }).into_frame().unwrap();
        let mut buf = Vec::new();
        frame.encode(&mut buf).unwrap();
        a.write_all(&buf[..buf.len() - 1]).await.unwrap();
        drop(a);

        assert!(matches!(read_frame(&mut b).await, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn garbage_header_is_a_protocol_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&[0xAB; FrameHeader::SIZE]).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(ProtocolError::InvalidMagic(_))));
    }

    #[tokio::test]
    async fn header_only_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&FrameHeader::new(Opcode::Pong).to_bytes()).await.unwrap();

        let frame = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(frame.header.opcode_enum(), Some(Opcode::Pong));
        assert!(frame.payload.is_empty());
    }
}
