//! Turmoil-backed transport.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use mmos_core::transport::Transport;
use turmoil::net::{TcpListener, TcpStream};

/// Listener on turmoil's simulated network.
pub struct SimTransport {
    listener: TcpListener,
}

impl SimTransport {
    /// Bind inside the current turmoil host.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Open a stream to `port` on the simulated host named `host`.
    pub async fn connect_to(host: &str, port: u16) -> io::Result<TcpStream> {
        TcpStream::connect((host, port)).await
    }
}

#[async_trait]
impl Transport for SimTransport {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
