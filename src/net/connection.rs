//! Framed TCP connections.
//!
//! [`Connection`] owns a stream exclusively and exchanges discrete frames
//! (see [`crate::protocol::frame`]). Send and receive each serialise on
//! their half of the stream, so one task can read while another writes.
//! [`ConnectionServer`] is the accept side.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::net::PeerAddress;
use crate::protocol::frame::{read_frame, write_frame};

/// A framed, bidirectional TCP connection.
pub struct Connection {
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<OwnedWriteHalf>,
    alive: AtomicBool,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Connection {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            alive: AtomicBool::new(true),
        }
    }

    /// Connect to `addr`, honouring the optional timeout.
    pub async fn connect(addr: &PeerAddress, timeout: Option<Duration>) -> Result<Self> {
        let connecting = TcpStream::connect((addr.host(), addr.port()));
        let stream = match timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
                })??,
            None => connecting.await?,
        };
        Ok(Connection::new(stream))
    }

    /// Like [`Connection::connect`], but swallows the failure.
    pub async fn try_connect(addr: &PeerAddress, timeout: Option<Duration>) -> Option<Self> {
        Connection::connect(addr, timeout).await.ok()
    }

    /// Check whether something is listening at `addr`.
    pub async fn is_port_open(addr: &PeerAddress, timeout: Option<Duration>) -> bool {
        Connection::try_connect(addr, timeout).await.is_some()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send one frame. The first failure closes the connection for good.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::CommunicationClosed);
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, payload).await.map_err(|e| {
            self.alive.store(false, Ordering::SeqCst);
            e
        })
    }

    /// Receive one frame, blocking until it is complete.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        if !self.is_alive() {
            return Err(Error::CommunicationClosed);
        }
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader).await.map_err(|e| {
            self.alive.store(false, Ordering::SeqCst);
            e
        })
    }

    /// Close the connection. Idempotent; concurrent reads fail as the
    /// stream shuts down.
    pub async fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            use tokio::io::AsyncWriteExt;
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
    }
}

/// Accepts incoming framed connections on a bound TCP port.
pub struct ConnectionServer {
    listener: TcpListener,
}

impl ConnectionServer {
    /// Bind to `host:port`. The wildcard host `""` means all interfaces.
    pub async fn bind(host: &str, port: u16) -> std::io::Result<Self> {
        let bind_host = if host.is_empty() { "0.0.0.0" } else { host };
        let listener = TcpListener::bind((bind_host, port)).await?;
        Ok(ConnectionServer { listener })
    }

    /// The port actually bound, for ephemeral binds.
    pub fn local_port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    /// Wait for an incoming connection. Dropping the server unblocks any
    /// task selecting on this together with a cancellation token.
    pub async fn accept(&self) -> std::io::Result<(Connection, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        Ok((Connection::new(stream), addr))
    }
}
