//! Bidirectional command channels.
//!
//! A peer carries [`MicrobitCommand`]s both ways over some reliable
//! transport. Two transports exist:
//!
//! 1. **`WebsocketPeer`** — one WebSocket message per command. Used between
//!    radios and the fabric broker, and towards the simulator UI.
//! 2. **`IoPeer`** — one JSON command per line on a byte stream pair. Used
//!    when the simulator runs as a subprocess speaking on stdin/stdout.
//!
//! Both expose the same API through [`MicrobitPeer`]: commands are pushed
//! with `send_command` (safe from any task, serialised on the write half),
//! and received by running `listen` on a dedicated task, which invokes the
//! registered listeners one command at a time in arrival order. `stop`
//! interrupts the listen loop cooperatively; `close` is final and
//! idempotent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::warn;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::command::{decode_command, encode_command, MicrobitCommand};

// ────────────────────────────────────────────────────────────────────────────
// Peer API
// ────────────────────────────────────────────────────────────────────────────

/// How a peer announces it is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error,
}

impl ExitStatus {
    fn close_code(self) -> CloseCode {
        match self {
            // 1000 on normal shutdown, 1011 on error.
            ExitStatus::Success => CloseCode::Normal,
            ExitStatus::Error => CloseCode::Error,
        }
    }
}

/// Handle returned by `add_listener`, used to unregister it again.
///
/// Closures are not comparable, so listeners are removed by token rather
/// than by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// The command API shared by every transport.
#[allow(async_fn_in_trait)]
pub trait MicrobitPeer {
    /// Send one command. Safe to call from any task concurrently with
    /// `listen`; after the first failure the peer is permanently closed.
    async fn send_command(&self, command: &MicrobitCommand) -> Result<()>;

    /// Register a listener invoked from the listen loop for every received
    /// command, in arrival order. Listeners must not block indefinitely.
    fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MicrobitCommand) + Send + Sync + 'static;

    fn remove_listener(&self, id: ListenerId);

    fn is_listening(&self) -> bool;

    /// Run the read loop until `stop` or the stream dies. A peer has one
    /// read loop at a time; calling `listen` from two tasks is undefined.
    async fn listen(&self) -> Result<()>;

    /// Interrupt the listen loop at its next suspension point.
    fn stop(&self);

    /// Close the peer. Final and idempotent.
    async fn close(&self, status: ExitStatus, reason: &str);
}

// ────────────────────────────────────────────────────────────────────────────
// Listener registry (shared by both transports)
// ────────────────────────────────────────────────────────────────────────────

type Listener = Arc<dyn Fn(&MicrobitCommand) + Send + Sync>;

#[derive(Default)]
struct ListenerSet {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl ListenerSet {
    fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MicrobitCommand) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    fn remove(&self, id: ListenerId) {
        self.listeners.lock().retain(|(entry, _)| *entry != id);
    }

    /// Snapshot first so no lock is held while listeners run.
    fn dispatch(&self, command: &MicrobitCommand) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(command);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// WebSocket transport
// ────────────────────────────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A command channel over a WebSocket connection.
pub struct WebsocketPeer {
    writer: AsyncMutex<SplitSink<WsStream, Message>>,
    reader: AsyncMutex<SplitStream<WsStream>>,
    listeners: ListenerSet,
    listening: AtomicBool,
    stopped: CancellationToken,
    closed: AtomicBool,
}

impl WebsocketPeer {
    /// Wrap an already-established WebSocket connection.
    pub fn new(websocket: WsStream) -> Self {
        let (writer, reader) = websocket.split();
        WebsocketPeer {
            writer: AsyncMutex::new(writer),
            reader: AsyncMutex::new(reader),
            listeners: ListenerSet::default(),
            listening: AtomicBool::new(false),
            stopped: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a client connection to `ws://host:port`.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let (websocket, _) = connect_async(format!("ws://{host}:{port}"))
            .await
            .map_err(|_| Error::CommunicationClosed)?;
        Ok(WebsocketPeer::new(websocket))
    }

    /// Accept exactly one peer connection on `host:port`, retrying until a
    /// handshake succeeds, then release the listening socket.
    pub async fn wait_for_connection(host: &str, port: u16) -> Result<Self> {
        let bind_host = if host.is_empty() { "0.0.0.0" } else { host };
        let listener = TcpListener::bind((bind_host, port)).await?;
        loop {
            let (stream, _) = listener.accept().await?;
            match accept_async(MaybeTlsStream::Plain(stream)).await {
                Ok(websocket) => return Ok(WebsocketPeer::new(websocket)),
                Err(e) => {
                    warn!("websocket handshake failed: {e}");
                    continue;
                }
            }
        }
    }

    fn mark_closed(&self) -> Error {
        self.closed.store(true, Ordering::SeqCst);
        Error::CommunicationClosed
    }
}

impl MicrobitPeer for WebsocketPeer {
    async fn send_command(&self, command: &MicrobitCommand) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::CommunicationClosed);
        }
        let text = encode_command(command);
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| self.mark_closed())
    }

    fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MicrobitCommand) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    async fn listen(&self) -> Result<()> {
        self.listening.store(true, Ordering::SeqCst);

        let result = loop {
            let message = tokio::select! {
                _ = self.stopped.cancelled() => break Ok(()),
                message = async { self.reader.lock().await.next().await } => message,
            };

            match message {
                None | Some(Err(_)) => break Err(self.mark_closed()),
                // The remote said goodbye cleanly.
                Some(Ok(Message::Close(_))) => {
                    self.stop();
                    break Ok(());
                }
                Some(Ok(Message::Text(text))) => match decode_command(&text) {
                    Ok(command) => self.listeners.dispatch(&command),
                    Err(e) => warn!("received invalid command: {e}"),
                },
                // Binary, ping and pong frames are not part of the protocol.
                Some(Ok(_)) => {}
            }
        };

        self.listening.store(false, Ordering::SeqCst);
        result
    }

    fn stop(&self) {
        self.stopped.cancel();
    }

    async fn close(&self, status: ExitStatus, reason: &str) {
        self.stopped.cancel();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let frame = CloseFrame {
            code: status.close_code(),
            reason: reason.to_string().into(),
        };
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(Some(frame))).await;
        let _ = writer.close().await;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Line-delimited byte-stream transport
// ────────────────────────────────────────────────────────────────────────────

/// A command channel over a reader/writer pair, one JSON command per line.
///
/// The concrete stdio instance talks to a simulator subprocess; tests drive
/// the same code over in-memory duplex streams.
pub struct IoPeer<R, W> {
    reader: AsyncMutex<R>,
    writer: AsyncMutex<W>,
    listeners: ListenerSet,
    listening: AtomicBool,
    stopped: CancellationToken,
    closed: AtomicBool,
}

impl IoPeer<BufReader<Stdin>, Stdout> {
    /// The subprocess transport: commands in on stdin, out on stdout.
    pub fn stdio() -> Self {
        IoPeer::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> IoPeer<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        IoPeer {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            listeners: ListenerSet::default(),
            listening: AtomicBool::new(false),
            stopped: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn mark_closed(&self) -> Error {
        self.closed.store(true, Ordering::SeqCst);
        Error::CommunicationClosed
    }
}

impl<R, W> MicrobitPeer for IoPeer<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send_command(&self, command: &MicrobitCommand) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::CommunicationClosed);
        }
        let mut line = encode_command(command);
        line.push('\n');
        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        written.await.map_err(|_| self.mark_closed())
    }

    fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MicrobitCommand) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    async fn listen(&self) -> Result<()> {
        self.listening.store(true, Ordering::SeqCst);

        let result = loop {
            let read = tokio::select! {
                _ = self.stopped.cancelled() => break Ok(()),
                read = async {
                    let mut reader = self.reader.lock().await;
                    let mut line = String::new();
                    reader.read_line(&mut line).await.map(|n| (n, line))
                } => read,
            };

            match read {
                Err(_) | Ok((0, _)) => break Err(self.mark_closed()),
                Ok((_, line)) => {
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    match decode_command(line) {
                        Ok(command) => self.listeners.dispatch(&command),
                        Err(e) => warn!("received invalid command: {e}"),
                    }
                }
            }
        };

        self.listening.store(false, Ordering::SeqCst);
        result
    }

    fn stop(&self) {
        self.stopped.cancel();
    }

    async fn close(&self, status: ExitStatus, reason: &str) {
        self.stopped.cancel();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Stream framing has no close code, so error text goes to the
        // diagnostic channel instead.
        if status == ExitStatus::Error && !reason.is_empty() {
            eprintln!("{reason}");
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.flush().await;
        let _ = writer.shutdown().await;
    }
}
