//! Mesh-topology radio over framed TCP.
//!
//! Every radio owns an accept loop on an ephemeral port and announces
//! `(tag, port)` to the local synchronisation server. A membership refresh
//! task polls the registry and keeps one outbound connection per known
//! peer, so a broadcast is a fan-out over the connected-peers map while
//! inbound frames from any peer land in the mailbox after filtering.
//!
//! ```text
//!   user ──send──► peers map ──frame──► remote accept loop ──► reader
//!                                                               │ filter
//!   user ◄─receive── mailbox ◄──────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::net::{interfaces, Connection, ConnectionServer, PeerAddress};
use crate::protocol::command::{MicrobitCommand, RadioSendBytes};
use crate::radio::{admit, decode_text_message, Mailbox, MailboxEntry, RadioConfig, MESSAGE_PREFIX};
use crate::sync::{SyncClient, SyncServer, SyncServerHandle, SyncServerOptions};

// ────────────────────────────────────────────────────────────────────────────
// Options
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LanRadioOptions {
    /// Sync port of the synchronisation service (gossip between servers).
    pub sync_address: PeerAddress,
    /// Data port of the synchronisation service (orders from this radio).
    pub data_address: PeerAddress,
    /// First port tried for the radio's own listener; incremented while in
    /// use.
    pub base_port: u16,
    /// Local IP override handed to an auto-started synchronisation server.
    pub ip: Option<String>,
    /// Probe targets handed to an auto-started synchronisation server.
    pub target_ips: Option<Vec<String>>,
    /// Pace of membership refresh (and of the auto-started server).
    pub interval: Duration,
    /// Timeout for outbound connects.
    pub connect_timeout: Option<Duration>,
}

impl Default for LanRadioOptions {
    fn default() -> Self {
        LanRadioOptions {
            sync_address: PeerAddress::new("127.0.0.1", 8765),
            data_address: PeerAddress::new("127.0.0.1", 8766),
            base_port: 8767,
            ip: None,
            target_ips: None,
            interval: Duration::from_secs(1),
            connect_timeout: Some(Duration::from_secs(1)),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Radio
// ────────────────────────────────────────────────────────────────────────────

pub struct LanRadio {
    inner: Arc<LanInner>,
    // Kept alive so an auto-started synchronisation server serves every
    // radio in the process for as long as the first one exists.
    _sync_server: Option<SyncServerHandle>,
}

struct LanInner {
    options: LanRadioOptions,
    aliases: Vec<String>,
    config: Mutex<RadioConfig>,
    mailbox: Mailbox,
    sync_client: SyncClient,
    peers: Mutex<HashMap<PeerAddress, Arc<Connection>>>,
    state: Mutex<Option<ActiveState>>,
    // Serialises on/off/configure transitions.
    ops: AsyncMutex<()>,
}

struct ActiveState {
    port: u16,
    cancel: CancellationToken,
}

impl LanRadio {
    /// Create a radio, starting a local synchronisation server when none is
    /// reachable at the configured sync address.
    pub async fn new(options: LanRadioOptions) -> Result<Self> {
        let sync_server = if Connection::is_port_open(&options.sync_address, options.connect_timeout)
            .await
        {
            None
        } else {
            let server_options = SyncServerOptions {
                sync_port: options.sync_address.port(),
                data_port: options.data_address.port(),
                ip: options.ip.clone(),
                target_ips: options.target_ips.clone(),
                interval: options.interval,
                connect_timeout: options.connect_timeout,
            };
            match SyncServer::start(server_options).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    // Lost the race against another process; the port is
                    // served either way.
                    debug!("did not start a local synchronisation server: {e}");
                    None
                }
            }
        };

        let aliases = interfaces::loopback_aliases(&interfaces::local_ipv4_addresses().await);
        let config = RadioConfig::default();
        let mailbox = Mailbox::new(config.queue);
        let sync_client = SyncClient::new(options.connect_timeout);

        Ok(LanRadio {
            inner: Arc::new(LanInner {
                options,
                aliases,
                config: Mutex::new(config),
                mailbox,
                sync_client,
                peers: Mutex::new(HashMap::new()),
                state: Mutex::new(None),
                ops: AsyncMutex::new(()),
            }),
            _sync_server: sync_server,
        })
    }

    pub fn is_on(&self) -> bool {
        self.inner.state.lock().is_some()
    }

    /// The port the radio is listening on, while on.
    pub fn local_port(&self) -> Option<u16> {
        self.inner.state.lock().as_ref().map(|state| state.port)
    }

    /// How many peers are currently connected.
    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }

    /// Enable the radio: bind a port, announce the tag, start the accept
    /// and membership-refresh workers.
    pub async fn on(&self) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        if self.inner.state.lock().is_some() {
            return Ok(());
        }

        let base = self.inner.options.base_port;
        let mut port = base;
        let server = loop {
            match ConnectionServer::bind("", port).await {
                Ok(server) => break server,
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    if port == u16::MAX {
                        return Err(Error::PortsExhausted { base });
                    }
                    port += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.inner
            .sync_client
            .connect(self.inner.options.data_address.clone())
            .await?;
        let tag = self.inner.config.lock().tag();
        if let Err(e) = self.inner.sync_client.link_port(&tag, port).await {
            warn!("could not announce {tag} on port {port}: {e}");
        }

        let cancel = CancellationToken::new();
        *self.inner.state.lock() = Some(ActiveState {
            port,
            cancel: cancel.clone(),
        });

        {
            let inner = self.inner.clone();
            let ct = cancel.clone();
            tokio::spawn(async move {
                accept_connections(inner, server, ct).await;
            });
        }
        {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                refresh_peers(inner, cancel).await;
            });
        }

        debug!("radio on, listening on port {port} as {tag}");
        Ok(())
    }

    /// Disable the radio: withdraw the registration, stop the workers,
    /// release the port.
    pub async fn off(&self) {
        let _ops = self.inner.ops.lock().await;
        let Some(state) = self.inner.state.lock().take() else {
            return;
        };

        if let Err(e) = self.inner.sync_client.unlink_port(state.port).await {
            debug!("could not withdraw port {}: {e}", state.port);
        }
        self.inner.sync_client.disconnect().await;
        state.cancel.cancel();

        let peers: Vec<Arc<Connection>> = self.inner.peers.lock().drain().map(|(_, c)| c).collect();
        for connection in peers {
            connection.close().await;
        }
        debug!("radio off, released port {}", state.port);
    }

    /// Apply a new configuration. Resets the mailbox; while on, withdraws
    /// the old registration and announces the new tag.
    pub async fn configure(&self, config: RadioConfig) -> Result<()> {
        config.validate()?;
        let _ops = self.inner.ops.lock().await;

        let port = self.inner.state.lock().as_ref().map(|state| state.port);
        if let Some(port) = port {
            let _ = self.inner.sync_client.unlink_port(port).await;
        }

        *self.inner.config.lock() = config.clone();
        self.inner.mailbox.reset(config.queue);

        if let Some(port) = port {
            let _ = self.inner.sync_client.link_port(&config.tag(), port).await;
        }
        Ok(())
    }

    /// Back to the defaults.
    pub async fn reset(&self) -> Result<()> {
        self.configure(RadioConfig::default()).await
    }

    /// Broadcast raw bytes to every connected peer. Inert while off; peers
    /// that fail to take the message are dropped from the map.
    pub async fn send_bytes(&self, message: &[u8]) -> Result<()> {
        if !self.is_on() {
            return Ok(());
        }
        let config = self.inner.config.lock().clone();
        if message.len() > config.length {
            return Err(Error::LengthExceeded {
                length: message.len(),
                max: config.length,
            });
        }

        let command = MicrobitCommand::RadioSendBytes(RadioSendBytes {
            address: config.address,
            channel: config.channel,
            group: config.group,
            power: config.power,
            message: message.to_vec(),
        });
        let payload = serde_json::to_vec(&command).expect("command serialisation is infallible");

        // Snapshot so no lock is held across the sends.
        let peers: Vec<(PeerAddress, Arc<Connection>)> = self
            .inner
            .peers
            .lock()
            .iter()
            .map(|(addr, connection)| (addr.clone(), connection.clone()))
            .collect();

        for (addr, connection) in peers {
            if connection.send(&payload).await.is_err() {
                debug!("connection lost with the radio at {addr}");
                let removed = self.inner.peers.lock().remove(&addr);
                if let Some(connection) = removed {
                    connection.close().await;
                }
            }
        }
        Ok(())
    }

    /// Broadcast a string, wrapped in the cross-platform text envelope.
    pub async fn send(&self, message: &str) -> Result<()> {
        if !self.is_on() {
            return Ok(());
        }
        let mut framed = MESSAGE_PREFIX.to_vec();
        framed.extend_from_slice(message.as_bytes());
        self.send_bytes(&framed).await
    }

    /// Pop the next message, or `None` when the mailbox is empty or the
    /// radio is off.
    pub fn receive_bytes(&self) -> Option<Vec<u8>> {
        if !self.is_on() {
            return None;
        }
        self.inner.mailbox.pop().map(|entry| entry.message)
    }

    /// Pop the next message into `buffer`, truncating to the buffer and
    /// returning the full message length.
    pub fn receive_bytes_into(&self, buffer: &mut [u8]) -> Option<usize> {
        let message = self.receive_bytes()?;
        let copied = message.len().min(buffer.len());
        buffer[..copied].copy_from_slice(&message[..copied]);
        Some(message.len())
    }

    /// Pop the next message as text, stripping the envelope prefix.
    pub fn receive(&self) -> Result<Option<String>> {
        match self.receive_bytes() {
            None => Ok(None),
            Some(message) => decode_text_message(message).map(Some),
        }
    }

    /// Pop the next message together with its signal strength and
    /// microsecond timestamp.
    pub fn receive_full(&self) -> Option<MailboxEntry> {
        if !self.is_on() {
            return None;
        }
        self.inner.mailbox.pop()
    }
}

impl Drop for LanInner {
    fn drop(&mut self) {
        if let Some(state) = self.state.lock().take() {
            state.cancel.cancel();
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Workers
// ────────────────────────────────────────────────────────────────────────────

/// Accept inbound radio connections; one reader task per connection.
async fn accept_connections(
    inner: Arc<LanInner>,
    server: ConnectionServer,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = server.accept() => accepted,
        };
        match accepted {
            Ok((connection, addr)) => {
                debug!("radio connection from {addr}");
                let inner = inner.clone();
                let ct = cancel.child_token();
                tokio::spawn(async move {
                    receive_frames(inner, connection, ct).await;
                });
            }
            Err(e) => warn!("radio accept error: {e}"),
        }
    }
    // The server drops here, releasing the port.
}

/// Decode, filter, and enqueue everything one peer sends us.
async fn receive_frames(inner: Arc<LanInner>, connection: Connection, cancel: CancellationToken) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = connection.recv() => received,
        };
        let Ok(bytes) = received else {
            debug!("connection lost with a radio peer");
            break;
        };
        match serde_json::from_slice::<MicrobitCommand>(&bytes) {
            Ok(command) => {
                let config = inner.config.lock().clone();
                if let Some(entry) = admit(&command, &config) {
                    if !inner.mailbox.push(entry) {
                        debug!("mailbox full, dropping broadcast");
                    }
                }
            }
            Err(e) => warn!("received invalid command: {e}"),
        }
    }
    connection.close().await;
}

/// Poll the registry every interval and reconcile the peer map with it.
async fn refresh_peers(inner: Arc<LanInner>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(inner.options.interval) => {}
        }

        let Some(own_port) = inner.state.lock().as_ref().map(|state| state.port) else {
            break;
        };
        let tag = inner.config.lock().tag();

        let addresses = match inner.sync_client.get_addresses(&tag).await {
            Ok(addresses) => addresses,
            Err(e) => {
                debug!("membership refresh failed: {e}");
                continue;
            }
        };

        // Our own listener shows up in the registry; skip it.
        let desired: HashSet<PeerAddress> = addresses
            .into_iter()
            .filter(|addr| {
                !(addr.port() == own_port && inner.aliases.iter().any(|a| a == addr.host()))
            })
            .collect();

        let stale: Vec<Arc<Connection>> = {
            let mut peers = inner.peers.lock();
            let gone: Vec<PeerAddress> = peers
                .keys()
                .filter(|addr| !desired.contains(addr))
                .cloned()
                .collect();
            gone.iter().filter_map(|addr| peers.remove(addr)).collect()
        };
        for connection in stale {
            connection.close().await;
        }

        for addr in desired {
            if inner.peers.lock().contains_key(&addr) {
                continue;
            }
            match Connection::try_connect(&addr, inner.options.connect_timeout).await {
                Some(connection) => {
                    debug!("connected to the radio at {addr}");
                    inner.peers.lock().insert(addr, Arc::new(connection));
                }
                None => debug!("could not connect to the radio at {addr}"),
            }
        }
    }
}
