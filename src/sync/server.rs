//! Synchronisation server — one per host process.
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────────────────────────────────────────────────────────────┐
//!  │                        SyncServer::start                        │
//!  │                                                                 │
//!  │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//!  │  │  sync accept │  │  data accept │  │  probers (1 / target)│   │
//!  │  │ (peer gossip)│  │   (orders)   │  │  retry TCP connect   │   │
//!  │  └──────┬───────┘  └──────┬───────┘  └──────────┬───────────┘   │
//!  │         │                 │                     │               │
//!  │     gossip pair       order loop            gossip pair         │
//!  │         └──────────┬──────┴─────────────────────┘               │
//!  │                    ▼                                            │
//!  │             AddressesLinker                                     │
//!  └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The **sync port** accepts peer synchronisation servers; every such
//! connection runs a symmetric gossip loop (send the local linker, receive
//! the remote one, merge, sleep, repeat). The **data port** accepts
//! synchronisation clients; each of those owns at most one registry entry,
//! placed by `link` orders and reaped when the connection dies. Probers
//! sweep the configured targets (or the local /24s) forever, handing every
//! successful connect to the gossip loop, so replicas find each other with
//! no central directory.
//!
//! All tasks share one [`CancellationToken`]; cancelling it stops
//! everything.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::net::{interfaces, Connection, ConnectionServer, PeerAddress};
use crate::sync::linker::AddressesLinker;
use crate::sync::order::Order;

// ────────────────────────────────────────────────────────────────────────────
// Options and handle
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SyncServerOptions {
    /// Port accepting peer synchronisation servers for gossip.
    pub sync_port: u16,
    /// Port accepting synchronisation clients for orders.
    pub data_port: u16,
    /// The local IP to advertise; `None` (or a loopback name) enumerates
    /// every local interface instead.
    pub ip: Option<String>,
    /// Probe targets; `None` sweeps every local /24.
    pub target_ips: Option<Vec<String>>,
    /// Pace of gossip rounds and probe retries.
    pub interval: Duration,
    /// Timeout for outbound probe connects.
    pub connect_timeout: Option<Duration>,
}

impl Default for SyncServerOptions {
    fn default() -> Self {
        SyncServerOptions {
            sync_port: 8765,
            data_port: 8766,
            ip: None,
            target_ips: None,
            interval: Duration::from_secs(1),
            connect_timeout: Some(Duration::from_secs(1)),
        }
    }
}

/// Running server: a cancellation token plus every spawned task.
pub struct SyncServerHandle {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    linker: Arc<AddressesLinker>,
}

impl SyncServerHandle {
    /// The replicated registry this server maintains.
    pub fn linker(&self) -> &Arc<AddressesLinker> {
        &self.linker
    }

    /// Cancel all tasks and await their completion.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    /// Cancel all tasks and abort them without waiting.
    pub fn abort(self) {
        self.cancel.cancel();
        for handle in self.handles {
            handle.abort();
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Entry point
// ────────────────────────────────────────────────────────────────────────────

pub struct SyncServer;

impl SyncServer {
    /// Bind both ports and spawn the accept loops and probers.
    ///
    /// Fails when either port is already in use, before any task starts.
    pub async fn start(options: SyncServerOptions) -> std::io::Result<SyncServerHandle> {
        let own_ips = match &options.ip {
            Some(ip) if ip != "localhost" && ip != "127.0.0.1" => vec![ip.clone()],
            _ => interfaces::local_ipv4_addresses().await,
        };
        let targets = options
            .target_ips
            .clone()
            .unwrap_or_else(|| interfaces::lan_sweep_targets(&own_ips));
        let own_aliases = interfaces::loopback_aliases(&own_ips);

        let sync_server = ConnectionServer::bind("", options.sync_port).await?;
        let data_server = ConnectionServer::bind("", options.data_port).await?;

        let linker = Arc::new(AddressesLinker::new());
        let in_sync: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let cancel = CancellationToken::new();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // ── 1. Gossip accept loop ────────────────────────────────────────
        {
            let linker = linker.clone();
            let in_sync = in_sync.clone();
            let interval = options.interval;
            let ct = cancel.clone();
            handles.push(tokio::spawn(async move {
                accept_sync_connections(sync_server, linker, in_sync, interval, ct).await;
            }));
        }

        // ── 2. Order accept loop ─────────────────────────────────────────
        {
            let linker = linker.clone();
            let ct = cancel.clone();
            handles.push(tokio::spawn(async move {
                accept_data_connections(data_server, linker, ct).await;
            }));
        }

        // ── 3. Probers — one long-lived task per target ──────────────────
        for target in targets {
            if own_aliases.iter().any(|alias| alias == &target) {
                continue;
            }
            let linker = linker.clone();
            let in_sync = in_sync.clone();
            let sync_port = options.sync_port;
            let interval = options.interval;
            let timeout = options.connect_timeout;
            let ct = cancel.clone();
            handles.push(tokio::spawn(async move {
                probe_target(target, sync_port, linker, in_sync, interval, timeout, ct).await;
            }));
        }

        debug!(
            "synchronisation server started (sync_port={}, data_port={})",
            options.sync_port, options.data_port
        );

        Ok(SyncServerHandle {
            cancel,
            handles,
            linker,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Gossip side
// ────────────────────────────────────────────────────────────────────────────

async fn accept_sync_connections(
    server: ConnectionServer,
    linker: Arc<AddressesLinker>,
    in_sync: Arc<Mutex<HashSet<String>>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = server.accept() => accepted,
        };
        match accepted {
            Ok((connection, addr)) => {
                let host = addr.ip().to_string();
                debug!("synchronisation server connected from {host}");
                let linker = linker.clone();
                let in_sync = in_sync.clone();
                let ct = cancel.clone();
                tokio::spawn(async move {
                    gossip(linker, in_sync, host, connection, interval, ct).await;
                });
            }
            Err(e) => warn!("sync accept error: {e}"),
        }
    }
}

/// Symmetric linker exchange: send ours, merge theirs, sleep, repeat.
///
/// A host already in the `in_sync` set is a duplicate pair (the prober and
/// the accept side met in the middle); the newcomer is dropped so exactly
/// one gossip connection serves each pair of servers.
async fn gossip(
    linker: Arc<AddressesLinker>,
    in_sync: Arc<Mutex<HashSet<String>>>,
    host: String,
    connection: Connection,
    interval: Duration,
    cancel: CancellationToken,
) {
    if !in_sync.lock().insert(host.clone()) {
        connection.close().await;
        return;
    }

    loop {
        if cancel.is_cancelled() {
            break;
        }
        if connection
            .send(linker.to_json().as_bytes())
            .await
            .is_err()
        {
            break;
        }
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = connection.recv() => received,
        };
        match received {
            Ok(bytes) => match AddressesLinker::from_json(&String::from_utf8_lossy(&bytes)) {
                Ok(remote) => linker.merge(&remote),
                Err(e) => {
                    warn!("invalid linker snapshot from {host}: {e}");
                    break;
                }
            },
            Err(_) => break,
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }

    connection.close().await;
    in_sync.lock().remove(&host);
    debug!("disconnected from synchronisation server at {host}");
}

/// Forever-retrying outbound connect towards one target host.
async fn probe_target(
    target: String,
    sync_port: u16,
    linker: Arc<AddressesLinker>,
    in_sync: Arc<Mutex<HashSet<String>>>,
    interval: Duration,
    timeout: Option<Duration>,
    cancel: CancellationToken,
) {
    let addr = PeerAddress::new(target.clone(), sync_port);
    while !cancel.is_cancelled() {
        let already_in_sync = in_sync.lock().contains(&target);
        if !already_in_sync {
            if let Some(connection) = Connection::try_connect(&addr, timeout).await {
                debug!("connected to synchronisation server at {addr}");
                gossip(
                    linker.clone(),
                    in_sync.clone(),
                    target.clone(),
                    connection,
                    interval,
                    cancel.clone(),
                )
                .await;
                continue;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Data side
// ────────────────────────────────────────────────────────────────────────────

async fn accept_data_connections(
    server: ConnectionServer,
    linker: Arc<AddressesLinker>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = server.accept() => accepted,
        };
        match accepted {
            Ok((connection, addr)) => {
                let host = addr.ip().to_string();
                debug!("synchronisation client connected from {host}");
                let linker = linker.clone();
                let ct = cancel.clone();
                tokio::spawn(async move {
                    handle_orders(linker, host, connection, ct).await;
                });
            }
            Err(e) => warn!("data accept error: {e}"),
        }
    }
}

/// Serve one synchronisation client until its connection dies.
///
/// The connection owns at most one registry entry; a new `link` replaces
/// it, a matching `unlink` removes it, and whatever is still owned when the
/// client disappears is reaped here.
async fn handle_orders(
    linker: Arc<AddressesLinker>,
    host: String,
    connection: Connection,
    cancel: CancellationToken,
) {
    let mut owned: Option<PeerAddress> = None;

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = connection.recv() => received,
        };
        let Ok(bytes) = received else {
            debug!("disconnected from synchronisation client at {host}");
            break;
        };

        let order = match Order::from_json(&String::from_utf8_lossy(&bytes)) {
            Ok(order) => order,
            Err(e) => {
                warn!("could not read the order from {host}: {e}");
                continue;
            }
        };

        match order {
            Order::Link(tag, port) => {
                if let Some(previous) = owned.take() {
                    linker.unlink(&previous);
                }
                let entry = PeerAddress::new(host.clone(), port);
                linker.link(entry.clone(), tag);
                owned = Some(entry);
            }
            Order::Unlink(port) => {
                if owned.as_ref().is_some_and(|entry| entry.port() == port) {
                    linker.unlink(&owned.take().expect("owned entry was just matched"));
                }
            }
            Order::Get(tag) => {
                let values = linker.values_for(&[tag.as_str()]);
                let reply =
                    serde_json::to_vec(&values).expect("linker serialisation is infallible");
                if connection.send(&reply).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(entry) = owned {
        linker.unlink(&entry);
    }
    connection.close().await;
}
