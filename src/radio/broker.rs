//! The fabric broker: a centralized alternative to the gossip mesh.
//!
//! Radios connect as WebSocket peers; every command a peer sends is
//! rebroadcast to every *other* connected peer, never echoed back. The
//! broker does no filtering — receiving radios filter for themselves — and
//! keeps no registry, so it needs no discovery. Dead peers are dropped
//! when their listen task ends or on the next failed broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, MaybeTlsStream};
use tokio_util::sync::CancellationToken;

use crate::protocol::command::MicrobitCommand;
use crate::protocol::peer::{ExitStatus, MicrobitPeer, WebsocketPeer};

type PeerMap = Arc<Mutex<HashMap<u64, Arc<WebsocketPeer>>>>;

pub struct RadioBroker;

/// Running broker: a cancellation token plus its tasks.
pub struct BrokerHandle {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    port: u16,
}

impl BrokerHandle {
    /// The port actually bound, for ephemeral binds.
    pub fn local_port(&self) -> u16 {
        self.port
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

impl RadioBroker {
    /// Bind `host:port` and start relaying. Fails when the port is in use.
    pub async fn start(host: &str, port: u16) -> std::io::Result<BrokerHandle> {
        let bind_host = if host.is_empty() { "0.0.0.0" } else { host };
        let listener = TcpListener::bind((bind_host, port)).await?;
        let local_port = listener.local_addr()?.port();

        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel::<(u64, MicrobitCommand)>();
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        {
            let peers = peers.clone();
            let ct = cancel.clone();
            handles.push(tokio::spawn(async move {
                accept_peers(listener, peers, tx, ct).await;
            }));
        }
        {
            let peers = peers.clone();
            let ct = cancel.clone();
            handles.push(tokio::spawn(async move {
                broadcast_commands(rx, peers, ct).await;
            }));
        }

        debug!("fabric broker listening on {bind_host}:{local_port}");
        Ok(BrokerHandle {
            cancel,
            handles,
            port: local_port,
        })
    }
}

async fn accept_peers(
    listener: TcpListener,
    peers: PeerMap,
    tx: mpsc::UnboundedSender<(u64, MicrobitCommand)>,
    cancel: CancellationToken,
) {
    let mut next_id: u64 = 0;
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                let id = next_id;
                next_id += 1;
                debug!("fabric peer {id} connected from {addr}");
                let peers = peers.clone();
                let tx = tx.clone();
                let ct = cancel.child_token();
                tokio::spawn(async move {
                    serve_peer(stream, id, peers, tx, ct).await;
                });
            }
            Err(e) => warn!("fabric accept error: {e}"),
        }
    }
}

/// Handshake, register, and pump one peer until it leaves.
async fn serve_peer(
    stream: TcpStream,
    id: u64,
    peers: PeerMap,
    tx: mpsc::UnboundedSender<(u64, MicrobitCommand)>,
    cancel: CancellationToken,
) {
    let websocket = match accept_async(MaybeTlsStream::Plain(stream)).await {
        Ok(websocket) => websocket,
        Err(e) => {
            warn!("websocket handshake failed: {e}");
            return;
        }
    };
    let peer = Arc::new(WebsocketPeer::new(websocket));
    peers.lock().insert(id, peer.clone());
    peer.add_listener(move |command| {
        let _ = tx.send((id, command.clone()));
    });

    let result = tokio::select! {
        _ = cancel.cancelled() => {
            peer.stop();
            Ok(())
        }
        result = peer.listen() => result,
    };
    if let Err(e) = result {
        debug!("fabric peer {id} left: {e}");
    }

    peers.lock().remove(&id);
    peer.close(ExitStatus::Success, "").await;
}

/// Relay every received command to every peer except its sender.
async fn broadcast_commands(
    mut rx: mpsc::UnboundedReceiver<(u64, MicrobitCommand)>,
    peers: PeerMap,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => received,
        };
        let Some((sender, command)) = received else {
            break;
        };

        // Snapshot so no lock is held across the sends.
        let targets: Vec<(u64, Arc<WebsocketPeer>)> = peers
            .lock()
            .iter()
            .filter(|(id, _)| **id != sender)
            .map(|(id, peer)| (*id, peer.clone()))
            .collect();

        for (id, peer) in targets {
            if peer.send_command(&command).await.is_err() {
                debug!("dropping dead fabric peer {id}");
                peers.lock().remove(&id);
            }
        }
    }
}
