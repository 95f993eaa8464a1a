//! Synchronisation client — the order sender a radio uses to announce and
//! query its `(tag, port)` registration.
//!
//! One long-lived connection to the local synchronisation server's data
//! port. A single async mutex guards the handle so an order and its reply
//! never interleave with another task's order. Losing the connection on a
//! write silently drops it; the next call transparently reconnects to the
//! remembered server address.

use std::time::Duration;

use log::{debug, warn};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::net::{Connection, PeerAddress};
use crate::sync::linker::LinkerSnapshot;
use crate::sync::order::Order;

pub struct SyncClient {
    state: AsyncMutex<ClientState>,
    timeout: Option<Duration>,
}

#[derive(Default)]
struct ClientState {
    server: Option<PeerAddress>,
    connection: Option<Connection>,
}

impl SyncClient {
    pub fn new(timeout: Option<Duration>) -> Self {
        SyncClient {
            state: AsyncMutex::new(ClientState::default()),
            timeout,
        }
    }

    /// Connect to the server's data port, replacing any prior connection.
    pub async fn connect(&self, server: PeerAddress) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(old) = state.connection.take() {
            old.close().await;
        }
        let connection = Connection::connect(&server, self.timeout).await?;
        state.server = Some(server);
        state.connection = Some(connection);
        Ok(())
    }

    /// Drop the connection and forget the server.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        if let Some(connection) = state.connection.take() {
            connection.close().await;
        }
        state.server = None;
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state.connection.as_ref().is_some_and(Connection::is_alive)
    }

    /// Announce that `port` serves `tag`.
    pub async fn link_port(&self, tag: &str, port: u16) -> Result<()> {
        self.send_order(&Order::Link(tag.to_string(), port), false)
            .await
            .map(|_| ())
    }

    /// Withdraw the registration for `port`.
    pub async fn unlink_port(&self, port: u16) -> Result<()> {
        self.send_order(&Order::Unlink(port), false).await.map(|_| ())
    }

    /// Every address currently registered for `tag`.
    pub async fn get_addresses(&self, tag: &str) -> Result<Vec<PeerAddress>> {
        let reply = self.send_order(&Order::Get(tag.to_string()), true).await?;
        let Some(value) = reply else {
            return Ok(Vec::new());
        };
        let mut snapshot: LinkerSnapshot = match serde_json::from_value(value) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("could not read the reply from the synchronisation server: {e}");
                return Ok(Vec::new());
            }
        };
        Ok(snapshot.remove(tag).unwrap_or_default())
    }

    /// Send one order, optionally reading the single reply.
    ///
    /// Orders are fire-and-forget: a failure surfaces as
    /// [`Error::CommunicationClosed`] but the dropped connection is rebuilt
    /// on the next call.
    pub async fn send_order(
        &self,
        order: &Order,
        expect_reply: bool,
    ) -> Result<Option<serde_json::Value>> {
        let mut state = self.state.lock().await;

        if state.connection.as_ref().is_none_or(|c| !c.is_alive()) {
            let Some(server) = state.server.clone() else {
                return Err(Error::CommunicationClosed);
            };
            match Connection::connect(&server, self.timeout).await {
                Ok(connection) => {
                    debug!("reconnected to the synchronisation server at {server}");
                    state.connection = Some(connection);
                }
                Err(_) => {
                    state.connection = None;
                    return Err(Error::CommunicationClosed);
                }
            }
        }

        let sent = state
            .connection
            .as_ref()
            .expect("connection was just established")
            .send(order.to_json().as_bytes())
            .await;
        if sent.is_err() {
            state.connection = None;
            return Err(Error::CommunicationClosed);
        }

        if !expect_reply {
            return Ok(None);
        }

        let received = state
            .connection
            .as_ref()
            .expect("connection was just used")
            .recv()
            .await;
        match received {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!("could not parse the synchronisation server reply: {e}");
                    Ok(None)
                }
            },
            Err(_) => {
                state.connection = None;
                Err(Error::CommunicationClosed)
            }
        }
    }
}
