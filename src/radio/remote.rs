//! Broker-topology radio: one WebSocket peer to the fabric broker.
//!
//! Sending hands the command to the broker, which fans it out; the broker
//! does no filtering, so the listener here keeps only the broadcasts whose
//! `(address, channel, group)` match this radio's tuning. Losing the
//! fabric connection turns the radio off.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::protocol::command::{MicrobitCommand, RadioSendBytes};
use crate::protocol::peer::{ExitStatus, MicrobitPeer, WebsocketPeer};
use crate::radio::{admit, decode_text_message, Mailbox, MailboxEntry, RadioConfig, MESSAGE_PREFIX};

#[derive(Clone)]
pub struct Radio {
    inner: Arc<RemoteInner>,
}

struct RemoteInner {
    host: String,
    port: u16,
    config: Mutex<RadioConfig>,
    mailbox: Mailbox,
    peer: Mutex<Option<Arc<WebsocketPeer>>>,
    // Serialises on/off/configure transitions.
    ops: AsyncMutex<()>,
}

impl Radio {
    /// A radio that will connect to the fabric broker at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let config = RadioConfig::default();
        let mailbox = Mailbox::new(config.queue);
        Radio {
            inner: Arc::new(RemoteInner {
                host: host.into(),
                port,
                config: Mutex::new(config),
                mailbox,
                peer: Mutex::new(None),
                ops: AsyncMutex::new(()),
            }),
        }
    }

    pub fn is_on(&self) -> bool {
        self.inner.peer.lock().is_some()
    }

    /// Enable the radio: connect to the broker and start listening.
    pub async fn on(&self) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        if self.inner.peer.lock().is_some() {
            return Ok(());
        }

        let peer = Arc::new(WebsocketPeer::connect(&self.inner.host, self.inner.port).await?);

        let weak = Arc::downgrade(&self.inner);
        peer.add_listener(move |command| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let config = inner.config.lock().clone();
            if let Some(entry) = admit(command, &config) {
                if !inner.mailbox.push(entry) {
                    debug!("mailbox full, dropping broadcast");
                }
            }
        });

        *self.inner.peer.lock() = Some(peer.clone());

        let radio = self.clone();
        tokio::spawn(async move {
            if let Err(e) = peer.listen().await {
                debug!("fabric connection lost: {e}");
            }
            // Whatever ended the loop, the fabric is gone for this radio.
            radio.off().await;
        });
        Ok(())
    }

    /// Disable the radio, closing the fabric connection.
    pub async fn off(&self) {
        let _ops = self.inner.ops.lock().await;
        let Some(peer) = self.inner.peer.lock().take() else {
            return;
        };
        peer.stop();
        peer.close(ExitStatus::Success, "").await;
    }

    /// Apply a new configuration, resetting the mailbox.
    pub async fn configure(&self, config: RadioConfig) -> Result<()> {
        config.validate()?;
        let _ops = self.inner.ops.lock().await;
        *self.inner.config.lock() = config.clone();
        self.inner.mailbox.reset(config.queue);
        Ok(())
    }

    /// Back to the defaults.
    pub async fn reset(&self) -> Result<()> {
        self.configure(RadioConfig::default()).await
    }

    /// Broadcast raw bytes through the fabric. Inert while off.
    pub async fn send_bytes(&self, message: &[u8]) -> Result<()> {
        let Some(peer) = self.inner.peer.lock().clone() else {
            return Ok(());
        };
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
        peer.send_command(&command).await
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

    /// Pop the next message, or `None` when empty or off.
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
