//! Process-wide radio glue.
//!
//! Mirrors the board API: one radio per process, created lazily, with
//! module-level functions forwarding to it. The first call to [`on`] also
//! makes sure a fabric broker is reachable on this host by starting one
//! in-process — losing the bind race just means another process already
//! provides it.

use std::sync::OnceLock;
use std::time::Duration;

use log::debug;
use tokio::time::sleep;

use crate::error::Result;
use crate::radio::broker::RadioBroker;
use crate::radio::remote::Radio;
use crate::radio::{MailboxEntry, RadioConfig};

pub const DEFAULT_FABRIC_HOST: &str = "localhost";
pub const DEFAULT_FABRIC_PORT: u16 = 8766;

static RADIO: OnceLock<Radio> = OnceLock::new();
static FABRIC: OnceLock<()> = OnceLock::new();

fn radio() -> &'static Radio {
    RADIO.get_or_init(|| Radio::new(DEFAULT_FABRIC_HOST, DEFAULT_FABRIC_PORT))
}

fn ensure_fabric() {
    FABRIC.get_or_init(|| {
        tokio::spawn(async {
            match RadioBroker::start(DEFAULT_FABRIC_HOST, DEFAULT_FABRIC_PORT).await {
                Ok(handle) => {
                    debug!("started the in-process fabric broker");
                    // Runs for the rest of the process.
                    std::mem::forget(handle);
                }
                Err(e) => debug!("fabric broker already provided: {e}"),
            }
        });
    });
}

/// Turn the process radio on, starting the fabric if needed.
pub async fn on() -> Result<()> {
    ensure_fabric();
    // The in-process broker may still be binding.
    let mut attempts = 0;
    loop {
        match radio().on().await {
            Ok(()) => return Ok(()),
            Err(_) if attempts < 20 => {
                attempts += 1;
                sleep(Duration::from_millis(50)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Turn the process radio off.
pub async fn off() {
    radio().off().await;
}

/// Reconfigure the process radio.
pub async fn config(config: RadioConfig) -> Result<()> {
    radio().configure(config).await
}

/// Reset the process radio to its default configuration.
pub async fn reset() -> Result<()> {
    radio().reset().await
}

/// Send a string message.
pub async fn send(message: &str) -> Result<()> {
    radio().send(message).await
}

/// Send a raw byte message.
pub async fn send_bytes(message: &[u8]) -> Result<()> {
    radio().send_bytes(message).await
}

/// Receive the next string message, if any.
pub fn receive() -> Result<Option<String>> {
    radio().receive()
}

/// Receive the next byte message, if any.
pub fn receive_bytes() -> Option<Vec<u8>> {
    radio().receive_bytes()
}

/// Receive the next byte message into `buffer`, returning its full length.
pub fn receive_bytes_into(buffer: &mut [u8]) -> Option<usize> {
    radio().receive_bytes_into(buffer)
}

/// Receive the next message with its signal strength and timestamp.
pub fn receive_full() -> Option<MailboxEntry> {
    radio().receive_full()
}
