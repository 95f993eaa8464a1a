//! The radio: a packet-level broadcast primitive with filtering and a
//! bounded mailbox.
//!
//! Two topologies share everything in this module:
//!
//! - [`lan::LanRadio`] — a serverless mesh; radios find each other through
//!   the synchronisation service and connect pairwise over framed TCP.
//! - [`remote::Radio`] — the production path; radios connect to a central
//!   [`broker::RadioBroker`] that rebroadcasts every command.
//!
//! In both, filtering happens on the *receiving* radio: an inbound
//! `radio.send_bytes` lands in the mailbox only when its
//! `(address, channel, group)` triple matches the receiver's configuration
//! and the mailbox has room.

pub mod broker;
pub mod lan;
pub mod remote;

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::protocol::command::{
    MicrobitCommand, RadioSendBytes, MAX_ADDRESS, MAX_CHANNEL, MAX_LENGTH, MAX_POWER, MIN_LENGTH,
};

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Deprecated micro:bit V1 data rate, kept for compatibility.
pub const RATE_250KBIT: u32 = 250;
/// 1 Mbit/s throughput.
pub const RATE_1MBIT: u32 = 1000;
/// 2 Mbit/s throughput.
pub const RATE_2MBIT: u32 = 2000;

/// Prefix `send` puts in front of UTF-8 text so string messages
/// interoperate with other platforms targeting the micro:bit.
pub const MESSAGE_PREFIX: [u8; 3] = [0x01, 0x00, 0x01];

/// Reported signal strength is a monotonic inverse of the sender's nominal
/// power: `(MAX_POWER − power) × 8`.
const INVERT_POWER_TO_RSSI: i32 = 8;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Keyword settings of the radio, with the MicroPython defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioConfig {
    /// Maximum message length in bytes, 1..=254.
    pub length: usize,
    /// Mailbox capacity, at least 1.
    pub queue: usize,
    /// Channel the radio is tuned to, 0..=83.
    pub channel: u8,
    /// Nominal transmit power, 0..=7.
    pub power: u8,
    /// 32-bit filter address, at most `0x7fffffff`.
    pub address: u32,
    /// 8-bit group used with the address when filtering.
    pub group: u8,
    /// One of `RATE_250KBIT`, `RATE_1MBIT`, `RATE_2MBIT`.
    pub data_rate: u32,
}

impl Default for RadioConfig {
    fn default() -> Self {
        RadioConfig {
            length: 32,
            queue: 3,
            channel: 7,
            power: 6,
            address: 0x75626974,
            group: 0,
            data_rate: RATE_1MBIT,
        }
    }
}

impl RadioConfig {
    /// Check every field range, reporting the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.length < MIN_LENGTH || self.length > MAX_LENGTH {
            return Err(Error::Configuration(format!(
                "length must be between {MIN_LENGTH} and {MAX_LENGTH}, got {}",
                self.length
            )));
        }
        if self.queue < 1 {
            return Err(Error::Configuration("queue must be at least 1".to_string()));
        }
        if self.channel > MAX_CHANNEL {
            return Err(Error::Configuration(format!(
                "channel must be between 0 and {MAX_CHANNEL}, got {}",
                self.channel
            )));
        }
        if self.power > MAX_POWER {
            return Err(Error::Configuration(format!(
                "power must be between 0 and {MAX_POWER}, got {}",
                self.power
            )));
        }
        if self.address > MAX_ADDRESS {
            return Err(Error::Configuration(format!(
                "address must be between 0 and {MAX_ADDRESS}, got {}",
                self.address
            )));
        }
        if ![RATE_250KBIT, RATE_1MBIT, RATE_2MBIT].contains(&self.data_rate) {
            return Err(Error::Configuration(format!(
                "data_rate must be RATE_250KBIT, RATE_1MBIT or RATE_2MBIT, got {}",
                self.data_rate
            )));
        }
        Ok(())
    }

    /// The registry tag for this tuning: `channel<N>group<M>`.
    pub fn tag(&self) -> String {
        format!("channel{}group{}", self.channel, self.group)
    }

    /// Whether an inbound broadcast belongs to this tuning.
    pub fn admits(&self, command: &RadioSendBytes) -> bool {
        command.address == self.address
            && command.channel == self.channel
            && command.group == self.group
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Mailbox
// ────────────────────────────────────────────────────────────────────────────

/// One received broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxEntry {
    pub message: Vec<u8>,
    pub rssi: i32,
    pub timestamp_us: u64,
}

/// Bounded FIFO of received messages.
///
/// Overflow policy: **drop-newest** — a message arriving at a full mailbox
/// is discarded, the queued ones survive.
pub struct Mailbox {
    inner: Mutex<MailboxInner>,
}

struct MailboxInner {
    entries: VecDeque<MailboxEntry>,
    capacity: usize,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Mailbox {
            inner: Mutex::new(MailboxInner {
                entries: VecDeque::with_capacity(capacity),
                capacity,
            }),
        }
    }

    /// Enqueue unless full. Returns whether the entry was kept.
    pub fn push(&self, entry: MailboxEntry) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.len() >= inner.capacity {
            return false;
        }
        inner.entries.push_back(entry);
        true
    }

    /// Non-blocking pop in FIFO order.
    pub fn pop(&self) -> Option<MailboxEntry> {
        self.inner.lock().entries.pop_front()
    }

    /// Drop everything and adopt a new capacity.
    pub fn reset(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.capacity = capacity;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared receive path
// ────────────────────────────────────────────────────────────────────────────

/// Turn an inbound command into a mailbox entry when it passes the
/// `(address, channel, group)` filter; anything else is dropped here.
pub(crate) fn admit(command: &MicrobitCommand, config: &RadioConfig) -> Option<MailboxEntry> {
    let MicrobitCommand::RadioSendBytes(payload) = command else {
        return None;
    };
    if !config.admits(payload) {
        return None;
    }
    Some(MailboxEntry {
        message: payload.message.clone(),
        rssi: (i32::from(MAX_POWER) - i32::from(payload.power)) * INVERT_POWER_TO_RSSI,
        timestamp_us: now_micros(),
    })
}

/// Strip the string-envelope prefix and decode UTF-8.
pub(crate) fn decode_text_message(message: Vec<u8>) -> Result<String> {
    if !message.starts_with(&MESSAGE_PREFIX) {
        return Err(Error::Conversion(
            "message does not start with \\x01\\x00\\x01".to_string(),
        ));
    }
    String::from_utf8(message[MESSAGE_PREFIX.len()..].to_vec())
        .map_err(|e| Error::Conversion(e.to_string()))
}

/// Current time as microseconds since the UNIX epoch.
fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
