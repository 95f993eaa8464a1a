//! TCP plumbing: framed connections, accept servers, and interface
//! enumeration for LAN discovery.

pub mod connection;
pub mod interfaces;

pub use connection::{Connection, ConnectionServer};

use std::fmt;

use serde::{Deserialize, Serialize};

/// A network endpoint as the fabric names it: `(host, port)`.
///
/// Serialises as the two-element JSON array `["host", port]` used by the
/// linker and order wire formats. Equality is pairwise; `localhost` and
/// `127.0.0.1` are only unified by the loopback checks in
/// [`interfaces::loopback_aliases`], never here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress(pub String, pub u16);

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        PeerAddress(host.into(), port)
    }

    pub fn host(&self) -> &str {
        &self.0
    }

    pub fn port(&self) -> u16 {
        self.1
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}
