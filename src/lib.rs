//! Networked device fabric for micro:bit simulators.
//!
//! Lets independent simulator processes — possibly on different hosts of a
//! LAN — discover each other and exchange small framed messages as if they
//! shared a 2.4 GHz short-range radio.
//!
//! ## Architecture
//!
//! ```text
//!  ┌───────────────────────────────────────────────────────────────────┐
//!  │  radio (user primitive)                                           │
//!  │    send / receive, (address, channel, group) filter, mailbox      │
//!  │                                                                   │
//!  │   broker topology                 mesh topology                   │
//!  │  ┌──────────────┐       ┌───────────────────────────────────┐     │
//!  │  │ remote::Radio│       │ lan::LanRadio                     │     │
//!  │  │  websocket ─►│broker │  framed TCP peers ◄─ sync service │     │
//!  │  └──────────────┘       └───────────────────────────────────┘     │
//!  │                                                                   │
//!  │  sync: replicated address → tag registry, gossiped over the LAN   │
//!  │  protocol: frame codec, command model, peer transports            │
//!  │  net: framed connections, accept servers, interface enumeration   │
//!  └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The broker is the production path; the serverless gossip mesh is the
//! fallback for LANs where no broker address is known.

pub mod config;
pub mod error;
pub mod fabric;
pub mod net;
pub mod protocol;
pub mod radio;
pub mod sync;

pub use config::FabricConfig;
pub use error::{Error, Result};
pub use net::PeerAddress;
pub use protocol::{MicrobitCommand, MicrobitPeer};
pub use radio::broker::{BrokerHandle, RadioBroker};
pub use radio::lan::{LanRadio, LanRadioOptions};
pub use radio::remote::Radio;
pub use radio::{MailboxEntry, RadioConfig, RATE_1MBIT, RATE_250KBIT, RATE_2MBIT};
pub use sync::{AddressesLinker, SyncClient, SyncServer, SyncServerHandle, SyncServerOptions};
