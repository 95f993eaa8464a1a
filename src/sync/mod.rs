//! The synchronisation service: a replicated registry of `(address, tag)`
//! entries, its gossip protocol, and the client that mutates it.

pub mod client;
pub mod linker;
pub mod order;
pub mod server;

pub use client::SyncClient;
pub use linker::{AddressesLinker, LinkerSnapshot};
pub use order::Order;
pub use server::{SyncServer, SyncServerHandle, SyncServerOptions};
