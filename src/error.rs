//! Error taxonomy shared across the fabric.
//!
//! Background loops never surface these — they log, tear down the local
//! resource, and end. User-facing operations either validate synchronously
//! (`Configuration`, `LengthExceeded`) or report a dead transport
//! (`CommunicationClosed`), which is final for the object that raised it.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The underlying stream is gone. Any further use of the transport
    /// that reported this fails the same way.
    #[error("communication closed")]
    CommunicationClosed,

    /// Rejected radio configuration, raised synchronously from `configure`.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// `send_bytes` was handed a message longer than the configured length.
    #[error("message length {length} exceeds the configured maximum of {max} bytes")]
    LengthExceeded { length: usize, max: usize },

    /// `receive` could not turn the queued bytes into a string.
    #[error("conversion from bytes to string failed: {0}")]
    Conversion(String),

    /// `on()` scanned every port from the configured base upwards without
    /// finding a free one.
    #[error("no free port available from base port {base}")]
    PortsExhausted { base: u16 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
