//! # Error Types
//!
//! Error handling for the peer protocol.
//!
//! This module defines the error variants that can occur inside the protocol
//! engine, from low-level I/O failures to type-registry and handshake problems.
//!
//! ## Error Categories
//! - **I/O Errors**: socket and file system failures
//! - **Framing Errors**: malformed headers, oversized frames
//! - **Registry Errors**: unknown wire ids, unregistered packet types, missing assemblies
//! - **Cryptographic Errors**: key exchange and AEAD failures
//!
//! Errors never cross the `send` API of a connection. Inside the engine they are
//! turned into a [`CloseReason`](crate::connection::CloseReason) or a
//! [`PacketState`](crate::protocol::packet::PacketState).
//!
//! ## Example Usage
//! ```rust
//! use peer_protocol::error::{ProtocolError, Result};
//!
//! fn parse_port(raw: &str) -> Result<u16> {
//!     raw.parse::<u16>()
//!         .map_err(|e| ProtocolError::ConfigError(format!("invalid port: {e}")))
//! }
//!
//! assert!(parse_port("9000").is_ok());
//! assert!(parse_port("nine").is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Registry lock errors
    pub const ERR_TYPE_REGISTRY_LOCK: &str = "Failed to acquire lock on packet type registry";
    pub const ERR_HANDLER_REGISTRY_LOCK: &str = "Failed to acquire lock on handler registry";
    pub const ERR_CATALOG_LOCK: &str = "Failed to acquire lock on assembly catalog";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Payload errors
    pub const ERR_EMPTY_PAYLOAD: &str = "Empty payload";

    /// Connection errors
    pub const ERR_CONNECT_TIMEOUT: &str = "Timed out connecting to peer";

    /// Cryptographic errors
    pub const ERR_NO_SESSION_KEY: &str = "Encrypted frame received before key exchange completed";
    pub const ERR_KEY_EXCHANGE_STATE: &str = "Key exchange response without a pending request";

    /// Handler errors
    pub const ERR_HANDLER_TYPE_MISMATCH: &str = "Handler invoked with a packet of another type";

    /// UDP establishment errors
    pub const ERR_UDP_NOT_TCP: &str = "UDP sub-connections can only be spawned from TCP connections";
    pub const ERR_UDP_PENDING: &str = "A UDP establishment is already in progress";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Frame too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Unknown wire id: {0}")]
    UnknownPacketType(u16),

    #[error("Packet type `{0}` is not part of any registered assembly")]
    UnregisteredPacket(&'static str),

    #[error("Assembly `{0}` is not available")]
    AssemblyNotFound(String),

    #[error("Wire id {id} already used by `{existing}`, cannot assign it to `{requested}`")]
    WireIdConflict {
        id: u16,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("Wire id space exhausted")]
    WireIdExhausted,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Map a poisoned lock into a protocol error carrying `context`
    pub(crate) fn poisoned(context: &'static str) -> Self {
        ProtocolError::Custom(format!("{context}: {}", constants::ERR_LOCK_POISONED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let err: ProtocolError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, ProtocolError::Io(_)));
        assert!(err.to_string().contains("pipe"));
    }

    #[test]
    fn test_wire_id_conflict_display() {
        let err = ProtocolError::WireIdConflict {
            id: 120,
            existing: "Login",
            requested: "Logout",
        };
        assert_eq!(
            err.to_string(),
            "Wire id 120 already used by `Login`, cannot assign it to `Logout`"
        );
    }

    #[test]
    fn test_poisoned_message() {
        let err = ProtocolError::poisoned(constants::ERR_TYPE_REGISTRY_LOCK);
        assert!(err.to_string().contains("poisoned"));
    }
}
