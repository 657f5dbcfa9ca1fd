//! # Protocol Layer
//!
//! Packet model, wire id negotiation and handler routing.
//!
//! ## Components
//! - **Packet**: the `Packet` trait, headers and the type-erased `AnyPacket`
//! - **Builtin**: control packets with fixed ids 0-12
//! - **Raw**: key/bytes packets for primitive values
//! - **Assembly**: named packet groups and the process-wide catalog
//! - **Registry**: per-connection wire id tables
//! - **Dispatcher**: handler registry with the unhandled-packet buffer
//! - **Handshake**: x25519 key exchange for encrypted connections

pub mod assembly;
pub mod builtin;
pub mod dispatcher;
pub mod handshake;
pub mod packet;
pub mod raw;
pub mod registry;

#[cfg(test)]
mod tests;
