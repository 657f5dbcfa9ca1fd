//! # Peer Protocol
//!
//! Typed packet exchange between two peers over TCP, with optional UDP child
//! connections and optional end-to-end encryption.
//!
//! Packets are serde structs implementing [`Packet`]. Peers do not need to
//! agree on wire ids up front: the first time a packet type is sent, its
//! [`Assembly`] is announced and the peer answers with the ids it can
//! decode. Until that answer arrives the packet waits, so nothing ever
//! reaches the peer under an id it does not know.
//!
//! ## Architecture
//! - **core**: framing, codec, serialization and packet conversion
//! - **protocol**: packet model, built-in packets, assemblies, type and handler registries
//! - **connection**: the read, dispatch and write loops, keepalive, request correlation
//! - **transport**: TCP server/client and UDP sockets
//! - **utils**: crypto, logging, statistics and timeouts
//!
//! ## Example
//! ```rust,no_run
//! use peer_protocol::{connect, Assembly, AssemblyCatalog, ConnectionConfig, Packet, PacketHeader};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct Chat {
//!     header: PacketHeader,
//!     text: String,
//! }
//!
//! impl Packet for Chat {
//!     const NAME: &'static str = "chat.Chat";
//!     fn header(&self) -> &PacketHeader { &self.header }
//!     fn header_mut(&mut self) -> &mut PacketHeader { &mut self.header }
//! }
//!
//! # async fn run() -> peer_protocol::Result<()> {
//! let catalog = AssemblyCatalog::with_assemblies([Assembly::new("chat").with::<Chat>()])?;
//! let connection = connect("127.0.0.1:7000", ConnectionConfig::default(), catalog).await?;
//! connection.send(Chat { text: "hello".into(), ..Default::default() });
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::{ConnectionConfig, NetworkConfig};
pub use connection::{CloseReason, Connection, ConnectionRole, ConnectionState, TransportKind};
pub use core::serialization::SerializationFormat;
pub use error::{ProtocolError, Result};
pub use protocol::assembly::{Assembly, AssemblyCatalog};
pub use protocol::dispatcher::HandlerScope;
pub use protocol::packet::{Packet, PacketHeader, PacketState, RequestPacket};
pub use protocol::raw::RawData;
pub use transport::tcp::{connect, connect_with_config, connect_with_timeout, serve, TcpServer};
